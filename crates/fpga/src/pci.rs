//! Resolves sysfs entries to their owning PCI function.

use std::fs;
use std::path::Path;
use std::path::PathBuf;

use error_stack::Report;
use error_stack::ResultExt;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use crate::sysfs;
use crate::sysfs::SysfsError;
use crate::sysfs::SysfsResult;

/// Matches a PCI address such as `0000:3b:00.0`.
static PCI_ADDRESS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([[:xdigit:]]{4}):([[:xdigit:]]{2}):([[:xdigit:]]{2})\.([0-7])$")
        .expect("Invalid PCI address regex")
});

/// A PCI function as seen through sysfs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PciDevice {
    pub sysfs_path: PathBuf,
    /// Bus:Device.Function address, e.g. `0000:3b:00.0`
    pub bdf: String,
    pub vendor: String,
    pub device: String,
    pub class: String,
    pub cpus: String,
    pub numa: String,
    pub vfs: String,
    pub total_vfs: String,
    /// Physical function owning this device when it is a virtual function.
    pub phys_fn: Option<Box<PciDevice>>,
}

impl PciDevice {
    /// Builds the PCI device owning `dev_path`.
    ///
    /// The path is resolved and walked upward until a component named like a
    /// PCI address is found.
    pub fn from_sysfs(dev_path: &Path) -> SysfsResult<Self> {
        let real_path = sysfs::resolve(dev_path)?;

        let (sysfs_path, bdf) = real_path
            .ancestors()
            .find_map(|p| {
                let name = p.file_name()?.to_str()?;
                PCI_ADDRESS_RE
                    .is_match(name)
                    .then(|| (p.to_path_buf(), name.to_string()))
            })
            .ok_or_else(|| {
                Report::new(SysfsError::NotFound {
                    pattern: format!("PCI address above {}", real_path.display()),
                    matches: 0,
                })
            })?;

        let read = |name: &str| -> SysfsResult<String> {
            Ok(sysfs::read_optional(&sysfs_path, name)?.unwrap_or_default())
        };

        let mut pci = Self {
            vendor: read("vendor")?,
            device: read("device")?,
            class: read("class")?,
            cpus: read("local_cpulist")?,
            numa: read("numa_node")?,
            vfs: read("sriov_numvfs")?,
            total_vfs: read("sriov_totalvfs")?,
            sysfs_path,
            bdf,
            phys_fn: None,
        };

        if pci.vendor.is_empty() || pci.device.is_empty() {
            return Err(Report::new(SysfsError::InvalidValue {
                path: pci.sysfs_path.clone(),
                value: format!("{}/{}", pci.vendor, pci.device),
            })
            .attach_printable("vendor or device id can't be empty"));
        }

        // a missing physfn link just means this is a physical function
        let physfn = pci.sysfs_path.join("physfn");
        if fs::symlink_metadata(&physfn).is_ok() {
            pci.phys_fn = Some(Box::new(Self::from_sysfs(&physfn).attach_printable_lazy(
                || format!("resolving physical function of {}", pci.bdf),
            )?));
        }

        debug!(
            bdf = %pci.bdf,
            vendor = %pci.vendor,
            device = %pci.device,
            class = %pci.class,
            "resolved PCI device"
        );

        Ok(pci)
    }

    /// Number of enabled virtual functions, `None` if SR-IOV is not reported.
    pub fn num_vfs(&self) -> Option<u32> {
        self.vfs.parse().ok()
    }

    /// Returns the enabled virtual functions of this device.
    pub fn vfs(&self) -> SysfsResult<Vec<PciDevice>> {
        if self.num_vfs().unwrap_or(0) == 0 {
            return Ok(Vec::new());
        }

        let mut links: Vec<PathBuf> = sysfs::list_dir(&self.sysfs_path)?
            .into_iter()
            .filter(|name| name.starts_with("virtfn"))
            .map(|name| self.sysfs_path.join(name))
            .collect();
        links.sort_by_key(|p| virtfn_index(p));

        links.iter().map(|link| Self::from_sysfs(link)).collect()
    }

    /// Returns the physical function, or the device itself if it is one.
    pub fn physical_function(&self) -> &PciDevice {
        self.phys_fn.as_deref().unwrap_or(self)
    }

    /// Bus, device and function parts of the address.
    pub fn bus_device_function(&self) -> Option<(&str, &str, &str)> {
        let caps = PCI_ADDRESS_RE.captures(&self.bdf)?;
        Some((
            caps.get(2)?.as_str(),
            caps.get(3)?.as_str(),
            caps.get(4)?.as_str(),
        ))
    }
}

fn virtfn_index(path: &Path) -> u32 {
    path.file_name()
        .and_then(|n| n.to_str())
        .and_then(|n| n.strip_prefix("virtfn"))
        .and_then(|n| n.parse().ok())
        .unwrap_or(u32::MAX)
}
