use std::fs::File;
use std::fs::OpenOptions;
use std::io;
use std::os::raw::c_ulong;
use std::path::Path;
use std::path::PathBuf;

use error_stack::Report;
use error_stack::ResultExt;
use once_cell::unsync::OnceCell;
use tracing::debug;

use super::find_sysfs_device;
use super::ioctl;
use super::DeviceError;
use super::DeviceResult;
use crate::pci::PciDevice;
use crate::sysfs;

/// An opened FPGA character device together with its lazily resolved sysfs
/// entry and PCI function.
#[derive(Debug)]
pub(crate) struct DeviceNode {
    dev_path: PathBuf,
    file: File,
    sysfs_path: OnceCell<PathBuf>,
    pci: OnceCell<PciDevice>,
}

impl DeviceNode {
    /// Opens `dev_path` read-write and negotiates the driver API version.
    ///
    /// A node that does not answer the version query is closed and rejected.
    pub(crate) fn open(dev_path: &Path) -> DeviceResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(dev_path)
            .change_context_lazy(|| DeviceError::Open {
                path: dev_path.to_path_buf(),
            })?;

        let node = Self::from_file(dev_path, file);
        let version = node
            .api_version()
            .change_context_lazy(|| DeviceError::ApiMismatch {
                path: dev_path.to_path_buf(),
            })?;
        debug!(dev = %dev_path.display(), version, "opened FPGA device node");

        Ok(node)
    }

    pub(crate) fn from_file(dev_path: &Path, file: File) -> Self {
        Self {
            dev_path: dev_path.to_path_buf(),
            file,
            sysfs_path: OnceCell::new(),
            pci: OnceCell::new(),
        }
    }

    /// Node whose sysfs entry is already known, skipping the `/sys/dev` lookup.
    #[cfg(test)]
    pub(crate) fn with_sysfs(dev_path: &Path, file: File, sysfs_path: PathBuf) -> Self {
        let node = Self::from_file(dev_path, file);
        let _ = node.sysfs_path.set(sysfs_path);
        node
    }

    pub(crate) fn dev_path(&self) -> &Path {
        &self.dev_path
    }

    pub(crate) fn api_version(&self) -> DeviceResult<i32> {
        self.call("FPGA_GET_API_VERSION", |file| {
            ioctl::ioctl_none(file, ioctl::FPGA_GET_API_VERSION)
        })
    }

    pub(crate) fn check_extension(&self) -> DeviceResult<i32> {
        self.call("FPGA_CHECK_EXTENSION", |file| {
            ioctl::ioctl_none(file, ioctl::FPGA_CHECK_EXTENSION)
        })
    }

    pub(crate) fn ioctl_none(&self, name: &'static str, request: c_ulong) -> DeviceResult<i32> {
        self.call(name, |file| ioctl::ioctl_none(file, request))
    }

    pub(crate) fn ioctl_with<T>(
        &self,
        name: &'static str,
        request: c_ulong,
        arg: &mut T,
    ) -> DeviceResult<i32> {
        self.call(name, |file| ioctl::ioctl_with(file, request, arg))
    }

    fn call(
        &self,
        name: &'static str,
        f: impl FnOnce(&File) -> io::Result<i32>,
    ) -> DeviceResult<i32> {
        f(&self.file).change_context_lazy(|| DeviceError::Ioctl {
            request: name,
            path: self.dev_path.clone(),
        })
    }

    /// Sysfs directory of the node, resolved through `/sys/dev` once.
    pub(crate) fn sysfs_path(&self) -> DeviceResult<&Path> {
        self.sysfs_path
            .get_or_try_init(|| -> DeviceResult<PathBuf> {
                find_sysfs_device(&self.dev_path)?.ok_or_else(|| {
                    Report::new(DeviceError::Sysfs {
                        path: self.dev_path.clone(),
                    })
                    .attach_printable("device node does not exist")
                })
            })
            .map(PathBuf::as_path)
    }

    /// Kernel name of the device, e.g. `dfl-port.0`.
    pub(crate) fn name(&self) -> DeviceResult<String> {
        Ok(sysfs::clean_basename(self.sysfs_path()?))
    }

    pub(crate) fn pci_device(&self) -> DeviceResult<&PciDevice> {
        self.pci.get_or_try_init(|| -> DeviceResult<PciDevice> {
            let sysfs_path = self.sysfs_path()?;
            PciDevice::from_sysfs(sysfs_path).change_context_lazy(|| DeviceError::Sysfs {
                path: sysfs_path.to_path_buf(),
            })
        })
    }
}
