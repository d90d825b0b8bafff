//! FPGA management engine (FME) and port handles over the two kernel driver
//! ABIs: the upstream DFL driver and the legacy intel-fpga driver.
//!
//! Handles are opened per operation. The driver flavour is picked once from
//! the device node name and never mixed for one physical device.

use core::error::Error;
use std::fmt;
use std::fs;
use std::io;
use std::os::unix::fs::FileTypeExt;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::path::PathBuf;

use error_stack::Report;
use error_stack::ResultExt;
use tracing::debug;

use crate::bitstream::Bitstream;
use crate::pci::PciDevice;
use crate::reconfig;
use crate::reconfig::Outcome;
use crate::sysfs;

mod dfl;
pub mod ioctl;
mod intel;
mod node;

pub use crate::identity::canonize_id;
pub use dfl::DflFme;
pub use dfl::DflPort;
pub use intel::IntelFpgaFme;
pub use intel::IntelFpgaPort;

pub const VENDOR_INTEL: &str = "0x8086";
pub const FPGA_CLASS: &str = "0x120000";

pub const DFL_FME_PREFIX: &str = "dfl-fme.";
pub const DFL_PORT_PREFIX: &str = "dfl-port.";
pub const INTEL_FME_PREFIX: &str = "intel-fpga-fme.";
pub const INTEL_PORT_PREFIX: &str = "intel-fpga-port.";

const DEV_DIR: &str = "/dev";
const SYS_DIR: &str = "/sys";

pub type DeviceResult<T> = Result<T, Report<DeviceError>>;

#[derive(Debug, derive_more::Display)]
pub enum DeviceError {
    #[display("unable to open device {}", path.display())]
    Open { path: PathBuf },
    #[display("kernel API mismatch for {}", path.display())]
    ApiMismatch { path: PathBuf },
    #[display("{request} failed on {}", path.display())]
    Ioctl {
        request: &'static str,
        path: PathBuf,
    },
    #[display("unsupported PCI device {bdf} VID={vendor} PID={device} Class={class}")]
    UnsupportedPciDevice {
        bdf: String,
        vendor: String,
        device: String,
        class: String,
    },
    #[display("unknown type of FPGA {kind} {}", path.display())]
    UnknownType { kind: &'static str, path: PathBuf },
    #[display("unable to resolve sysfs entry of {}", path.display())]
    Sysfs { path: PathBuf },
    #[display("{attribute} is not available for {}", path.display())]
    MissingAttribute {
        attribute: &'static str,
        path: PathBuf,
    },
    #[display("{} is a virtual device node", path.display())]
    VirtualDevice { path: PathBuf },
    #[display("FME interface UUID {fme:?} is not compatible with bitstream UUID {bitstream:?}")]
    IncompatibleInterface { fme: String, bitstream: String },
    #[display("unable to read bitstream payload")]
    Bitstream,
    #[display("bitstream AFU UUID {bitstream:?} does not match requested {requested:?}")]
    AfuMismatch { requested: String, bitstream: String },
    #[display("programmed function {programmed} instead of {requested}")]
    UnexpectedAfu { programmed: String, requested: String },
}

impl Error for DeviceError {}

/// Port state as reported by the port info ioctl.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PortInfo {
    pub flags: u32,
    pub num_regions: u32,
    pub num_umsgs: u32,
}

/// One MMIO region of a port.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PortRegionInfo {
    pub flags: u32,
    pub index: u32,
    pub size: u64,
    pub offset: u64,
}

/// Operations shared by FME and port handles.
pub trait FpgaDevice: fmt::Debug {
    /// Driver API version. Must succeed before any other call is trusted.
    fn api_version(&self) -> DeviceResult<i32>;

    /// Non-zero when the queried extension is supported.
    fn check_extension(&self) -> DeviceResult<i32>;

    fn dev_path(&self) -> &Path;

    /// Sysfs directory of the device, resolved once and cached.
    fn sysfs_path(&self) -> DeviceResult<&Path>;

    /// Kernel device name such as `dfl-fme.0`.
    fn name(&self) -> DeviceResult<String>;

    /// PCI function backing the device, resolved once and cached.
    fn pci_device(&self) -> DeviceResult<&PciDevice>;
}

/// FPGA management engine.
pub trait Fme: FpgaDevice {
    /// Partially reconfigures the region behind `port_id` with `bitstream`.
    fn port_pr(&self, port_id: u32, bitstream: &[u8]) -> DeviceResult<()>;

    fn ports_num(&self) -> DeviceResult<u32>;

    /// Normalized interface UUID of the currently loaded FPGA shell.
    fn interface_uuid(&self) -> DeviceResult<String>;

    fn bitstream_id(&self) -> DeviceResult<String>;

    fn bitstream_metadata(&self) -> DeviceResult<String>;

    fn socket_id(&self) -> DeviceResult<u32>;
}

/// Accelerator function unit port.
pub trait Port: FpgaDevice {
    fn reset(&self) -> DeviceResult<()>;

    fn info(&self) -> DeviceResult<PortInfo>;

    fn region_info(&self, index: u32) -> DeviceResult<PortRegionInfo>;

    /// Opens the FME owning this port. The handle is scoped to the caller.
    fn fme(&self) -> DeviceResult<Box<dyn Fme>>;

    fn port_id(&self) -> DeviceResult<u32>;

    /// AFU UUID of the image currently loaded behind the port.
    fn accelerator_type_uuid(&self) -> DeviceResult<String>;

    fn interface_uuid(&self) -> DeviceResult<String> {
        self.fme()?.interface_uuid()
    }

    /// Programs `bitstream` into the region behind this port.
    fn pr(&self, bitstream: &dyn Bitstream, dry_run: bool) -> DeviceResult<Outcome> {
        reconfig::program(self, bitstream, dry_run)
    }
}

/// Whether `name` (or the target of the symlink at `name`) is an FME.
pub fn is_fme(name: &str) -> bool {
    let name = sysfs::clean_basename(Path::new(name));
    name.starts_with(DFL_FME_PREFIX) || name.starts_with(INTEL_FME_PREFIX)
}

/// Whether `name` (or the target of the symlink at `name`) is a port.
pub fn is_port(name: &str) -> bool {
    let name = sysfs::clean_basename(Path::new(name));
    name.starts_with(DFL_PORT_PREFIX) || name.starts_with(INTEL_PORT_PREFIX)
}

fn dev_node_path(name: &str) -> PathBuf {
    if name.contains('/') {
        PathBuf::from(name)
    } else {
        Path::new(DEV_DIR).join(name)
    }
}

/// Opens an FME by device path or bare node name.
pub fn open_fme(name: &str) -> DeviceResult<Box<dyn Fme>> {
    let path = dev_node_path(name);
    let node_name = sysfs::clean_basename(&path);

    if node_name.starts_with(DFL_FME_PREFIX) {
        Ok(Box::new(DflFme::open(&path)?))
    } else if node_name.starts_with(INTEL_FME_PREFIX) {
        Ok(Box::new(IntelFpgaFme::open(&path)?))
    } else {
        Err(Report::new(DeviceError::UnknownType {
            kind: "FME",
            path,
        }))
    }
}

/// Opens a port by device path or bare node name.
pub fn open_port(name: &str) -> DeviceResult<Box<dyn Port>> {
    let path = dev_node_path(name);
    let node_name = sysfs::clean_basename(&path);

    if node_name.starts_with(DFL_PORT_PREFIX) {
        Ok(Box::new(DflPort::open(&path)?))
    } else if node_name.starts_with(INTEL_PORT_PREFIX) {
        Ok(Box::new(IntelFpgaPort::open(&path)?))
    } else {
        Err(Report::new(DeviceError::UnknownType {
            kind: "port",
            path,
        }))
    }
}

/// Lists FME and port device names found in `platform_dir`, usually
/// `/sys/bus/platform/devices`.
pub fn list_fpga_devices(platform_dir: &Path) -> DeviceResult<(Vec<String>, Vec<String>)> {
    let mut fmes = Vec::new();
    let mut ports = Vec::new();

    let names = sysfs::list_dir(platform_dir).change_context_lazy(|| DeviceError::Sysfs {
        path: platform_dir.to_path_buf(),
    })?;
    for name in names {
        let entry = platform_dir.join(&name);
        let entry = entry.to_string_lossy();
        if is_fme(&entry) {
            fmes.push(name);
        } else if is_port(&entry) {
            ports.push(name);
        }
    }

    Ok((fmes, ports))
}

/// Rejects devices that are not Intel FPGA accelerators.
pub fn check_vendor_and_class(pci: &PciDevice) -> DeviceResult<()> {
    if pci.vendor != VENDOR_INTEL || pci.class != FPGA_CLASS {
        return Err(Report::new(DeviceError::UnsupportedPciDevice {
            bdf: pci.bdf.clone(),
            vendor: pci.vendor.clone(),
            device: pci.device.clone(),
            class: pci.class.clone(),
        }));
    }
    Ok(())
}

/// Finds the sysfs directory of a device node through
/// `/sys/dev/{char|block}/{major}:{minor}`.
///
/// Returns `None` when the node does not exist.
pub fn find_sysfs_device(dev: &Path) -> DeviceResult<Option<PathBuf>> {
    find_sysfs_device_in(Path::new(SYS_DIR), dev)
}

fn find_sysfs_device_in(sys_root: &Path, dev: &Path) -> DeviceResult<Option<PathBuf>> {
    let metadata = match fs::metadata(dev) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(Report::new(e).change_context(DeviceError::Sysfs {
                path: dev.to_path_buf(),
            }))
        }
    };

    let file_type = metadata.file_type();
    let (kind, rdev) = if file_type.is_char_device() {
        ("char", metadata.rdev())
    } else if file_type.is_block_device() {
        ("block", metadata.rdev())
    } else {
        ("block", metadata.dev())
    };

    let major = libc::major(rdev);
    let minor = libc::minor(rdev);
    if major == 0 {
        return Err(Report::new(DeviceError::VirtualDevice {
            path: dev.to_path_buf(),
        }));
    }

    let link = sys_root
        .join("dev")
        .join(kind)
        .join(format!("{major}:{minor}"));
    let real = sysfs::resolve(&link).change_context_lazy(|| DeviceError::Sysfs {
        path: dev.to_path_buf(),
    })?;
    debug!(dev = %dev.display(), sysfs = %real.display(), "resolved sysfs device");

    Ok(Some(real))
}

/// Reads an attribute that must be present in `dir`.
pub(crate) fn required_attr(dir: &Path, attribute: &'static str) -> DeviceResult<String> {
    sysfs::read_optional(dir, attribute)
        .change_context_lazy(|| DeviceError::Sysfs {
            path: dir.to_path_buf(),
        })?
        .ok_or_else(|| {
            Report::new(DeviceError::MissingAttribute {
                attribute,
                path: dir.to_path_buf(),
            })
        })
}

pub(crate) fn parse_attr(dir: &Path, attribute: &'static str) -> DeviceResult<u32> {
    let value = required_attr(dir, attribute)?;
    sysfs::parse_u32(&dir.join(attribute), &value).change_context_lazy(|| {
        DeviceError::MissingAttribute {
            attribute,
            path: dir.to_path_buf(),
        }
    })
}

/// Device node of the FME sharing a physical function with a port.
///
/// The FME directory is found with `fme_glob` under the physical function,
/// and its `dev` attribute (`major:minor`) is resolved through
/// `{devfs}/char`.
pub(crate) fn fme_node_for(pci: &PciDevice, fme_glob: &str, devfs: &Path) -> DeviceResult<PathBuf> {
    let pf = pci.physical_function();
    let fme_dir = sysfs::find_unique(&pf.sysfs_path.join(fme_glob)).change_context_lazy(|| {
        DeviceError::Sysfs {
            path: pf.sysfs_path.clone(),
        }
    })?;
    let dev = required_attr(&fme_dir, "dev")?;

    let char_link = devfs.join("char").join(&dev);
    sysfs::resolve(&char_link).change_context_lazy(|| DeviceError::Sysfs {
        path: char_link.clone(),
    })
}

pub(crate) fn fme_node(pci: &PciDevice, fme_glob: &str) -> DeviceResult<PathBuf> {
    fme_node_for(pci, fme_glob, Path::new(DEV_DIR))
}

#[cfg(test)]
pub(crate) mod tests {
    use std::fs::File;
    use std::os::unix::fs::symlink;

    use similar_asserts::assert_eq;
    use tempfile::TempDir;

    use super::*;
    use crate::pci::tests::write_pci_function;

    /// Lays out a DFL PCI function with one FME and one port and returns
    /// `(pci_dir, fme_dir, port_dir)`.
    pub(crate) fn dfl_pci_tree(root: &Path) -> (PathBuf, PathBuf, PathBuf) {
        let pci_dir = root.join("devices/pci0000:00/0000:3b:00.0");
        write_pci_function(&pci_dir, VENDOR_INTEL, FPGA_CLASS, "0");

        let region = pci_dir.join("fpga_region/region0");
        let fme_dir = region.join("dfl-fme.0");
        let port_dir = region.join("dfl-port.0");
        let compat_dir = fme_dir.join("dfl-fme-region.1/fpga_region/region1");
        fs::create_dir_all(&compat_dir).expect("should create compat dir");
        fs::create_dir_all(&port_dir).expect("should create port dir");

        for (name, value) in [
            ("bitstream_id", "0x23000410010309"),
            ("bitstream_metadata", "0x1811140"),
            ("dev", "250:0"),
            ("ports_num", "1"),
            ("socket_id", "0"),
        ] {
            fs::write(fme_dir.join(name), format!("{value}\n")).expect("should write attr");
        }
        fs::write(
            compat_dir.join("compat_id"),
            "CE48969398F05F33946D560708BE108A\n",
        )
        .expect("should write compat_id");

        for (name, value) in [
            ("afu_id", "d8424dc4a4a3c413f89e433683f9040b"),
            ("dev", "251:0"),
            ("id", "0"),
        ] {
            fs::write(port_dir.join(name), format!("{value}\n")).expect("should write attr");
        }

        (pci_dir, fme_dir, port_dir)
    }

    pub(crate) fn fake_node_file(dir: &Path, name: &str) -> (PathBuf, File) {
        let path = dir.join(name);
        let file = File::create(&path).expect("should create node file");
        (path, file)
    }

    #[test]
    fn test_is_fme_and_port() {
        assert!(is_fme("dfl-fme.0"));
        assert!(is_fme("intel-fpga-fme.3"));
        assert!(!is_fme("dfl-port.0"));
        assert!(is_port("dfl-port.1"));
        assert!(is_port("intel-fpga-port.0"));
        assert!(!is_port("intel-fpga-dev.0"));
    }

    #[test]
    fn test_is_fme_follows_symlinks() {
        let dir = TempDir::new().expect("should create temp dir");
        let target = dir.path().join("dfl-fme.2");
        fs::create_dir(&target).expect("should create dir");
        let link = dir.path().join("fme-link");
        symlink(&target, &link).expect("should link");

        assert!(is_fme(&link.to_string_lossy()));
    }

    #[test]
    fn test_list_fpga_devices() {
        let dir = TempDir::new().expect("should create temp dir");
        for name in [
            "dfl-fme.0",
            "dfl-port.0",
            "intel-fpga-fme.1",
            "intel-fpga-port.1",
            "serial8250",
        ] {
            fs::create_dir(dir.path().join(name)).expect("should create dir");
        }

        let (fmes, ports) = list_fpga_devices(dir.path()).expect("should list");
        assert_eq!(fmes, vec!["dfl-fme.0", "intel-fpga-fme.1"]);
        assert_eq!(ports, vec!["dfl-port.0", "intel-fpga-port.1"]);

        let err = list_fpga_devices(&dir.path().join("missing")).expect_err("missing dir");
        assert!(matches!(err.current_context(), DeviceError::Sysfs { .. }));
    }

    #[test]
    fn test_open_rejects_unknown_names() {
        let err = open_fme("/dev/null").expect_err("not an FME");
        assert!(matches!(
            err.current_context(),
            DeviceError::UnknownType { kind: "FME", .. }
        ));

        let err = open_port("dfl-fme.0").expect_err("not a port");
        assert!(matches!(
            err.current_context(),
            DeviceError::UnknownType { kind: "port", .. }
        ));
    }

    #[test]
    fn test_open_missing_node() {
        let dir = TempDir::new().expect("should create temp dir");
        let path = dir.path().join("dfl-port.7");
        let err = open_port(&path.to_string_lossy()).expect_err("missing node");
        assert!(matches!(err.current_context(), DeviceError::Open { .. }));
    }

    #[test]
    fn test_open_non_device_is_api_mismatch() {
        let dir = TempDir::new().expect("should create temp dir");
        let (path, _file) = fake_node_file(dir.path(), "dfl-fme.0");
        let err = open_fme(&path.to_string_lossy()).expect_err("not a char device");
        assert!(matches!(
            err.current_context(),
            DeviceError::ApiMismatch { .. }
        ));
    }

    #[test]
    fn test_check_vendor_and_class() {
        let dir = TempDir::new().expect("should create temp dir");
        let (pci_dir, ..) = dfl_pci_tree(dir.path());
        let pci = PciDevice::from_sysfs(&pci_dir).expect("should resolve");
        assert!(check_vendor_and_class(&pci).is_ok());

        let gpu_dir = dir.path().join("devices/pci0000:00/0000:af:00.0");
        write_pci_function(&gpu_dir, "0x10de", "0x030200", "0");
        let gpu = PciDevice::from_sysfs(&gpu_dir).expect("should resolve");
        let err = check_vendor_and_class(&gpu).expect_err("should reject");
        assert!(err.to_string().contains("VID=0x10de"));
    }

    #[test]
    fn test_find_sysfs_device() {
        let dir = TempDir::new().expect("should create temp dir");
        let sys = dir.path().join("sys");
        let target = sys.join("devices/virtual/mem/null");
        fs::create_dir_all(&target).expect("should create target");
        fs::create_dir_all(sys.join("dev/char")).expect("should create char dir");
        // /dev/null is char 1:3 on Linux
        symlink(&target, sys.join("dev/char/1:3")).expect("should link");

        let found = find_sysfs_device_in(&sys, Path::new("/dev/null")).expect("should resolve");
        assert_eq!(found, Some(target.canonicalize().expect("canonical")));

        assert_eq!(
            find_sysfs_device_in(&sys, &dir.path().join("missing")).expect("missing node"),
            None
        );
    }

    #[test]
    fn test_fme_node_for_port() {
        let dir = TempDir::new().expect("should create temp dir");
        let (pci_dir, ..) = dfl_pci_tree(dir.path());

        let devfs = dir.path().join("dev");
        fs::create_dir_all(devfs.join("char")).expect("should create char dir");
        let (fme_node, _file) = fake_node_file(&devfs, "dfl-fme.0");
        symlink(&fme_node, devfs.join("char/250:0")).expect("should link");

        let pci = PciDevice::from_sysfs(&pci_dir).expect("should resolve");
        let found =
            fme_node_for(&pci, dfl::FME_GLOB, &devfs).expect("should find FME node");
        assert_eq!(found, fme_node.canonicalize().expect("canonical"));
    }

    #[test]
    fn test_required_attr() {
        let dir = TempDir::new().expect("should create temp dir");
        fs::write(dir.path().join("ports_num"), "2\n").expect("should write");
        fs::write(dir.path().join("socket_id"), "n/a\n").expect("should write");

        assert_eq!(parse_attr(dir.path(), "ports_num").expect("should parse"), 2);
        assert!(matches!(
            parse_attr(dir.path(), "socket_id").expect_err("not a number").current_context(),
            DeviceError::MissingAttribute { attribute: "socket_id", .. }
        ));
        assert!(matches!(
            required_attr(dir.path(), "bitstream_id").expect_err("missing").current_context(),
            DeviceError::MissingAttribute { .. }
        ));
    }
}
