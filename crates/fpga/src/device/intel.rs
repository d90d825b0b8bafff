use std::path::Path;

use error_stack::ResultExt;
use once_cell::unsync::OnceCell;
use tracing::info;

use super::check_vendor_and_class;
use super::fme_node;
use super::ioctl;
use super::node::DeviceNode;
use super::open_fme;
use super::parse_attr;
use super::required_attr;
use super::DeviceError;
use super::DeviceResult;
use super::Fme;
use super::FpgaDevice;
use super::Port;
use super::PortInfo;
use super::PortRegionInfo;
use crate::identity::canonize_id;
use crate::pci::PciDevice;

/// FME directory relative to its PCI function.
pub(crate) const FME_GLOB: &str = "fpga/intel-fpga-dev.*/intel-fpga-fme.*";
const INTERFACE_ID: &str = "pr/interface_id";

/// FME of the legacy intel-fpga driver.
#[derive(Debug)]
pub struct IntelFpgaFme {
    node: DeviceNode,
    interface_uuid: OnceCell<String>,
}

impl IntelFpgaFme {
    pub fn open(dev_path: &Path) -> DeviceResult<Self> {
        let fme = Self::from_node(DeviceNode::open(dev_path)?);
        check_vendor_and_class(fme.pci_device()?)?;
        Ok(fme)
    }

    pub(crate) fn from_node(node: DeviceNode) -> Self {
        Self {
            node,
            interface_uuid: OnceCell::new(),
        }
    }
}

impl FpgaDevice for IntelFpgaFme {
    fn api_version(&self) -> DeviceResult<i32> {
        self.node.api_version()
    }

    fn check_extension(&self) -> DeviceResult<i32> {
        self.node.check_extension()
    }

    fn dev_path(&self) -> &Path {
        self.node.dev_path()
    }

    fn sysfs_path(&self) -> DeviceResult<&Path> {
        self.node.sysfs_path()
    }

    fn name(&self) -> DeviceResult<String> {
        self.node.name()
    }

    fn pci_device(&self) -> DeviceResult<&PciDevice> {
        self.node.pci_device()
    }
}

impl Fme for IntelFpgaFme {
    fn port_pr(&self, port_id: u32, bitstream: &[u8]) -> DeviceResult<()> {
        let buffer_size = u32::try_from(bitstream.len())
            .change_context(DeviceError::Bitstream)
            .attach_printable("bitstream does not fit the PR buffer size")?;

        let mut arg = ioctl::IntelFmePortPr {
            argsz: ioctl::argsz::<ioctl::IntelFmePortPr>(),
            flags: 0,
            port_id,
            buffer_size,
            buffer_address: bitstream.as_ptr() as u64,
            status: 0,
        };
        info!(fme = %self.dev_path().display(), port_id, buffer_size, "starting partial reconfiguration");
        self.node
            .ioctl_with("FPGA_FME_PORT_PR", ioctl::FPGA_FME_PORT_PR, &mut arg)
            .attach_printable_lazy(|| format!("PR status {:#x}", arg.status))?;
        Ok(())
    }

    fn ports_num(&self) -> DeviceResult<u32> {
        parse_attr(self.sysfs_path()?, "ports_num")
    }

    fn interface_uuid(&self) -> DeviceResult<String> {
        self.interface_uuid
            .get_or_try_init(|| -> DeviceResult<String> {
                Ok(canonize_id(&required_attr(self.sysfs_path()?, INTERFACE_ID)?))
            })
            .cloned()
    }

    fn bitstream_id(&self) -> DeviceResult<String> {
        required_attr(self.sysfs_path()?, "bitstream_id")
    }

    fn bitstream_metadata(&self) -> DeviceResult<String> {
        required_attr(self.sysfs_path()?, "bitstream_metadata")
    }

    fn socket_id(&self) -> DeviceResult<u32> {
        parse_attr(self.sysfs_path()?, "socket_id")
    }
}

/// Port of the legacy intel-fpga driver.
#[derive(Debug)]
pub struct IntelFpgaPort {
    node: DeviceNode,
}

impl IntelFpgaPort {
    pub fn open(dev_path: &Path) -> DeviceResult<Self> {
        let port = Self::from_node(DeviceNode::open(dev_path)?);
        check_vendor_and_class(port.pci_device()?)?;
        Ok(port)
    }

    pub(crate) fn from_node(node: DeviceNode) -> Self {
        Self { node }
    }
}

impl FpgaDevice for IntelFpgaPort {
    fn api_version(&self) -> DeviceResult<i32> {
        self.node.api_version()
    }

    fn check_extension(&self) -> DeviceResult<i32> {
        self.node.check_extension()
    }

    fn dev_path(&self) -> &Path {
        self.node.dev_path()
    }

    fn sysfs_path(&self) -> DeviceResult<&Path> {
        self.node.sysfs_path()
    }

    fn name(&self) -> DeviceResult<String> {
        self.node.name()
    }

    fn pci_device(&self) -> DeviceResult<&PciDevice> {
        self.node.pci_device()
    }
}

impl Port for IntelFpgaPort {
    fn reset(&self) -> DeviceResult<()> {
        self.node
            .ioctl_none("FPGA_PORT_RESET", ioctl::FPGA_PORT_RESET)?;
        Ok(())
    }

    fn info(&self) -> DeviceResult<PortInfo> {
        let mut arg = ioctl::IntelPortInfo {
            argsz: ioctl::argsz::<ioctl::IntelPortInfo>(),
            ..Default::default()
        };
        self.node
            .ioctl_with("FPGA_PORT_GET_INFO", ioctl::FPGA_PORT_GET_INFO, &mut arg)?;

        Ok(PortInfo {
            flags: arg.flags,
            num_regions: arg.num_regions,
            num_umsgs: arg.num_umsgs,
        })
    }

    fn region_info(&self, index: u32) -> DeviceResult<PortRegionInfo> {
        let mut arg = ioctl::PortRegionInfoArg {
            argsz: ioctl::argsz::<ioctl::PortRegionInfoArg>(),
            index,
            ..Default::default()
        };
        self.node.ioctl_with(
            "FPGA_PORT_GET_REGION_INFO",
            ioctl::FPGA_PORT_GET_REGION_INFO,
            &mut arg,
        )?;

        Ok(PortRegionInfo {
            flags: arg.flags,
            index: arg.index,
            size: arg.size,
            offset: arg.offset,
        })
    }

    fn fme(&self) -> DeviceResult<Box<dyn Fme>> {
        let dev = fme_node(self.pci_device()?, FME_GLOB)?;
        open_fme(&dev.to_string_lossy())
    }

    fn port_id(&self) -> DeviceResult<u32> {
        parse_attr(self.sysfs_path()?, "id")
    }

    fn accelerator_type_uuid(&self) -> DeviceResult<String> {
        Ok(canonize_id(&required_attr(self.sysfs_path()?, "afu_id")?))
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    use similar_asserts::assert_eq;
    use tempfile::TempDir;

    use super::super::tests::fake_node_file;
    use super::*;
    use crate::pci::tests::write_pci_function;

    /// Returns `(fme_dir, port_dir)` of an intel-fpga device.
    fn intel_tree(root: &Path) -> (PathBuf, PathBuf) {
        let pci_dir = root.join("devices/pci0000:00/0000:5e:00.0");
        write_pci_function(&pci_dir, "0x8086", "0x120000", "0");

        let dev_dir = pci_dir.join("fpga/intel-fpga-dev.0");
        let fme_dir = dev_dir.join("intel-fpga-fme.0");
        let port_dir = dev_dir.join("intel-fpga-port.0");
        fs::create_dir_all(fme_dir.join("pr")).expect("should create fme dir");
        fs::create_dir_all(&port_dir).expect("should create port dir");

        fs::write(
            fme_dir.join("pr/interface_id"),
            "bfac4d85-1ee8-56fe-8c95-865ce1bbaa2d\n",
        )
        .expect("should write interface_id");
        fs::write(fme_dir.join("ports_num"), "1\n").expect("should write ports_num");
        fs::write(fme_dir.join("dev"), "242:0\n").expect("should write dev");
        fs::write(port_dir.join("afu_id"), "F7DF405CBD7ACF7222F144B0B93ACD18\n")
            .expect("should write afu_id");
        fs::write(port_dir.join("id"), "0\n").expect("should write id");

        (fme_dir, port_dir)
    }

    #[test]
    fn test_intel_fme_properties() {
        let dir = TempDir::new().expect("should create temp dir");
        let (fme_dir, _) = intel_tree(dir.path());
        let (dev, file) = fake_node_file(dir.path(), "intel-fpga-fme.0");

        let fme = IntelFpgaFme::from_node(DeviceNode::with_sysfs(&dev, file, fme_dir));
        assert_eq!(
            fme.interface_uuid().expect("interface"),
            "bfac4d851ee856fe8c95865ce1bbaa2d"
        );
        assert_eq!(fme.ports_num().expect("ports"), 1);
        // socket_id is only exported by newer drivers
        assert!(matches!(
            fme.socket_id().expect_err("missing").current_context(),
            DeviceError::MissingAttribute { attribute: "socket_id", .. }
        ));
    }

    #[test]
    fn test_intel_port_properties() {
        let dir = TempDir::new().expect("should create temp dir");
        let (_, port_dir) = intel_tree(dir.path());
        let (dev, file) = fake_node_file(dir.path(), "intel-fpga-port.0");

        let port = IntelFpgaPort::from_node(DeviceNode::with_sysfs(&dev, file, port_dir));
        assert_eq!(port.name().expect("name"), "intel-fpga-port.0");
        assert_eq!(port.port_id().expect("id"), 0);
        assert_eq!(
            port.accelerator_type_uuid().expect("afu"),
            "f7df405cbd7acf7222f144b0b93acd18"
        );
        assert_eq!(port.pci_device().expect("pci").bdf, "0000:5e:00.0");
        assert!(port.info().is_err());
    }

    #[test]
    fn test_intel_fme_node_for_port() {
        let dir = TempDir::new().expect("should create temp dir");
        let (fme_dir, _) = intel_tree(dir.path());
        let devfs = dir.path().join("dev");
        fs::create_dir_all(devfs.join("char")).expect("should create char dir");
        let (fme_node, _file) = fake_node_file(&devfs, "intel-fpga-fme.0");
        std::os::unix::fs::symlink(&fme_node, devfs.join("char/242:0")).expect("should link");

        let pci = PciDevice::from_sysfs(&fme_dir).expect("should resolve");
        let found = super::super::fme_node_for(&pci, FME_GLOB, &devfs).expect("should find");
        assert_eq!(found, fme_node.canonicalize().expect("canonical"));
    }
}
