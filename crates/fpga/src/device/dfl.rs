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
pub(crate) const FME_GLOB: &str = "fpga_region/region*/dfl-fme.*";
/// Interface ID of the static region relative to the FME directory.
const COMPAT_ID: &str = "dfl-fme-region.*/fpga_region/region*/compat_id";

/// FME of the upstream DFL driver.
#[derive(Debug)]
pub struct DflFme {
    node: DeviceNode,
    interface_uuid: OnceCell<String>,
}

impl DflFme {
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

impl FpgaDevice for DflFme {
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

impl Fme for DflFme {
    /// A driver `EIO` means the hardware detected a PR error; details are in
    /// the status of the FME's FPGA manager.
    fn port_pr(&self, port_id: u32, bitstream: &[u8]) -> DeviceResult<()> {
        let buffer_size = u32::try_from(bitstream.len())
            .change_context(DeviceError::Bitstream)
            .attach_printable("bitstream does not fit the PR buffer size")?;

        let mut arg = ioctl::DflFmePortPr {
            argsz: ioctl::argsz::<ioctl::DflFmePortPr>(),
            flags: 0,
            port_id,
            buffer_size,
            buffer_address: bitstream.as_ptr() as u64,
        };
        info!(fme = %self.dev_path().display(), port_id, buffer_size, "starting partial reconfiguration");
        self.node
            .ioctl_with("DFL_FPGA_FME_PORT_PR", ioctl::FPGA_FME_PORT_PR, &mut arg)?;
        Ok(())
    }

    fn ports_num(&self) -> DeviceResult<u32> {
        parse_attr(self.sysfs_path()?, "ports_num")
    }

    fn interface_uuid(&self) -> DeviceResult<String> {
        self.interface_uuid
            .get_or_try_init(|| -> DeviceResult<String> {
                Ok(canonize_id(&required_attr(self.sysfs_path()?, COMPAT_ID)?))
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

/// Port of the upstream DFL driver.
#[derive(Debug)]
pub struct DflPort {
    node: DeviceNode,
}

impl DflPort {
    pub fn open(dev_path: &Path) -> DeviceResult<Self> {
        let port = Self::from_node(DeviceNode::open(dev_path)?);
        check_vendor_and_class(port.pci_device()?)?;
        Ok(port)
    }

    pub(crate) fn from_node(node: DeviceNode) -> Self {
        Self { node }
    }
}

impl FpgaDevice for DflPort {
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

impl Port for DflPort {
    fn reset(&self) -> DeviceResult<()> {
        self.node
            .ioctl_none("DFL_FPGA_PORT_RESET", ioctl::FPGA_PORT_RESET)?;
        Ok(())
    }

    fn info(&self) -> DeviceResult<PortInfo> {
        let mut arg = ioctl::DflPortInfo {
            argsz: ioctl::argsz::<ioctl::DflPortInfo>(),
            ..Default::default()
        };
        self.node
            .ioctl_with("DFL_FPGA_PORT_GET_INFO", ioctl::FPGA_PORT_GET_INFO, &mut arg)?;

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
            "DFL_FPGA_PORT_GET_REGION_INFO",
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
    use similar_asserts::assert_eq;
    use tempfile::TempDir;

    use super::super::tests::dfl_pci_tree;
    use super::super::tests::fake_node_file;
    use super::*;

    #[test]
    fn test_dfl_fme_properties() {
        let dir = TempDir::new().expect("should create temp dir");
        let (_, fme_dir, _) = dfl_pci_tree(dir.path());
        let (dev, file) = fake_node_file(dir.path(), "dfl-fme.0");

        let fme = DflFme::from_node(DeviceNode::with_sysfs(&dev, file, fme_dir));
        assert_eq!(fme.name().expect("name"), "dfl-fme.0");
        assert_eq!(
            fme.interface_uuid().expect("interface"),
            "ce48969398f05f33946d560708be108a"
        );
        assert_eq!(fme.ports_num().expect("ports"), 1);
        assert_eq!(fme.socket_id().expect("socket"), 0);
        assert_eq!(fme.bitstream_id().expect("bitstream id"), "0x23000410010309");
        assert_eq!(fme.bitstream_metadata().expect("metadata"), "0x1811140");
        assert_eq!(fme.pci_device().expect("pci").bdf, "0000:3b:00.0");
    }

    #[test]
    fn test_dfl_interface_uuid_is_cached() {
        let dir = TempDir::new().expect("should create temp dir");
        let (_, fme_dir, _) = dfl_pci_tree(dir.path());
        let (dev, file) = fake_node_file(dir.path(), "dfl-fme.0");

        let fme = DflFme::from_node(DeviceNode::with_sysfs(&dev, file, fme_dir.clone()));
        let first = fme.interface_uuid().expect("interface");
        std::fs::remove_dir_all(fme_dir.join("dfl-fme-region.1")).expect("should remove");
        assert_eq!(fme.interface_uuid().expect("cached interface"), first);
    }

    #[test]
    fn test_dfl_port_properties() {
        let dir = TempDir::new().expect("should create temp dir");
        let (_, _, port_dir) = dfl_pci_tree(dir.path());
        let (dev, file) = fake_node_file(dir.path(), "dfl-port.0");

        let port = DflPort::from_node(DeviceNode::with_sysfs(&dev, file, port_dir));
        assert_eq!(port.port_id().expect("id"), 0);
        assert_eq!(
            port.accelerator_type_uuid().expect("afu"),
            "d8424dc4a4a3c413f89e433683f9040b"
        );
        assert_eq!(port.dev_path(), dev.as_path());
        // no such char device on the test host, so the ioctl is refused
        assert!(matches!(
            port.reset().expect_err("not a device").current_context(),
            DeviceError::Ioctl { request: "DFL_FPGA_PORT_RESET", .. }
        ));
    }
}
