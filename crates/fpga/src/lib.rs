//! Host-side FPGA management: device inventory, bitstream containers and
//! partial reconfiguration through the Linux FPGA drivers.

pub mod bitstream;
pub mod device;
pub mod devicecache;
pub mod identity;
pub mod pci;
pub mod reconfig;
pub mod sysfs;
