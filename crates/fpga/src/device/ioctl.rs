//! Request numbers and argument layouts of the FPGA character device ioctls.
//!
//! The upstream DFL driver and the legacy intel-fpga driver share request
//! numbers but differ in some argument structs.

use std::fs::File;
use std::io;
use std::os::fd::AsRawFd;
use std::os::raw::c_int;
use std::os::raw::c_ulong;

/// `_IO(type, nr) = (type << 8) | nr`
const fn io(ty: u8, nr: u8) -> c_ulong {
    ((ty as c_ulong) << 8) | (nr as c_ulong)
}

pub const FPGA_MAGIC: u8 = 0xB6;
const FPGA_BASE: u8 = 0;
const PORT_BASE: u8 = 0x40;
const FME_BASE: u8 = 0x80;

pub const FPGA_GET_API_VERSION: c_ulong = io(FPGA_MAGIC, FPGA_BASE);
pub const FPGA_CHECK_EXTENSION: c_ulong = io(FPGA_MAGIC, FPGA_BASE + 1);
pub const FPGA_PORT_RESET: c_ulong = io(FPGA_MAGIC, PORT_BASE);
pub const FPGA_PORT_GET_INFO: c_ulong = io(FPGA_MAGIC, PORT_BASE + 1);
pub const FPGA_PORT_GET_REGION_INFO: c_ulong = io(FPGA_MAGIC, PORT_BASE + 2);
pub const FPGA_FME_PORT_PR: c_ulong = io(FPGA_MAGIC, FME_BASE);

/// `struct dfl_fpga_port_info`
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct DflPortInfo {
    pub argsz: u32,
    pub flags: u32,
    pub num_regions: u32,
    pub num_umsgs: u32,
}

/// `struct dfl_fpga_port_region_info`, identical in both drivers.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct PortRegionInfoArg {
    pub argsz: u32,
    pub flags: u32,
    pub index: u32,
    pub padding: u32,
    pub size: u64,
    pub offset: u64,
}

/// `struct dfl_fpga_fme_port_pr`
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct DflFmePortPr {
    pub argsz: u32,
    pub flags: u32,
    pub port_id: u32,
    pub buffer_size: u32,
    pub buffer_address: u64,
}

/// `struct fpga_port_info` of the intel-fpga driver.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct IntelPortInfo {
    pub argsz: u32,
    pub flags: u32,
    pub capability: u32,
    pub num_regions: u32,
    pub num_umsgs: u32,
    pub num_uafu_irqs: u32,
}

/// `struct fpga_fme_port_pr` of the intel-fpga driver.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct IntelFmePortPr {
    pub argsz: u32,
    pub flags: u32,
    pub port_id: u32,
    pub buffer_size: u32,
    pub buffer_address: u64,
    pub status: u64,
}

/// Size of an argument struct as the driver expects it in `argsz`.
pub fn argsz<T>() -> u32 {
    std::mem::size_of::<T>() as u32
}

/// Issues an ioctl that takes no argument.
pub fn ioctl_none(file: &File, request: c_ulong) -> io::Result<c_int> {
    // SAFETY: the request takes no argument and the descriptor is owned by
    // `file` for the duration of the call.
    let ret = unsafe { libc::ioctl(file.as_raw_fd(), request as _, 0) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(ret)
}

/// Issues an ioctl whose argument is a pointer to `arg`.
pub fn ioctl_with<T>(file: &File, request: c_ulong, arg: &mut T) -> io::Result<c_int> {
    // SAFETY: `arg` is a live, exclusively borrowed `#[repr(C)]` struct matching
    // the layout the request expects, and its `argsz` field bounds what the
    // driver reads or writes.
    let ret = unsafe { libc::ioctl(file.as_raw_fd(), request as _, arg as *mut T) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(ret)
}
