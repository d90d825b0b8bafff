use std::path::Path;
use std::path::PathBuf;

use clap::Parser;
use clap::Subcommand;
use clap::ValueEnum;
use error_stack::Report;
use fpga::devicecache::Layout;
use fpga::devicecache::DEFAULT_SCAN_INTERVAL;
use fpga::devicecache::ScanError;
use utils::version;

pub const DEFAULT_BITSTREAM_DIR: &str = "/srv/intel.com/fpga";

#[derive(Parser)]
#[command(about, long_about, version = &**version::VERSION)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Watch FPGA devices and publish inventory changes
    Daemon(DaemonArgs),
    /// Print identity and metadata of a bitstream file
    Info(BitstreamArgs),
    /// Copy a bitstream into the bitstream store
    Install(InstallArgs),
    /// Program a bitstream into the region behind a port
    Pr(PrArgs),
    /// Print driver and sysfs information of an FME or port
    Fpgainfo(DeviceArgs),
    /// Scan once and print the resource classes as JSON
    List(ListArgs),
}

/// Kernel driver whose sysfs layout is scanned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Driver {
    /// Pick whichever driver is loaded, preferring intel-fpga
    Auto,
    /// Legacy intel-fpga driver
    Opae,
    /// Upstream DFL driver
    Dfl,
}

impl Driver {
    pub fn layout(self, sysfs_root: &Path) -> Result<Layout, Report<ScanError>> {
        match self {
            Driver::Auto => Layout::detect(sysfs_root),
            Driver::Opae => Ok(Layout::Opae),
            Driver::Dfl => Ok(Layout::Dfl),
        }
    }
}

/// Where and how devices are scanned.
#[derive(Parser, Debug, Clone)]
pub struct ScanArgs {
    #[arg(
        long,
        env = "FPGA_PLUGIN_MODE",
        default_value = "af",
        help = "Resource grouping: 'af' (per accelerator function) or 'region' (per FPGA region)"
    )]
    pub mode: String,

    #[arg(long, value_enum, default_value_t = Driver::Auto)]
    pub driver: Driver,

    #[arg(
        long,
        default_value = "/sys",
        value_hint = clap::ValueHint::DirPath,
        help = "Sysfs mount point used for driver detection"
    )]
    pub sysfs_root: PathBuf,

    #[arg(
        long,
        value_hint = clap::ValueHint::DirPath,
        help = "FPGA class directory, defaults to the driver's class directory under --sysfs-root"
    )]
    pub sysfs_dir: Option<PathBuf>,

    #[arg(long, default_value = "/dev", value_hint = clap::ValueHint::DirPath)]
    pub devfs_dir: PathBuf,
}

impl ScanArgs {
    /// Resolves the driver layout and the class directory to scan.
    pub fn resolve(&self) -> Result<(Layout, PathBuf), Report<ScanError>> {
        let layout = self.driver.layout(&self.sysfs_root)?;
        let class_dir = self
            .sysfs_dir
            .clone()
            .unwrap_or_else(|| layout.class_path(&self.sysfs_root));
        Ok((layout, class_dir))
    }
}

#[derive(Parser)]
pub struct DaemonArgs {
    #[command(flatten)]
    pub scan: ScanArgs,

    #[arg(
        long,
        default_value_t = DEFAULT_SCAN_INTERVAL.as_secs(),
        help = "Seconds between two device scans"
    )]
    pub scan_interval: u64,

    #[arg(
        long,
        default_value = "1",
        value_parser = clap::value_parser!(u64).range(1..),
        help = "Number of change-sets buffered before the scanner blocks"
    )]
    pub channel_capacity: u64,

    #[arg(
        long,
        env = "FPGA_PLUGIN_LOG_FILE",
        value_hint = clap::ValueHint::FilePath,
        help = "Also write logs to this file, rotated daily"
    )]
    pub log_file: Option<PathBuf>,
}

#[derive(Parser)]
pub struct BitstreamArgs {
    #[arg(short, long, value_hint = clap::ValueHint::FilePath, help = "Path to a GBS or AOCX file")]
    pub bitstream: PathBuf,

    #[arg(long, default_value = DEFAULT_BITSTREAM_DIR, value_hint = clap::ValueHint::DirPath)]
    pub bitstream_dir: PathBuf,
}

#[derive(Parser)]
pub struct InstallArgs {
    #[command(flatten)]
    pub bitstream: BitstreamArgs,

    #[arg(long, help = "Only print the destination, copy nothing")]
    pub dry_run: bool,
}

#[derive(Parser)]
pub struct PrArgs {
    #[arg(short, long, help = "Port device node, e.g. /dev/dfl-port.0")]
    pub device: String,

    #[arg(
        short,
        long,
        value_hint = clap::ValueHint::FilePath,
        required_unless_present = "afu",
        conflicts_with = "afu",
        help = "Path to a GBS or AOCX file"
    )]
    pub bitstream: Option<PathBuf>,

    #[arg(long, help = "AFU UUID to look up in --bitstream-dir for the port's interface")]
    pub afu: Option<String>,

    #[arg(long, default_value = DEFAULT_BITSTREAM_DIR, value_hint = clap::ValueHint::DirPath)]
    pub bitstream_dir: PathBuf,

    #[arg(long, help = "Validate compatibility without programming")]
    pub dry_run: bool,
}

#[derive(Parser)]
pub struct DeviceArgs {
    #[arg(
        short,
        long,
        help = "FME or port device node, e.g. /dev/dfl-fme.0; lists all FMEs and ports when omitted"
    )]
    pub device: Option<String>,

    #[arg(long, default_value = "/sys/bus/platform/devices", value_hint = clap::ValueHint::DirPath)]
    pub platform_dir: PathBuf,

    #[arg(long, help = "Reset the port before querying it")]
    pub reset: bool,
}

#[derive(Parser)]
pub struct ListArgs {
    #[command(flatten)]
    pub scan: ScanArgs,
}
