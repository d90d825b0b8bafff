use std::path::Path;
use std::path::PathBuf;
use std::str::FromStr;

use error_stack::Report;
use once_cell::sync::Lazy;
use regex::Regex;

use super::ScanError;

static OPAE_DEVICE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^intel-fpga-dev\.[0-9]+$").expect("Invalid OPAE device regex"));
static OPAE_FME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^intel-fpga-fme\.[0-9]+$").expect("Invalid OPAE FME regex"));
static OPAE_PORT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^intel-fpga-port\.[0-9]+$").expect("Invalid OPAE port regex"));

static DFL_DEVICE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^region[0-9]+$").expect("Invalid DFL region regex"));
static DFL_FME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^dfl-fme\.[0-9]+$").expect("Invalid DFL FME regex"));
static DFL_PORT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^dfl-port\.[0-9]+$").expect("Invalid DFL port regex"));

/// Sysfs layout exposed by an FPGA kernel driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum Layout {
    /// Legacy intel-fpga driver, as used by OPAE.
    #[display("opae")]
    Opae,
    /// Upstream Device Feature List driver.
    #[display("dfl")]
    Dfl,
}

impl Layout {
    /// Class directory relative to the sysfs mount point.
    pub fn class_dir(self) -> &'static str {
        match self {
            Layout::Opae => "class/fpga",
            Layout::Dfl => "class/fpga_region",
        }
    }

    pub(crate) fn device_re(self) -> &'static Regex {
        match self {
            Layout::Opae => &*OPAE_DEVICE_RE,
            Layout::Dfl => &*DFL_DEVICE_RE,
        }
    }

    pub(crate) fn fme_re(self) -> &'static Regex {
        match self {
            Layout::Opae => &*OPAE_FME_RE,
            Layout::Dfl => &*DFL_FME_RE,
        }
    }

    pub(crate) fn port_re(self) -> &'static Regex {
        match self {
            Layout::Opae => &*OPAE_PORT_RE,
            Layout::Dfl => &*DFL_PORT_RE,
        }
    }

    /// Interface ID attribute relative to the FME directory.
    pub(crate) fn interface_id_attr(self) -> &'static str {
        match self {
            Layout::Opae => "pr/interface_id",
            Layout::Dfl => "dfl-fme-region.*/fpga_region/region*/compat_id",
        }
    }

    /// DFL lists nested PR regions next to the FME-bearing ones.
    pub(crate) fn skips_empty_devices(self) -> bool {
        matches!(self, Layout::Dfl)
    }

    /// Picks the layout whose class directory exists under `sysfs_root`,
    /// preferring the legacy driver.
    pub fn detect(sysfs_root: &Path) -> Result<Self, Report<ScanError>> {
        [Layout::Opae, Layout::Dfl]
            .into_iter()
            .find(|layout| sysfs_root.join(layout.class_dir()).is_dir())
            .ok_or_else(|| {
                Report::new(ScanError::DriverNotLoaded {
                    path: sysfs_root.to_path_buf(),
                })
            })
    }

    pub fn class_path(self, sysfs_root: &Path) -> PathBuf {
        sysfs_root.join(self.class_dir())
    }
}

impl FromStr for Layout {
    type Err = Report<ScanError>;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "opae" => Ok(Layout::Opae),
            "dfl" => Ok(Layout::Dfl),
            other => Err(Report::new(ScanError::UnknownDriver {
                driver: other.to_string(),
            })),
        }
    }
}
