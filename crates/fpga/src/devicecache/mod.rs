//! Periodic FPGA inventory scan producing Added/Updated/Removed change-sets.
//!
//! Each scan rebuilds the device list from sysfs, groups it into resource
//! classes and diffs the result against the previous scan. A scan that fails
//! for any device fails as a whole; a partial inventory is never published.

use core::error::Error;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::str::FromStr;
use std::thread;
use std::time::Duration;

use error_stack::Report;
use error_stack::ResultExt;
use serde::Serialize;
use tokio::sync::mpsc::Sender;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::identity::af_dev_type;
use crate::identity::canonize_id;
use crate::identity::is_healthy_id;
use crate::identity::UNHEALTHY_UUID;
use crate::sysfs;

mod layout;

pub use layout::Layout;

pub const DEFAULT_SCAN_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, derive_more::Display)]
pub enum ScanError {
    #[display("wrong mode: {mode:?}")]
    UnknownMode { mode: String },
    #[display("unknown driver: {driver:?}")]
    UnknownDriver { driver: String },
    #[display("kernel driver is not loaded: no FPGA class directory under {}", path.display())]
    DriverNotLoaded { path: PathBuf },
    #[display("can't read sysfs folder {}", path.display())]
    ReadSysfs { path: PathBuf },
    #[display(
        "detected more than one region for device {device}; only one region per FPGA device is supported"
    )]
    MoreThanOneRegion { device: String },
    #[display("no regions found for device {device}")]
    NoRegion { device: String },
    #[display("device {} doesn't exist", path.display())]
    MissingDeviceNode { path: PathBuf },
    #[display("unable to derive resource class")]
    ResourceClass,
    #[display("change-set receiver is closed")]
    ChannelClosed,
}

impl Error for ScanError {}

/// How devices are grouped into resource classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum Mode {
    /// One class per interface/AFU pair, one entry per port.
    #[display("af")]
    Af,
    /// One class per interface, one entry per FME.
    #[display("region")]
    Region,
}

impl FromStr for Mode {
    type Err = Report<ScanError>;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "af" => Ok(Mode::Af),
            "region" => Ok(Mode::Region),
            other => Err(Report::new(ScanError::UnknownMode {
                mode: other.to_string(),
            })),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, derive_more::Display)]
pub enum Health {
    Healthy,
    Unhealthy,
}

/// One allocatable device of a resource class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    pub health: Health,
    pub nodes: Vec<PathBuf>,
}

/// class key → device ID → device info
pub type DeviceMap = BTreeMap<String, BTreeMap<String, DeviceInfo>>;

/// Difference between two consecutive scans.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UpdateInfo {
    pub added: DeviceMap,
    pub updated: DeviceMap,
    pub removed: DeviceMap,
}

impl UpdateInfo {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    /// Diffs `new` against `old` by class key.
    pub fn diff(old: DeviceMap, new: DeviceMap) -> Self {
        let mut update = UpdateInfo {
            removed: old,
            ..Default::default()
        };

        for (key, devices) in new {
            match update.removed.remove(&key) {
                Some(previous) if previous != devices => {
                    update.updated.insert(key, devices);
                }
                Some(_) => {}
                None => {
                    update.added.insert(key, devices);
                }
            }
        }

        update
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Afu {
    pub id: String,
    pub afu_id: String,
    pub dev_node: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Region {
    pub id: String,
    pub interface_id: String,
    pub dev_node: PathBuf,
    pub afus: Vec<Afu>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub name: String,
    pub regions: Vec<Region>,
}

/// Replaces an unusable ID with the unhealthy sentinel.
fn checked_id(id: &str) -> (&str, Health) {
    if is_healthy_id(id) {
        (id, Health::Healthy)
    } else {
        (UNHEALTHY_UUID, Health::Unhealthy)
    }
}

fn worst(a: Health, b: Health) -> Health {
    if a == Health::Healthy && b == Health::Healthy {
        Health::Healthy
    } else {
        Health::Unhealthy
    }
}

impl Mode {
    /// Groups `devices` into resource classes.
    pub fn device_map(self, devices: &[Device]) -> Result<DeviceMap, Report<ScanError>> {
        let mut map = DeviceMap::new();

        for region in devices.iter().flat_map(|dev| &dev.regions) {
            let (interface_id, region_health) = checked_id(&region.interface_id);

            match self {
                Mode::Af => {
                    for afu in &region.afus {
                        let (afu_id, afu_health) = checked_id(&afu.afu_id);
                        let key = af_dev_type(interface_id, afu_id)
                            .change_context(ScanError::ResourceClass)?;
                        map.entry(key).or_default().insert(
                            afu.id.clone(),
                            DeviceInfo {
                                health: worst(region_health, afu_health),
                                nodes: vec![afu.dev_node.clone()],
                            },
                        );
                    }
                }
                Mode::Region => {
                    let nodes = region
                        .afus
                        .iter()
                        .map(|afu| afu.dev_node.clone())
                        .chain(std::iter::once(region.dev_node.clone()))
                        .collect();
                    map.entry(format!("region-{interface_id}"))
                        .or_default()
                        .insert(
                            region.id.clone(),
                            DeviceInfo {
                                health: region_health,
                                nodes,
                            },
                        );
                }
            }
        }

        Ok(map)
    }
}

/// Inventory of FPGA devices found under one sysfs class directory.
#[derive(Debug)]
pub struct Cache {
    sysfs_dir: PathBuf,
    devfs_dir: PathBuf,
    mode: Mode,
    layout: Layout,
    devices: Vec<Device>,
    tx: Sender<UpdateInfo>,
}

impl Cache {
    /// Creates a cache scanning `sysfs_dir` (the FPGA class directory) with
    /// device nodes under `devfs_dir`. The legacy driver layout is assumed
    /// until [`Cache::with_layout`] says otherwise.
    pub fn new(
        sysfs_dir: impl Into<PathBuf>,
        devfs_dir: impl Into<PathBuf>,
        mode: &str,
        tx: Sender<UpdateInfo>,
    ) -> Result<Self, Report<ScanError>> {
        Ok(Self {
            sysfs_dir: sysfs_dir.into(),
            devfs_dir: devfs_dir.into(),
            mode: mode.parse()?,
            layout: Layout::Opae,
            devices: Vec::new(),
            tx,
        })
    }

    pub fn with_layout(mut self, layout: Layout) -> Self {
        self.layout = layout;
        self
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Devices found by the last successful scan.
    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    /// Scans every `interval` until a scan fails.
    ///
    /// There is no retry; the error is meant to end the process.
    pub fn run(&mut self, interval: Duration) -> Result<(), Report<ScanError>> {
        info!(
            sysfs = %self.sysfs_dir.display(),
            mode = %self.mode,
            layout = %self.layout,
            ?interval,
            "starting FPGA device scan loop"
        );
        loop {
            if let Err(e) = self.scan() {
                error!("device scan failed: {e:?}");
                return Err(e);
            }
            thread::sleep(interval);
        }
    }

    /// Runs one scan and sends a change-set if the inventory changed.
    ///
    /// Blocks while the receiver is not ready. Must not be called from an
    /// async context.
    pub fn scan(&mut self) -> Result<(), Report<ScanError>> {
        debug!(sysfs = %self.sysfs_dir.display(), "starting new FPGA scan");

        let devices = self.discover()?;
        let update = UpdateInfo::diff(
            self.mode.device_map(&self.devices)?,
            self.mode.device_map(&devices)?,
        );

        if !update.is_empty() {
            info!(
                added = update.added.len(),
                updated = update.updated.len(),
                removed = update.removed.len(),
                "FPGA inventory changed"
            );
            self.tx
                .blocking_send(update)
                .map_err(|_| Report::new(ScanError::ChannelClosed))?;
        }

        self.devices = devices;
        Ok(())
    }

    fn discover(&self) -> Result<Vec<Device>, Report<ScanError>> {
        let read_err = |path: &Path| ScanError::ReadSysfs {
            path: path.to_path_buf(),
        };

        let mut devices = Vec::new();
        let names = sysfs::list_dir(&self.sysfs_dir).change_context_lazy(|| read_err(&self.sysfs_dir))?;

        for name in names {
            if !self.layout.device_re().is_match(&name) {
                continue;
            }

            let device_dir = self.sysfs_dir.join(&name);
            let children = sysfs::list_dir(&device_dir).change_context_lazy(|| read_err(&device_dir))?;

            let mut region: Option<Region> = None;
            let mut afus = Vec::new();
            for child in children {
                let child_dir = device_dir.join(&child);

                if self.layout.fme_re().is_match(&child) {
                    if region.is_some() {
                        return Err(Report::new(ScanError::MoreThanOneRegion { device: name }));
                    }
                    let interface_id = self.read_id(&child_dir, self.layout.interface_id_attr())?;
                    region = Some(Region {
                        dev_node: self.dev_node(&child)?,
                        id: child,
                        interface_id,
                        afus: Vec::new(),
                    });
                } else if self.layout.port_re().is_match(&child) {
                    let afu_id = self.read_id(&child_dir, "afu_id")?;
                    afus.push(Afu {
                        dev_node: self.dev_node(&child)?,
                        id: child,
                        afu_id,
                    });
                }
            }

            let Some(mut region) = region else {
                if self.layout.skips_empty_devices() {
                    debug!(device = %name, "skipping region without FME");
                    continue;
                }
                return Err(Report::new(ScanError::NoRegion { device: name }));
            };
            region.afus = afus;

            devices.push(Device {
                name,
                regions: vec![region],
            });
        }

        Ok(devices)
    }

    /// Reads a UUID attribute. A missing attribute yields an empty ID, which
    /// is later reported as unhealthy.
    fn read_id(&self, dir: &Path, attribute: &str) -> Result<String, Report<ScanError>> {
        let value = sysfs::read_optional(dir, attribute)
            .change_context_lazy(|| ScanError::ReadSysfs {
                path: dir.join(attribute),
            })?
            .unwrap_or_else(|| {
                warn!(dir = %dir.display(), attribute, "identity attribute not available");
                String::new()
            });
        Ok(canonize_id(&value))
    }

    fn dev_node(&self, name: &str) -> Result<PathBuf, Report<ScanError>> {
        let path = self.devfs_dir.join(name);
        fs::metadata(&path).change_context_lazy(|| ScanError::MissingDeviceNode {
            path: path.clone(),
        })?;
        Ok(path)
    }
}
