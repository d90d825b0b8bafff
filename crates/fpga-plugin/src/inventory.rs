//! In-memory view of the published resource classes.

use fpga::devicecache::DeviceMap;
use fpga::devicecache::Health;
use fpga::devicecache::UpdateInfo;
use tracing::info;
use tracing::warn;

#[derive(Debug, Default)]
pub struct Inventory {
    classes: DeviceMap,
}

impl Inventory {
    /// Applies one change-set. Added and updated classes replace their
    /// previous entries as a whole.
    pub fn apply(&mut self, update: UpdateInfo) {
        for (class, devices) in update.added {
            info!(%class, devices = devices.len(), "resource class added");
            self.classes.insert(class, devices);
        }
        for (class, devices) in update.updated {
            info!(%class, devices = devices.len(), "resource class updated");
            self.classes.insert(class, devices);
        }
        for class in update.removed.into_keys() {
            info!(%class, "resource class removed");
            self.classes.remove(&class);
        }

        for (class, devices) in &self.classes {
            for (id, device) in devices {
                if device.health == Health::Unhealthy {
                    warn!(%class, device = %id, "device is unhealthy");
                }
            }
        }
    }

    pub fn classes(&self) -> &DeviceMap {
        &self.classes
    }

    pub fn device_count(&self) -> usize {
        self.classes.values().map(|devices| devices.len()).sum()
    }
}
