//! Energy measurement capabilities
//!
//! The monitor consumes hardware meters only through the traits in this
//! module. Concrete meters are handed to the monitor at construction time,
//! there is no global registry of zones or accelerators.

mod aggregated;
mod fake;
mod powercap;

pub use aggregated::AggregatedZone;
pub use fake::{FakeGpuMeter, FakePowerMeter, FakeZone};
pub use powercap::{PowercapPowerMeter, PowercapZone, DEFAULT_POWERCAP_PATH};

use crate::units::{Energy, Power};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

pub const ZONE_PACKAGE: &str = "package";
pub const ZONE_CORE: &str = "core";
pub const ZONE_DRAM: &str = "dram";
pub const ZONE_UNCORE: &str = "uncore";
pub const ZONE_PSYS: &str = "psys";

/// Identity of an energy zone, used as the key of every usage map
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Zone {
    pub name: String,
    pub path: String,
}

impl Zone {
    pub fn new(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
        }
    }
}

impl fmt::Display for Zone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// A hardware or virtual domain exposing a monotonic energy counter
pub trait EnergyZone: Send + Sync {
    fn name(&self) -> &str;

    fn index(&self) -> i32;

    /// Where the counter is read from (sysfs path, BMC endpoint, ...)
    fn path(&self) -> &str;

    /// Current counter value. Increases monotonically until it wraps at `max_energy`.
    fn energy(&self) -> Result<Energy>;

    /// Value at which the counter wraps; zero when unknown
    fn max_energy(&self) -> Energy;

    fn key(&self) -> Zone {
        Zone::new(self.name(), self.path())
    }
}

/// Source of energy zones for the CPU/platform
pub trait PowerMeter: Send + Sync {
    fn name(&self) -> &str;

    fn zones(&self) -> Result<Vec<Arc<dyn EnergyZone>>>;

    fn zone(&self, name: &str) -> Result<Arc<dyn EnergyZone>> {
        self.zones()?
            .into_iter()
            .find(|z| z.name() == name)
            .ok_or_else(|| anyhow::anyhow!("zone {} not found", name))
    }

    /// Zone used to rank terminated workloads: package, then psys, then the first zone
    fn primary_energy_zone(&self) -> Result<Arc<dyn EnergyZone>> {
        let zones = self.zones()?;
        for preferred in [ZONE_PACKAGE, ZONE_PSYS] {
            if let Some(zone) = zones.iter().find(|z| z.name() == preferred) {
                return Ok(zone.clone());
            }
        }
        zones
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("power meter exposes no zones"))
    }
}

/// A GPU device as reported by the vendor driver
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuDevice {
    pub index: u32,
    pub uuid: String,
    pub name: String,
}

/// Device level GPU power statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct GpuPowerStats {
    pub total_power: Power,
    pub idle_power: Power,
    pub active_power: Power,
}

/// GPU power measurement and per-process attribution
pub trait GpuMeter: Send + Sync {
    fn vendor(&self) -> &str;

    fn devices(&self) -> Vec<GpuDevice>;

    fn device_power_stats(&self, index: u32) -> Result<GpuPowerStats>;

    fn total_energy(&self, index: u32) -> Result<Energy>;

    /// Power drawn per PID, in watts
    fn process_power(&self) -> Result<HashMap<u32, f64>>;
}
