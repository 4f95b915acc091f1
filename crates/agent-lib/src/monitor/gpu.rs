//! GPU device and per-process readings

use super::types::GpuDeviceStats;
use crate::device::GpuMeter;
use crate::units::Energy;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

#[derive(Debug, Default)]
pub(crate) struct GpuReadings {
    pub devices: Vec<GpuDeviceStats>,
    /// Watts per PID, summed across meters
    pub process_power: HashMap<u32, f64>,
    pub errors: usize,
}

pub(crate) fn collect_gpu(meters: &[Arc<dyn GpuMeter>]) -> GpuReadings {
    let mut readings = GpuReadings::default();

    for meter in meters {
        for device in meter.devices() {
            let stats = match meter.device_power_stats(device.index) {
                Ok(stats) => stats,
                Err(e) => {
                    warn!(vendor = meter.vendor(), device = device.index, error = %e, "Failed to read GPU power");
                    readings.errors += 1;
                    continue;
                }
            };
            let energy_total = match meter.total_energy(device.index) {
                Ok(energy) => energy,
                Err(e) => {
                    warn!(vendor = meter.vendor(), device = device.index, error = %e, "Failed to read GPU energy");
                    readings.errors += 1;
                    Energy::ZERO
                }
            };

            readings.devices.push(GpuDeviceStats {
                device_index: device.index,
                uuid: device.uuid,
                name: device.name,
                vendor: meter.vendor().to_string(),
                total_power: stats.total_power,
                idle_power: stats.idle_power,
                active_power: stats.active_power,
                energy_total,
            });
        }

        match meter.process_power() {
            Ok(per_pid) => {
                for (pid, watts) in per_pid {
                    if watts.is_finite() && watts > 0.0 {
                        *readings.process_power.entry(pid).or_insert(0.0) += watts;
                    }
                }
            }
            Err(e) => {
                warn!(vendor = meter.vendor(), error = %e, "Failed to read GPU process power");
                readings.errors += 1;
            }
        }
    }

    readings
        .devices
        .sort_by(|a, b| (&a.vendor, a.device_index).cmp(&(&b.vendor, b.device_index)));
    readings
}
