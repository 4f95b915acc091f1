//! Node level energy and power per zone

use super::energy::calculate_energy_delta;
use super::types::{Node, NodeZoneUsage};
use crate::device::{EnergyZone, Zone};
use crate::units::{Energy, Power};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

/// Last good reading of a zone
#[derive(Debug, Clone, Copy)]
pub(crate) struct ZoneSample {
    pub raw: Energy,
    pub read_at: DateTime<Utc>,
    pub active_energy_total: Energy,
    pub idle_energy_total: Energy,
}

pub(crate) struct NodeReading {
    pub node: Node,
    pub failed_zones: Vec<String>,
}

pub(crate) fn sanitize_ratio(ratio: f64) -> f64 {
    if ratio.is_finite() {
        ratio.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

pub(crate) fn elapsed_secs(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from)
        .num_microseconds()
        .map(|us| us as f64 / 1_000_000.0)
        .unwrap_or(0.0)
}

/// Read every zone and split its interval energy into active and idle parts.
///
/// A zone that fails to read is left out of this node reading. Its last good
/// sample is kept, so the next successful delta covers the whole gap.
pub(crate) fn compute_node(
    zones: &[Arc<dyn EnergyZone>],
    samples: &mut HashMap<Zone, ZoneSample>,
    usage_ratio: f64,
    now: DateTime<Utc>,
) -> NodeReading {
    let ratio = sanitize_ratio(usage_ratio);
    let mut node = Node::new(now);
    node.usage_ratio = ratio;
    let mut failed_zones = Vec::new();

    for zone in zones {
        let key = zone.key();
        let raw = match zone.energy() {
            Ok(raw) => raw,
            Err(e) => {
                warn!(zone = %key, error = %e, "Failed to read zone energy");
                failed_zones.push(key.name.clone());
                continue;
            }
        };

        let usage = match samples.get(&key) {
            Some(prev) => {
                let delta = calculate_energy_delta(raw, prev.raw, zone.max_energy());
                let active_energy = delta.scale(ratio);
                let idle_energy = delta.saturating_sub(active_energy);

                let power = Power::from_energy(delta, elapsed_secs(prev.read_at, now));
                let active_power = power * ratio;

                NodeZoneUsage {
                    energy_total: raw,
                    active_energy_total: prev.active_energy_total + active_energy,
                    idle_energy_total: prev.idle_energy_total + idle_energy,
                    power,
                    active_power,
                    idle_power: power - active_power,
                    active_energy,
                }
            }
            None => {
                // No baseline yet: split the raw counter so totals start
                // somewhere sensible, power stays zero until a second reading
                let active_energy = raw.scale(ratio);
                NodeZoneUsage {
                    energy_total: raw,
                    active_energy_total: active_energy,
                    idle_energy_total: raw.saturating_sub(active_energy),
                    power: Power::ZERO,
                    active_power: Power::ZERO,
                    idle_power: Power::ZERO,
                    active_energy,
                }
            }
        };

        samples.insert(
            key.clone(),
            ZoneSample {
                raw,
                read_at: now,
                active_energy_total: usage.active_energy_total,
                idle_energy_total: usage.idle_energy_total,
            },
        );
        node.zones.insert(key, usage);
    }

    NodeReading { node, failed_zones }
}
