//! Per-process attribution of node active energy by CPU-time share

use super::types::{Node, Process, Processes, Usage, ZoneUsageMap};
use crate::resource::{ProcessInfo, Resources};
use crate::units::{Energy, Power};
use std::collections::HashMap;

pub(crate) struct ProcessInput<'a> {
    pub resources: &'a Resources,
    pub node: &'a Node,
    /// Running processes of the previous snapshot, `None` on the first tick
    pub previous: Option<&'a Processes>,
    pub elapsed_secs: f64,
    /// GPU watts per PID
    pub gpu_power: &'a HashMap<u32, f64>,
}

fn cpu_share(info: &ProcessInfo, node_cpu_delta: f64) -> f64 {
    if info.cpu_time_delta.is_finite() && info.cpu_time_delta > 0.0 {
        info.cpu_time_delta / node_cpu_delta
    } else {
        0.0
    }
}

/// Usage of one process in every zone the node reported this tick.
///
/// A zone whose guard fails (no active energy, no CPU time, no active power)
/// reports zero power and zero delta but keeps the previous running total,
/// rather than restarting it at zero, so totals never decrease for a process
/// that persists. Zones missing from this tick's node reading (failed reads)
/// carry the previous usage forward the same way.
fn process_zones(
    info: &ProcessInfo,
    input: &ProcessInput<'_>,
    prev: Option<&Process>,
) -> ZoneUsageMap {
    let node_cpu_delta = input.resources.node.process_total_cpu_time_delta;
    let first_tick = input.previous.is_none();
    let mut zones = ZoneUsageMap::new();

    for (zone, node_usage) in &input.node.zones {
        let prev_total = prev
            .and_then(|p| p.zones.get(zone))
            .map(|u| u.energy_total)
            .unwrap_or(Energy::ZERO);

        // Nothing to divide: power is zero but the running total is kept
        let idle = node_usage.active_energy.is_zero()
            || node_cpu_delta.is_nan()
            || node_cpu_delta <= 0.0
            || (!first_tick && node_usage.active_power.is_zero());
        if idle {
            zones.insert(zone.clone(), Usage::new(Power::ZERO, prev_total));
            continue;
        }

        let share = cpu_share(info, node_cpu_delta);
        let delta = node_usage.active_energy.scale(share);
        let power = if first_tick {
            Power::ZERO
        } else {
            node_usage.active_power * share
        };

        zones.insert(
            zone.clone(),
            Usage {
                power,
                energy_total: prev_total + delta,
                delta,
            },
        );
    }

    if let Some(prev) = prev {
        carry_missing_zones(&mut zones, &prev.zones);
    }
    zones
}

/// Keep totals of zones absent from this tick, with zero power and delta
pub(crate) fn carry_missing_zones(zones: &mut ZoneUsageMap, previous: &ZoneUsageMap) {
    for (zone, usage) in previous {
        zones
            .entry(zone.clone())
            .or_insert_with(|| Usage::new(Power::ZERO, usage.energy_total));
    }
}

pub(crate) fn attribute_processes(input: &ProcessInput<'_>) -> Processes {
    let mut processes = Processes::with_capacity(input.resources.processes.len());

    for info in &input.resources.processes {
        let id = info.pid.to_string();
        let prev = input.previous.and_then(|p| p.get(&id));

        // Per-process GPU power has no meaning before the first interval
        let gpu_power = match input.previous {
            Some(_) => input
                .gpu_power
                .get(&info.pid)
                .map(|w| Power::from_watts(*w))
                .unwrap_or(Power::ZERO),
            None => Power::ZERO,
        };
        let mut gpu_energy_total = prev.map(|p| p.gpu_energy_total).unwrap_or(Energy::ZERO);
        // Approximated from instantaneous power; only once there is an interval
        if prev.is_some() && gpu_power > Power::ZERO {
            gpu_energy_total += gpu_power.energy_over(input.elapsed_secs);
        }

        let process = Process {
            pid: info.pid,
            comm: info.comm.clone(),
            exe: info.exe.clone(),
            process_type: info.process_type,
            cpu_total_time: info.cpu_total_time,
            container_id: info.container.as_ref().map(|c| c.id.clone()),
            virtual_machine_id: info.virtual_machine.as_ref().map(|vm| vm.id.clone()),
            zones: process_zones(info, input, prev),
            gpu_power,
            gpu_energy_total,
        };
        processes.insert(id, process);
    }

    processes
}
