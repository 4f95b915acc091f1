//! Container, pod and VM roll-ups of process usage

use super::process::carry_missing_zones;
use super::types::{
    Container, Containers, Pod, Pods, Processes, VirtualMachine, VirtualMachines, ZoneUsageMap,
};
use crate::resource::{ContainerInfo, ProcessInfo, VirtualMachineInfo};
use crate::units::Energy;
use std::collections::HashMap;

#[derive(Debug, Default)]
pub(crate) struct Workloads {
    pub containers: Containers,
    pub pods: Pods,
    pub virtual_machines: VirtualMachines,
}

/// Previous running aggregates, used to carry energy totals forward
#[derive(Clone, Copy)]
pub(crate) struct PreviousWorkloads<'a> {
    pub containers: Option<&'a Containers>,
    pub pods: Option<&'a Pods>,
    pub virtual_machines: Option<&'a VirtualMachines>,
}

/// Add child usage into a parent: power and interval energy are summed,
/// totals are settled afterwards by `settle_totals`.
fn accumulate(parent: &mut ZoneUsageMap, child: &ZoneUsageMap) {
    for (zone, usage) in child {
        let entry = parent.entry(zone.clone()).or_default();
        entry.power += usage.power;
        entry.delta += usage.delta;
    }
}

/// Totals are the previous total plus this interval's summed delta. Zones
/// the aggregate had before but no child reports now keep their total.
fn settle_totals(zones: &mut ZoneUsageMap, previous: Option<&ZoneUsageMap>) {
    for (zone, usage) in zones.iter_mut() {
        let prev_total = previous
            .and_then(|p| p.get(zone))
            .map(|u| u.energy_total)
            .unwrap_or(Energy::ZERO);
        usage.energy_total = prev_total + usage.delta;
    }
    if let Some(previous) = previous {
        carry_missing_zones(zones, previous);
    }
}

fn new_container(info: &ContainerInfo) -> Container {
    Container {
        id: info.id.clone(),
        name: info.name.clone(),
        runtime: info.runtime,
        pod_id: info.pod.as_ref().map(|p| p.id.clone()),
        cpu_total_time: 0.0,
        zones: ZoneUsageMap::new(),
    }
}

fn new_vm(info: &VirtualMachineInfo) -> VirtualMachine {
    VirtualMachine {
        id: info.id.clone(),
        name: info.name.clone(),
        hypervisor: info.hypervisor.clone(),
        cpu_total_time: 0.0,
        zones: ZoneUsageMap::new(),
    }
}

pub(crate) fn aggregate_workloads(
    infos: &[ProcessInfo],
    processes: &Processes,
    previous: PreviousWorkloads<'_>,
) -> Workloads {
    let mut containers = Containers::new();
    let mut pods = Pods::new();
    let mut vms = VirtualMachines::new();

    for info in infos {
        let Some(process) = processes.get(&info.pid.to_string()) else {
            continue;
        };

        if let Some(c) = &info.container {
            let container = containers
                .entry(c.id.clone())
                .or_insert_with(|| new_container(c));
            container.cpu_total_time += process.cpu_total_time;
            accumulate(&mut container.zones, &process.zones);

            if let Some(p) = &c.pod {
                pods.entry(p.id.clone()).or_insert_with(|| Pod {
                    id: p.id.clone(),
                    name: p.name.clone(),
                    namespace: p.namespace.clone(),
                    cpu_total_time: 0.0,
                    zones: ZoneUsageMap::new(),
                });
            }
        }

        if let Some(v) = &info.virtual_machine {
            let vm = vms.entry(v.id.clone()).or_insert_with(|| new_vm(v));
            vm.cpu_total_time += process.cpu_total_time;
            accumulate(&mut vm.zones, &process.zones);
        }
    }

    // Pods are built from their containers so the two levels stay consistent
    let mut by_pod: HashMap<&str, Vec<&Container>> = HashMap::new();
    for container in containers.values() {
        if let Some(pod_id) = &container.pod_id {
            by_pod.entry(pod_id.as_str()).or_default().push(container);
        }
    }
    for (pod_id, members) in by_pod {
        if let Some(pod) = pods.get_mut(pod_id) {
            for container in members {
                pod.cpu_total_time += container.cpu_total_time;
                accumulate(&mut pod.zones, &container.zones);
            }
        }
    }

    for (id, container) in containers.iter_mut() {
        let prev = previous.containers.and_then(|p| p.get(id)).map(|c| &c.zones);
        settle_totals(&mut container.zones, prev);
    }
    for (id, pod) in pods.iter_mut() {
        let prev = previous.pods.and_then(|p| p.get(id)).map(|p| &p.zones);
        settle_totals(&mut pod.zones, prev);
    }
    for (id, vm) in vms.iter_mut() {
        let prev = previous.virtual_machines.and_then(|p| p.get(id)).map(|v| &v.zones);
        settle_totals(&mut vm.zones, prev);
    }

    Workloads {
        containers,
        pods,
        virtual_machines: vms,
    }
}

/// Entries of `previous` that are no longer running
pub(crate) fn departed<'a, T>(
    previous: &'a HashMap<String, T>,
    current: &'a HashMap<String, T>,
) -> impl Iterator<Item = &'a T> + 'a {
    previous
        .iter()
        .filter(move |(id, _)| !current.contains_key(*id))
        .map(|(_, item)| item)
}
