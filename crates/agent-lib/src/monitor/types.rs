//! Snapshot data model

use crate::device::Zone;
use crate::resource::{ContainerRuntime, ProcessType};
use crate::units::{Energy, Power};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};

/// Power and energy of one entity in one zone
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Usage {
    /// Average power over the last interval
    pub power: Power,
    /// Energy attributed since the entity was first observed
    pub energy_total: Energy,
    /// Energy attributed during the last interval
    pub delta: Energy,
}

impl Usage {
    pub fn new(power: Power, energy_total: Energy) -> Self {
        Self {
            power,
            energy_total,
            delta: Energy::ZERO,
        }
    }
}

pub type ZoneUsageMap = BTreeMap<Zone, Usage>;

/// Node level readings of one zone
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct NodeZoneUsage {
    /// Raw counter value as read from the zone
    pub energy_total: Energy,
    pub active_energy_total: Energy,
    pub idle_energy_total: Energy,

    pub power: Power,
    pub active_power: Power,
    pub idle_power: Power,

    /// Active share of this interval's delta; the pool attributed to processes
    pub active_energy: Energy,
}

pub type NodeZoneUsageMap = BTreeMap<Zone, NodeZoneUsage>;

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub timestamp: DateTime<Utc>,
    pub usage_ratio: f64,
    pub zones: NodeZoneUsageMap,
}

impl Node {
    pub fn new(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            usage_ratio: 0.0,
            zones: NodeZoneUsageMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Process {
    pub pid: u32,
    pub comm: String,
    pub exe: String,
    pub process_type: ProcessType,
    pub cpu_total_time: f64,
    pub container_id: Option<String>,
    pub virtual_machine_id: Option<String>,
    pub zones: ZoneUsageMap,

    pub gpu_power: Power,
    pub gpu_energy_total: Energy,
}

impl Process {
    pub fn string_id(&self) -> String {
        self.pid.to_string()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Container {
    pub id: String,
    pub name: String,
    pub runtime: ContainerRuntime,
    pub pod_id: Option<String>,
    pub cpu_total_time: f64,
    pub zones: ZoneUsageMap,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Pod {
    pub id: String,
    pub name: String,
    pub namespace: String,
    pub cpu_total_time: f64,
    pub zones: ZoneUsageMap,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VirtualMachine {
    pub id: String,
    pub name: String,
    pub hypervisor: String,
    pub cpu_total_time: f64,
    pub zones: ZoneUsageMap,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GpuDeviceStats {
    pub device_index: u32,
    pub uuid: String,
    pub name: String,
    pub vendor: String,
    pub total_power: Power,
    pub idle_power: Power,
    pub active_power: Power,
    pub energy_total: Energy,
}

pub type Processes = HashMap<String, Process>;
pub type Containers = HashMap<String, Container>;
pub type Pods = HashMap<String, Pod>;
pub type VirtualMachines = HashMap<String, VirtualMachine>;

/// One immutable, internally consistent reading of the node
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub timestamp: DateTime<Utc>,
    pub node: Node,

    pub processes: Processes,
    pub terminated_processes: Processes,

    pub containers: Containers,
    pub terminated_containers: Containers,

    pub pods: Pods,
    pub terminated_pods: Pods,

    pub virtual_machines: VirtualMachines,
    pub terminated_virtual_machines: VirtualMachines,

    pub gpu_stats: Vec<GpuDeviceStats>,
}

impl Snapshot {
    pub fn new(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            node: Node::new(timestamp),
            processes: Processes::new(),
            terminated_processes: Processes::new(),
            containers: Containers::new(),
            terminated_containers: Containers::new(),
            pods: Pods::new(),
            terminated_pods: Pods::new(),
            virtual_machines: VirtualMachines::new(),
            terminated_virtual_machines: VirtualMachines::new(),
            gpu_stats: Vec::new(),
        }
    }
}

/// Anything whose final energy can be kept after it terminates
pub trait Resource: Clone + Send + Sync {
    fn string_id(&self) -> String;

    fn zone_usage(&self) -> &ZoneUsageMap;
}

impl Resource for Process {
    fn string_id(&self) -> String {
        Process::string_id(self)
    }

    fn zone_usage(&self) -> &ZoneUsageMap {
        &self.zones
    }
}

impl Resource for Container {
    fn string_id(&self) -> String {
        self.id.clone()
    }

    fn zone_usage(&self) -> &ZoneUsageMap {
        &self.zones
    }
}

impl Resource for Pod {
    fn string_id(&self) -> String {
        self.id.clone()
    }

    fn zone_usage(&self) -> &ZoneUsageMap {
        &self.zones
    }
}

impl Resource for VirtualMachine {
    fn string_id(&self) -> String {
        self.id.clone()
    }

    fn zone_usage(&self) -> &ZoneUsageMap {
        &self.zones
    }
}
