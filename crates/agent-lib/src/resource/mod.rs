//! Workload discovery
//!
//! A `ResourceInformer` produces, once per tick, the set of running
//! processes with their CPU-time deltas and container/pod/VM linkage, plus
//! the PIDs that terminated since the previous refresh.

mod cgroup;
mod procfs;

pub use cgroup::{extract_container_id, extract_pod_id, parse_cgroup_path, ContainerRuntime};
pub use procfs::ProcfsInformer;

pub use async_trait::async_trait;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Kind of a process as seen by the informer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProcessType {
    #[default]
    Regular,
    KernelThread,
    Container,
    VirtualMachine,
}

impl ProcessType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessType::Regular => "regular",
            ProcessType::KernelThread => "kernel-thread",
            ProcessType::Container => "container",
            ProcessType::VirtualMachine => "vm",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PodInfo {
    pub id: String,
    pub name: String,
    pub namespace: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub runtime: ContainerRuntime,
    pub pod: Option<PodInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VirtualMachineInfo {
    pub id: String,
    pub name: String,
    pub hypervisor: String,
}

/// A running process observed during a refresh
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub pid: u32,
    pub comm: String,
    pub exe: String,
    pub process_type: ProcessType,
    /// Total CPU time in seconds since process start
    pub cpu_total_time: f64,
    /// CPU seconds consumed since the previous refresh
    pub cpu_time_delta: f64,
    pub container: Option<ContainerInfo>,
    pub virtual_machine: Option<VirtualMachineInfo>,
}

/// Node level CPU accounting for one refresh interval
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeResources {
    /// Sum of all process CPU-time deltas, the attribution denominator
    pub process_total_cpu_time_delta: f64,
    /// Share of node CPU time that was busy (0.0 - 1.0)
    pub cpu_usage_ratio: f64,
}

/// Result of a single informer refresh
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Resources {
    pub node: NodeResources,
    pub processes: Vec<ProcessInfo>,
    /// PIDs that were running at the previous refresh and are gone now
    pub terminated: HashSet<u32>,
}

/// Source of per-tick workload information
#[async_trait]
pub trait ResourceInformer: Send + Sync {
    fn name(&self) -> &str;

    /// Rescan workloads. Each PID is reported terminated at most once.
    async fn refresh(&self) -> Result<Resources>;
}
