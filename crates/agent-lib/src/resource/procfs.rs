//! Resource informer backed by the proc filesystem

use super::cgroup::{extract_container_id, extract_pod_id, parse_cgroup_path};
use super::{
    async_trait, ContainerInfo, NodeResources, PodInfo, ProcessInfo, ProcessType,
    ResourceInformer, Resources, VirtualMachineInfo,
};
use anyhow::{Context, Result};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, trace};

/// Kernel clock ticks per second for /proc/<pid>/stat times
const USER_HZ: f64 = 100.0;

/// PF_KTHREAD from include/linux/sched.h
const PF_KTHREAD: u64 = 0x0020_0000;

/// Aggregate CPU counters from the first line of /proc/stat, in jiffies
#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct CpuStat {
    busy: u64,
    idle: u64,
}

impl CpuStat {
    fn parse(content: &str) -> Option<Self> {
        let line = content.lines().find(|l| l.starts_with("cpu "))?;
        let values: Vec<u64> = line
            .split_whitespace()
            .skip(1)
            .filter_map(|v| v.parse().ok())
            .collect();
        if values.len() < 4 {
            return None;
        }
        // user nice system idle iowait irq softirq steal
        let idle = values[3] + values.get(4).copied().unwrap_or(0);
        let busy = values
            .iter()
            .take(8)
            .enumerate()
            .filter(|(i, _)| *i != 3 && *i != 4)
            .map(|(_, v)| *v)
            .sum();
        Some(Self { busy, idle })
    }

    fn usage_ratio_since(&self, prev: &CpuStat) -> f64 {
        let busy = self.busy.saturating_sub(prev.busy) as f64;
        let idle = self.idle.saturating_sub(prev.idle) as f64;
        let total = busy + idle;
        if total == 0.0 {
            return 0.0;
        }
        busy / total
    }
}

/// Fields of interest from /proc/<pid>/stat
#[derive(Debug, Clone, PartialEq)]
struct PidStat {
    comm: String,
    flags: u64,
    cpu_total_time: f64,
}

impl PidStat {
    /// comm may contain spaces and parentheses, so split at the last ')'
    fn parse(content: &str) -> Option<Self> {
        let open = content.find('(')?;
        let close = content.rfind(')')?;
        let comm = content.get(open + 1..close)?.to_string();
        let rest: Vec<&str> = content.get(close + 1..)?.split_whitespace().collect();
        // rest[0] is field 3 (state); flags is field 9, utime 14, stime 15
        let flags = rest.get(6)?.parse().ok()?;
        let utime: u64 = rest.get(11)?.parse().ok()?;
        let stime: u64 = rest.get(12)?.parse().ok()?;
        Some(Self {
            comm,
            flags,
            cpu_total_time: (utime + stime) as f64 / USER_HZ,
        })
    }
}

#[derive(Default)]
struct ScanState {
    cpu_times: HashMap<u32, f64>,
    cpu_stat: Option<CpuStat>,
}

/// Scans /proc for processes and derives per-interval CPU-time deltas
pub struct ProcfsInformer {
    proc_path: PathBuf,
    state: Mutex<ScanState>,
}

impl ProcfsInformer {
    pub fn new(proc_path: impl Into<PathBuf>) -> Self {
        Self {
            proc_path: proc_path.into(),
            state: Mutex::new(ScanState::default()),
        }
    }

    async fn list_pids(&self) -> Result<Vec<u32>> {
        let mut entries = fs::read_dir(&self.proc_path)
            .await
            .with_context(|| format!("Failed to read {}", self.proc_path.display()))?;

        let mut pids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if let Some(pid) = entry.file_name().to_str().and_then(|n| n.parse().ok()) {
                pids.push(pid);
            }
        }
        Ok(pids)
    }

    async fn read_process(&self, pid: u32) -> Result<ProcessInfo> {
        let dir = self.proc_path.join(pid.to_string());
        let stat_content = fs::read_to_string(dir.join("stat"))
            .await
            .with_context(|| format!("Failed to read stat for pid {}", pid))?;
        let stat = PidStat::parse(&stat_content)
            .with_context(|| format!("Malformed stat for pid {}", pid))?;

        // Kernel threads have no exe and live in the root cgroup
        if stat.flags & PF_KTHREAD != 0 {
            return Ok(ProcessInfo {
                pid,
                comm: stat.comm,
                exe: String::new(),
                process_type: ProcessType::KernelThread,
                cpu_total_time: stat.cpu_total_time,
                cpu_time_delta: 0.0,
                container: None,
                virtual_machine: None,
            });
        }

        let exe = fs::read_link(dir.join("exe"))
            .await
            .map(|p| p.to_string_lossy().to_string())
            .unwrap_or_default();

        let container = match fs::read_to_string(dir.join("cgroup")).await {
            Ok(content) => parse_cgroup_path(&content).and_then(|path| container_from_path(&path)),
            Err(e) => {
                trace!(pid, error = %e, "No cgroup information");
                None
            }
        };

        let virtual_machine = if is_hypervisor(&stat.comm) {
            fs::read(dir.join("cmdline"))
                .await
                .ok()
                .and_then(|raw| vm_from_cmdline(&raw, &stat.comm))
        } else {
            None
        };

        let process_type = if virtual_machine.is_some() {
            ProcessType::VirtualMachine
        } else if container.is_some() {
            ProcessType::Container
        } else {
            ProcessType::Regular
        };

        Ok(ProcessInfo {
            pid,
            comm: stat.comm,
            exe,
            process_type,
            cpu_total_time: stat.cpu_total_time,
            cpu_time_delta: 0.0,
            container,
            virtual_machine,
        })
    }

    async fn read_cpu_stat(&self) -> Option<CpuStat> {
        let content = fs::read_to_string(self.proc_path.join("stat")).await.ok()?;
        CpuStat::parse(&content)
    }

    pub fn proc_path(&self) -> &Path {
        &self.proc_path
    }
}

#[async_trait]
impl ResourceInformer for ProcfsInformer {
    fn name(&self) -> &str {
        "procfs-informer"
    }

    async fn refresh(&self) -> Result<Resources> {
        let pids = self.list_pids().await?;
        let cpu_stat = self.read_cpu_stat().await;

        let mut processes = Vec::with_capacity(pids.len());
        let mut cpu_times = HashMap::with_capacity(pids.len());

        for pid in pids {
            // Processes may exit between listing and reading
            match self.read_process(pid).await {
                Ok(info) => {
                    cpu_times.insert(pid, info.cpu_total_time);
                    processes.push(info);
                }
                Err(e) => trace!(pid, error = %e, "Skipping process"),
            }
        }

        let mut state = self.state.lock().await;

        let mut total_delta = 0.0;
        for process in &mut processes {
            let prev = state.cpu_times.get(&process.pid).copied().unwrap_or(0.0);
            // A PID reused by a new process can report less CPU time than before
            process.cpu_time_delta = if process.cpu_total_time >= prev {
                process.cpu_total_time - prev
            } else {
                process.cpu_total_time
            };
            total_delta += process.cpu_time_delta;
        }

        let terminated: HashSet<u32> = state
            .cpu_times
            .keys()
            .filter(|pid| !cpu_times.contains_key(pid))
            .copied()
            .collect();

        let cpu_usage_ratio = match (cpu_stat, state.cpu_stat) {
            (Some(curr), Some(prev)) => curr.usage_ratio_since(&prev),
            _ => 0.0,
        };

        state.cpu_times = cpu_times;
        if cpu_stat.is_some() {
            state.cpu_stat = cpu_stat;
        }

        debug!(
            running = processes.len(),
            terminated = terminated.len(),
            cpu_time_delta = total_delta,
            cpu_usage_ratio,
            "Refreshed process information"
        );

        Ok(Resources {
            node: NodeResources {
                process_total_cpu_time_delta: total_delta,
                cpu_usage_ratio,
            },
            processes,
            terminated,
        })
    }
}

fn container_from_path(cgroup_path: &str) -> Option<ContainerInfo> {
    let (id, runtime) = extract_container_id(cgroup_path)?;
    // Names and namespaces come from the Kubernetes API, which this informer does not query
    let pod = extract_pod_id(cgroup_path).map(|pod_id| PodInfo {
        id: pod_id,
        name: String::new(),
        namespace: String::new(),
    });
    Some(ContainerInfo {
        id,
        name: String::new(),
        runtime,
        pod,
    })
}

fn is_hypervisor(comm: &str) -> bool {
    comm.starts_with("qemu-system") || comm.starts_with("qemu-kvm")
}

/// Identify a QEMU guest from its NUL separated command line
fn vm_from_cmdline(raw: &[u8], comm: &str) -> Option<VirtualMachineInfo> {
    let args: Vec<String> = raw
        .split(|b| *b == 0)
        .filter(|a| !a.is_empty())
        .map(|a| String::from_utf8_lossy(a).to_string())
        .collect();

    let value_of = |flag: &str| {
        args.iter()
            .position(|a| a == flag)
            .and_then(|i| args.get(i + 1))
            .cloned()
    };

    // -name guest=vm1,debug-threads=on  or  -name vm1
    let name = value_of("-name").map(|v| {
        let first = v.split(',').next().unwrap_or_default();
        first.strip_prefix("guest=").unwrap_or(first).to_string()
    });
    let uuid = value_of("-uuid");

    let id = uuid.clone().or_else(|| name.clone())?;
    Some(VirtualMachineInfo {
        id,
        name: name.unwrap_or_default(),
        hypervisor: if comm.contains("kvm") || args.iter().any(|a| a == "-enable-kvm" || a.contains("accel=kvm")) {
            "kvm".to_string()
        } else {
            "qemu".to_string()
        },
    })
}
