//! Prometheus exposition of power snapshots
//!
//! `PowerCollector` is a `prometheus::core::Collector`: every scrape reads
//! the latest snapshot from a `PowerDataProvider` and rebuilds the metric
//! families from it. Reading the snapshot marks it exported, which lets the
//! monitor drop terminated workloads that have now been reported.

use crate::device::Zone;
use crate::monitor::{PowerDataProvider, Snapshot, ZoneUsageMap};
use prometheus::core::{Collector, Desc};
use prometheus::proto::MetricFamily;
use prometheus::{CounterVec, GaugeVec, Opts};
use std::sync::{Arc, Mutex};
use tracing::debug;

const NAMESPACE: &str = "power_agent";

const STATE_RUNNING: &str = "running";
const STATE_TERMINATED: &str = "terminated";

/// Joules counter and watts gauge pair sharing one label set
struct EnergyPowerVec {
    joules: CounterVec,
    watts: GaugeVec,
}

impl EnergyPowerVec {
    fn new(subsystem: &str, what: &str, labels: &[&str]) -> prometheus::Result<Self> {
        Ok(Self {
            joules: CounterVec::new(
                Opts::new(format!("{}_joules_total", subsystem), format!("Energy consumed by {} in joules", what))
                    .namespace(NAMESPACE),
                labels,
            )?,
            watts: GaugeVec::new(
                Opts::new(format!("{}_watts", subsystem), format!("Power drawn by {} in watts", what))
                    .namespace(NAMESPACE),
                labels,
            )?,
        })
    }

    fn reset(&self) {
        self.joules.reset();
        self.watts.reset();
    }

    fn set(&self, labels: &[&str], joules: f64, watts: f64) {
        if joules > 0.0 {
            self.joules.with_label_values(labels).inc_by(joules);
        } else {
            // Keep the series present at zero
            self.joules.with_label_values(labels);
        }
        self.watts.with_label_values(labels).set(watts);
    }

    fn set_zones(&self, base: &[&str], zones: &ZoneUsageMap) {
        for (zone, usage) in zones {
            let labels = with_zone(base, zone);
            self.set(&labels, usage.energy_total.joules(), usage.power.watts());
        }
    }

    fn descs(&self) -> Vec<&Desc> {
        let mut descs = self.joules.desc();
        descs.extend(self.watts.desc());
        descs
    }

    fn collect(&self) -> Vec<MetricFamily> {
        let mut families = self.joules.collect();
        families.extend(self.watts.collect());
        families
    }
}

fn with_zone<'a>(base: &[&'a str], zone: &'a Zone) -> Vec<&'a str> {
    let mut labels = base.to_vec();
    labels.push(zone.name.as_str());
    labels
}

struct Families {
    node: EnergyPowerVec,
    node_active: EnergyPowerVec,
    node_idle: EnergyPowerVec,
    node_usage_ratio: GaugeVec,
    process: EnergyPowerVec,
    process_gpu: EnergyPowerVec,
    container: EnergyPowerVec,
    pod: EnergyPowerVec,
    vm: EnergyPowerVec,
    gpu: EnergyPowerVec,
    gpu_idle_watts: GaugeVec,
    gpu_active_watts: GaugeVec,
}

impl Families {
    fn new() -> prometheus::Result<Self> {
        let gpu_labels = ["gpu", "uuid", "name", "vendor"];
        Ok(Self {
            node: EnergyPowerVec::new("node_cpu", "the node per zone", &["zone"])?,
            node_active: EnergyPowerVec::new(
                "node_cpu_active",
                "workloads on the node per zone",
                &["zone"],
            )?,
            node_idle: EnergyPowerVec::new(
                "node_cpu_idle",
                "the idle node per zone",
                &["zone"],
            )?,
            node_usage_ratio: GaugeVec::new(
                Opts::new("node_cpu_usage_ratio", "Busy share of node CPU time")
                    .namespace(NAMESPACE),
                &[],
            )?,
            process: EnergyPowerVec::new(
                "process_cpu",
                "a process per zone",
                &["pid", "comm", "exe", "type", "container_id", "vm_id", "state", "zone"],
            )?,
            process_gpu: EnergyPowerVec::new(
                "process_gpu",
                "a process on GPUs",
                &["pid", "comm", "state"],
            )?,
            container: EnergyPowerVec::new(
                "container_cpu",
                "a container per zone",
                &["container_id", "container_name", "runtime", "pod_id", "state", "zone"],
            )?,
            pod: EnergyPowerVec::new(
                "pod_cpu",
                "a pod per zone",
                &["pod_id", "pod_name", "pod_namespace", "state", "zone"],
            )?,
            vm: EnergyPowerVec::new(
                "vm_cpu",
                "a virtual machine per zone",
                &["vm_id", "vm_name", "hypervisor", "state", "zone"],
            )?,
            gpu: EnergyPowerVec::new("gpu", "a GPU device", &gpu_labels)?,
            gpu_idle_watts: GaugeVec::new(
                Opts::new("gpu_idle_watts", "Idle power of a GPU device in watts")
                    .namespace(NAMESPACE),
                &gpu_labels,
            )?,
            gpu_active_watts: GaugeVec::new(
                Opts::new("gpu_active_watts", "Active power of a GPU device in watts")
                    .namespace(NAMESPACE),
                &gpu_labels,
            )?,
        })
    }

    fn energy_vecs(&self) -> [&EnergyPowerVec; 9] {
        [
            &self.node,
            &self.node_active,
            &self.node_idle,
            &self.process,
            &self.process_gpu,
            &self.container,
            &self.pod,
            &self.vm,
            &self.gpu,
        ]
    }

    fn gauges(&self) -> [&GaugeVec; 3] {
        [
            &self.node_usage_ratio,
            &self.gpu_idle_watts,
            &self.gpu_active_watts,
        ]
    }

    fn reset(&self) {
        self.energy_vecs().into_iter().for_each(EnergyPowerVec::reset);
        self.gauges().into_iter().for_each(|g| g.reset());
    }

    fn fill(&self, snapshot: &Snapshot) {
        for (zone, usage) in &snapshot.node.zones {
            let labels = [zone.name.as_str()];
            self.node
                .set(&labels, usage.energy_total.joules(), usage.power.watts());
            self.node_active.set(
                &labels,
                usage.active_energy_total.joules(),
                usage.active_power.watts(),
            );
            self.node_idle.set(
                &labels,
                usage.idle_energy_total.joules(),
                usage.idle_power.watts(),
            );
        }
        self.node_usage_ratio
            .with_label_values(&[])
            .set(snapshot.node.usage_ratio);

        for (state, processes) in [
            (STATE_RUNNING, &snapshot.processes),
            (STATE_TERMINATED, &snapshot.terminated_processes),
        ] {
            for (pid, p) in processes {
                let base = [
                    pid.as_str(),
                    p.comm.as_str(),
                    p.exe.as_str(),
                    p.process_type.as_str(),
                    p.container_id.as_deref().unwrap_or(""),
                    p.virtual_machine_id.as_deref().unwrap_or(""),
                    state,
                ];
                self.process.set_zones(&base, &p.zones);
                if !p.gpu_energy_total.is_zero() || !p.gpu_power.is_zero() {
                    self.process_gpu.set(
                        &[pid.as_str(), p.comm.as_str(), state],
                        p.gpu_energy_total.joules(),
                        p.gpu_power.watts(),
                    );
                }
            }
        }

        for (state, containers) in [
            (STATE_RUNNING, &snapshot.containers),
            (STATE_TERMINATED, &snapshot.terminated_containers),
        ] {
            for c in containers.values() {
                let runtime = c.runtime.to_string();
                let base = [
                    c.id.as_str(),
                    c.name.as_str(),
                    runtime.as_str(),
                    c.pod_id.as_deref().unwrap_or(""),
                    state,
                ];
                self.container.set_zones(&base, &c.zones);
            }
        }

        for (state, pods) in [
            (STATE_RUNNING, &snapshot.pods),
            (STATE_TERMINATED, &snapshot.terminated_pods),
        ] {
            for p in pods.values() {
                let base = [p.id.as_str(), p.name.as_str(), p.namespace.as_str(), state];
                self.pod.set_zones(&base, &p.zones);
            }
        }

        for (state, vms) in [
            (STATE_RUNNING, &snapshot.virtual_machines),
            (STATE_TERMINATED, &snapshot.terminated_virtual_machines),
        ] {
            for vm in vms.values() {
                let base = [vm.id.as_str(), vm.name.as_str(), vm.hypervisor.as_str(), state];
                self.vm.set_zones(&base, &vm.zones);
            }
        }

        for gpu in &snapshot.gpu_stats {
            let index = gpu.device_index.to_string();
            let labels = [
                index.as_str(),
                gpu.uuid.as_str(),
                gpu.name.as_str(),
                gpu.vendor.as_str(),
            ];
            self.gpu
                .set(&labels, gpu.energy_total.joules(), gpu.total_power.watts());
            self.gpu_idle_watts
                .with_label_values(&labels)
                .set(gpu.idle_power.watts());
            self.gpu_active_watts
                .with_label_values(&labels)
                .set(gpu.active_power.watts());
        }
    }

    fn collect(&self) -> Vec<MetricFamily> {
        let mut families: Vec<MetricFamily> = self
            .energy_vecs()
            .into_iter()
            .flat_map(|v| v.collect())
            .collect();
        families.extend(self.gauges().into_iter().flat_map(|g| g.collect()));
        families
    }
}

/// Scrape-time collector over a power data provider
pub struct PowerCollector {
    provider: Arc<dyn PowerDataProvider>,
    // Scrapes rebuild shared vectors, so they take turns
    families: Mutex<Families>,
    descs: Vec<Desc>,
}

impl PowerCollector {
    pub fn new(provider: Arc<dyn PowerDataProvider>) -> prometheus::Result<Self> {
        let families = Families::new()?;
        let descs = families
            .energy_vecs()
            .into_iter()
            .flat_map(|v| v.descs())
            .chain(families.gauges().into_iter().flat_map(|g| g.desc()))
            .cloned()
            .collect();

        Ok(Self {
            provider,
            families: Mutex::new(families),
            descs,
        })
    }
}

impl Collector for PowerCollector {
    fn desc(&self) -> Vec<&Desc> {
        self.descs.iter().collect()
    }

    fn collect(&self) -> Vec<MetricFamily> {
        let snapshot = match self.provider.snapshot() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                debug!(error = %e, "No power snapshot to export");
                return Vec::new();
            }
        };

        let families = match self.families.lock() {
            Ok(families) => families,
            Err(poisoned) => poisoned.into_inner(),
        };
        families.reset();
        families.fill(&snapshot);
        families.collect()
    }
}
