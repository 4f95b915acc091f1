//! Power attribution engine
//!
//! Each tick reads every energy zone, splits the node's active energy across
//! running processes by CPU-time share, rolls process usage up into
//! containers, pods and VMs, and publishes the result as one immutable
//! `Snapshot`. Readers only ever see a complete snapshot.

pub mod clock;
mod energy;
mod gpu;
mod r#loop;
mod node;
mod process;
mod tracker;
mod types;
mod workload;

#[cfg(test)]
mod tests;

pub use clock::{Clock, ManualClock, SystemClock};
pub use energy::calculate_energy_delta;
pub use r#loop::{LoopState, MonitorLoop};
pub use tracker::TerminatedResourceTracker;
pub use types::*;

use crate::device::{GpuMeter, PowerMeter, Zone};
use crate::error::{MonitorError, Result};
use crate::observability::{MonitorMetrics, StructuredLogger};
use crate::resource::{ResourceInformer, Resources};
use crate::units::Energy;
use chrono::{DateTime, TimeZone, Utc};
use gpu::collect_gpu;
use node::{compute_node, elapsed_secs, ZoneSample};
use process::{attribute_processes, ProcessInput};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};
use tracing::debug;
use workload::{aggregate_workloads, departed, PreviousWorkloads, Workloads};

/// Engine settings
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorConfig {
    /// Sampling period
    pub interval: Duration,
    /// Extra slack on top of two intervals before the collector counts as stalled
    pub max_staleness: Duration,
    /// Capacity of each terminated tracker, zero disables tracking
    pub max_terminated: usize,
    /// Terminated entries below this energy are evicted first
    pub min_terminated_energy_threshold: Energy,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            max_staleness: Duration::from_millis(500),
            max_terminated: 500,
            min_terminated_energy_threshold: Energy::from_joules(10.0),
        }
    }
}

impl MonitorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.interval.is_zero() {
            return Err(MonitorError::InvalidConfig(
                "interval must be greater than zero".to_string(),
            ));
        }
        if self.max_staleness.is_zero() {
            return Err(MonitorError::InvalidConfig(
                "max staleness must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Longest gap between publishes that still counts as live
    pub fn liveness_limit(&self) -> Duration {
        self.interval * 2 + self.max_staleness
    }
}

/// Read side of the monitor, consumed by exporters
pub trait PowerDataProvider: Send + Sync {
    /// Latest published snapshot. Reading marks it as exported.
    fn snapshot(&self) -> Result<Arc<Snapshot>>;

    /// Publish generation counter; changes after every successful publish.
    /// Slow receivers may see several publishes coalesced into one change.
    fn data_channel(&self) -> watch::Receiver<u64>;

    fn zone_names(&self) -> Vec<String>;

    fn last_collection_time(&self) -> Option<DateTime<Utc>>;
}

struct Trackers {
    processes: TerminatedResourceTracker<Process>,
    containers: TerminatedResourceTracker<Container>,
    pods: TerminatedResourceTracker<Pod>,
    virtual_machines: TerminatedResourceTracker<VirtualMachine>,
}

impl Trackers {
    fn new(target: Option<Zone>, config: &MonitorConfig) -> Self {
        let max = config.max_terminated;
        let threshold = config.min_terminated_energy_threshold;
        Self {
            processes: TerminatedResourceTracker::new("process", target.clone(), max, threshold),
            containers: TerminatedResourceTracker::new("container", target.clone(), max, threshold),
            pods: TerminatedResourceTracker::new("pod", target.clone(), max, threshold),
            virtual_machines: TerminatedResourceTracker::new("vm", target, max, threshold),
        }
    }

    fn clear(&mut self) {
        self.processes.clear();
        self.containers.clear();
        self.pods.clear();
        self.virtual_machines.clear();
    }
}

/// State owned by the single writer
struct WriterState {
    zone_samples: HashMap<Zone, ZoneSample>,
    trackers: Trackers,
}

pub struct PowerMonitor {
    config: MonitorConfig,
    meter: Arc<dyn PowerMeter>,
    gpu_meters: Vec<Arc<dyn GpuMeter>>,
    informer: Arc<dyn ResourceInformer>,
    clock: Arc<dyn Clock>,
    metrics: MonitorMetrics,
    logger: Option<StructuredLogger>,
    zone_names: Vec<String>,

    writer: Mutex<WriterState>,

    published: RwLock<Option<Arc<Snapshot>>>,
    /// Set once any reader has seen the current snapshot
    exported: AtomicBool,
    /// Unix nanos of the last publish, zero before the first one
    last_collection_nanos: AtomicI64,
    data_tx: watch::Sender<u64>,
}

impl std::fmt::Debug for PowerMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PowerMonitor")
            .field("config", &self.config)
            .field("meter", &self.meter.name())
            .field("informer", &self.informer.name())
            .field("zones", &self.zone_names)
            .finish()
    }
}

impl PowerMonitor {
    pub fn builder() -> PowerMonitorBuilder {
        PowerMonitorBuilder::new()
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub fn interval(&self) -> Duration {
        self.config.interval
    }

    pub fn meter_name(&self) -> &str {
        self.meter.name()
    }

    /// Run one tick: sample, attribute and publish.
    ///
    /// Ticks are serialized. On error nothing is published and the previous
    /// snapshot stays current.
    pub async fn refresh(&self) -> Result<Arc<Snapshot>> {
        let started = Instant::now();
        let mut writer = self.writer.lock().await;

        match self.tick(&mut writer).await {
            Ok(snapshot) => {
                self.metrics.observe_tick(started.elapsed().as_secs_f64());
                debug!(
                    processes = snapshot.processes.len(),
                    terminated = snapshot.terminated_processes.len(),
                    zones = snapshot.node.zones.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Snapshot published"
                );
                Ok(snapshot)
            }
            Err(e) => {
                self.metrics.inc_ticks_skipped();
                Err(e)
            }
        }
    }

    async fn tick(&self, writer: &mut WriterState) -> Result<Arc<Snapshot>> {
        let resources = self.informer.refresh().await.map_err(|e| {
            self.metrics.inc_informer_errors();
            MonitorError::Informer(e)
        })?;
        let zones = self.meter.zones().map_err(MonitorError::Zones)?;
        let previous = self.current()?;
        let now = self.clock.now();

        // Terminated data is only dropped once a reader has seen it
        if self.exported.load(Ordering::Acquire) {
            writer.trackers.clear();
        }

        let reading = compute_node(
            &zones,
            &mut writer.zone_samples,
            resources.node.cpu_usage_ratio,
            now,
        );
        for zone in &reading.failed_zones {
            self.metrics.inc_zone_read_errors(zone);
        }

        let gpu = collect_gpu(&self.gpu_meters);
        if gpu.errors > 0 {
            self.metrics.inc_gpu_errors(gpu.errors as u64);
        }

        let previous = previous.as_deref();
        let processes = attribute_processes(&ProcessInput {
            resources: &resources,
            node: &reading.node,
            previous: previous.map(|p| &p.processes),
            elapsed_secs: previous.map(|p| elapsed_secs(p.timestamp, now)).unwrap_or(0.0),
            gpu_power: &gpu.process_power,
        });
        let workloads = aggregate_workloads(
            &resources.processes,
            &processes,
            PreviousWorkloads {
                containers: previous.map(|p| &p.containers),
                pods: previous.map(|p| &p.pods),
                virtual_machines: previous.map(|p| &p.virtual_machines),
            },
        );

        if let Some(prev) = previous {
            self.track_terminated(
                &mut writer.trackers,
                prev,
                &resources,
                &processes,
                &workloads,
                now,
            );
        }

        let trackers = &writer.trackers;
        let snapshot = Snapshot {
            timestamp: now,
            node: reading.node,
            terminated_processes: trackers.processes.items(),
            terminated_containers: trackers.containers.items(),
            terminated_pods: trackers.pods.items(),
            terminated_virtual_machines: trackers.virtual_machines.items(),
            processes,
            containers: workloads.containers,
            pods: workloads.pods,
            virtual_machines: workloads.virtual_machines,
            gpu_stats: gpu.devices,
        };
        self.record_counts(&snapshot);

        self.publish(snapshot)
    }

    fn track_terminated(
        &self,
        trackers: &mut Trackers,
        prev: &Snapshot,
        resources: &Resources,
        processes: &Processes,
        workloads: &Workloads,
        now: DateTime<Utc>,
    ) {
        // Reported by the informer, or simply gone from the running set
        let mut ended: HashSet<&str> = resources
            .terminated
            .iter()
            .filter_map(|pid| prev.processes.get_key_value(&pid.to_string()))
            .map(|(id, _)| id.as_str())
            .collect();
        ended.extend(
            prev.processes
                .keys()
                .filter(|id| !processes.contains_key(*id))
                .map(String::as_str),
        );

        let mut evicted = Vec::new();
        for id in ended {
            if let Some(process) = prev.processes.get(id) {
                evicted.extend(trackers.processes.add(process.clone(), now));
            }
        }
        self.report_evictions(trackers.processes.kind(), evicted);

        let evicted = departed(&prev.containers, &workloads.containers)
            .flat_map(|c| trackers.containers.add(c.clone(), now))
            .collect();
        self.report_evictions(trackers.containers.kind(), evicted);

        let evicted = departed(&prev.pods, &workloads.pods)
            .flat_map(|p| trackers.pods.add(p.clone(), now))
            .collect();
        self.report_evictions(trackers.pods.kind(), evicted);

        let evicted = departed(&prev.virtual_machines, &workloads.virtual_machines)
            .flat_map(|vm| trackers.virtual_machines.add(vm.clone(), now))
            .collect();
        self.report_evictions(trackers.virtual_machines.kind(), evicted);
    }

    fn report_evictions(&self, kind: &str, evicted: Vec<String>) {
        if evicted.is_empty() {
            return;
        }
        self.metrics
            .inc_terminated_evictions(kind, evicted.len() as u64);
        if let Some(logger) = &self.logger {
            logger.log_terminated_evicted(kind, &evicted);
        }
    }

    fn record_counts(&self, snapshot: &Snapshot) {
        let m = &self.metrics;
        m.set_workloads(
            "process",
            snapshot.processes.len(),
            snapshot.terminated_processes.len(),
        );
        m.set_workloads(
            "container",
            snapshot.containers.len(),
            snapshot.terminated_containers.len(),
        );
        m.set_workloads("pod", snapshot.pods.len(), snapshot.terminated_pods.len());
        m.set_workloads(
            "vm",
            snapshot.virtual_machines.len(),
            snapshot.terminated_virtual_machines.len(),
        );
    }

    fn publish(&self, snapshot: Snapshot) -> Result<Arc<Snapshot>> {
        let snapshot = Arc::new(snapshot);
        {
            let mut published = self
                .published
                .write()
                .map_err(|_| MonitorError::LockPoisoned)?;
            *published = Some(Arc::clone(&snapshot));
            self.exported.store(false, Ordering::Release);
        }

        let nanos = snapshot.timestamp.timestamp_nanos_opt().unwrap_or(i64::MAX);
        self.last_collection_nanos.store(nanos, Ordering::Release);
        self.data_tx.send_modify(|generation| *generation += 1);
        Ok(snapshot)
    }

    /// Latest snapshot without marking it exported
    pub fn current(&self) -> Result<Option<Arc<Snapshot>>> {
        let published = self
            .published
            .read()
            .map_err(|_| MonitorError::LockPoisoned)?;
        Ok(published.clone())
    }

    pub fn is_live(&self) -> Result<()> {
        let last = self
            .last_collection_time()
            .ok_or(MonitorError::NoHeartbeat)?;
        let age = (self.clock.now() - last).to_std().unwrap_or_default();
        let limit = self.config.liveness_limit();
        if age > limit {
            return Err(MonitorError::CollectorStalled { age, limit });
        }
        Ok(())
    }

    pub fn is_ready(&self) -> Result<()> {
        self.current()?.map(|_| ()).ok_or(MonitorError::NoData)
    }
}

impl PowerDataProvider for PowerMonitor {
    fn snapshot(&self) -> Result<Arc<Snapshot>> {
        let published = self
            .published
            .read()
            .map_err(|_| MonitorError::LockPoisoned)?;
        let snapshot = published.clone().ok_or(MonitorError::NoData)?;
        self.exported.store(true, Ordering::Release);
        Ok(snapshot)
    }

    fn data_channel(&self) -> watch::Receiver<u64> {
        self.data_tx.subscribe()
    }

    fn zone_names(&self) -> Vec<String> {
        self.zone_names.clone()
    }

    fn last_collection_time(&self) -> Option<DateTime<Utc>> {
        match self.last_collection_nanos.load(Ordering::Acquire) {
            0 => None,
            nanos => Some(Utc.timestamp_nanos(nanos)),
        }
    }
}

/// Builder for `PowerMonitor`
pub struct PowerMonitorBuilder {
    config: MonitorConfig,
    meter: Option<Arc<dyn PowerMeter>>,
    gpu_meters: Vec<Arc<dyn GpuMeter>>,
    informer: Option<Arc<dyn ResourceInformer>>,
    clock: Option<Arc<dyn Clock>>,
    logger: Option<StructuredLogger>,
}

impl PowerMonitorBuilder {
    pub fn new() -> Self {
        Self {
            config: MonitorConfig::default(),
            meter: None,
            gpu_meters: Vec::new(),
            informer: None,
            clock: None,
            logger: None,
        }
    }

    pub fn config(mut self, config: MonitorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.config.interval = interval;
        self
    }

    pub fn max_staleness(mut self, max_staleness: Duration) -> Self {
        self.config.max_staleness = max_staleness;
        self
    }

    pub fn max_terminated(mut self, max_terminated: usize) -> Self {
        self.config.max_terminated = max_terminated;
        self
    }

    pub fn min_terminated_energy_threshold(mut self, threshold: Energy) -> Self {
        self.config.min_terminated_energy_threshold = threshold;
        self
    }

    pub fn power_meter(mut self, meter: Arc<dyn PowerMeter>) -> Self {
        self.meter = Some(meter);
        self
    }

    /// Add a GPU meter; may be called once per vendor
    pub fn gpu_meter(mut self, meter: Arc<dyn GpuMeter>) -> Self {
        self.gpu_meters.push(meter);
        self
    }

    pub fn resource_informer(mut self, informer: Arc<dyn ResourceInformer>) -> Self {
        self.informer = Some(informer);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn build(self) -> Result<PowerMonitor> {
        self.config.validate()?;

        let meter = self
            .meter
            .ok_or_else(|| MonitorError::InvalidConfig("power meter is required".to_string()))?;
        let informer = self.informer.ok_or_else(|| {
            MonitorError::InvalidConfig("resource informer is required".to_string())
        })?;

        let zones = meter.zones().map_err(MonitorError::Zones)?;
        let zone_names = zones.iter().map(|z| z.name().to_string()).collect();
        let target = meter.primary_energy_zone().ok().map(|z| z.key());

        let (data_tx, _) = watch::channel(0);

        Ok(PowerMonitor {
            writer: Mutex::new(WriterState {
                zone_samples: HashMap::new(),
                trackers: Trackers::new(target, &self.config),
            }),
            config: self.config,
            meter,
            gpu_meters: self.gpu_meters,
            informer,
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            metrics: MonitorMetrics::new(),
            logger: self.logger,
            zone_names,
            published: RwLock::new(None),
            exported: AtomicBool::new(false),
            last_collection_nanos: AtomicI64::new(0),
            data_tx,
        })
    }
}

impl Default for PowerMonitorBuilder {
    fn default() -> Self {
        Self::new()
    }
}
