use super::*;
use crate::device::{
    EnergyZone, FakeGpuMeter, FakePowerMeter, FakeZone, GpuDevice, GpuPowerStats,
};
use crate::resource::{
    async_trait, ContainerInfo, ContainerRuntime, NodeResources, PodInfo, ProcessInfo,
    ResourceInformer, Resources,
};
use crate::units::Power;
use std::sync::Mutex as StdMutex;

const INTERVAL: Duration = Duration::from_secs(5);

/// Informer returning whatever the test last handed it
#[derive(Default)]
struct ScriptedInformer {
    next: StdMutex<Resources>,
    failing: AtomicBool,
}

impl ScriptedInformer {
    fn set(&self, resources: Resources) {
        *self.next.lock().unwrap() = resources;
    }

    fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl ResourceInformer for ScriptedInformer {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn refresh(&self) -> anyhow::Result<Resources> {
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("kubelet unreachable");
        }
        Ok(self.next.lock().unwrap().clone())
    }
}

fn proc_info(pid: u32, cpu_delta: f64, container: Option<&str>) -> ProcessInfo {
    ProcessInfo {
        pid,
        comm: format!("p{}", pid),
        exe: format!("/bin/p{}", pid),
        process_type: Default::default(),
        cpu_total_time: cpu_delta,
        cpu_time_delta: cpu_delta,
        container: container.map(|id| ContainerInfo {
            id: id.to_string(),
            name: format!("{}-name", id),
            runtime: ContainerRuntime::Containerd,
            pod: Some(PodInfo {
                id: "pod-1".to_string(),
                name: "web".to_string(),
                namespace: "default".to_string(),
            }),
        }),
        virtual_machine: None,
    }
}

fn resources(procs: Vec<ProcessInfo>, usage_ratio: f64) -> Resources {
    Resources {
        node: NodeResources {
            process_total_cpu_time_delta: procs.iter().map(|p| p.cpu_time_delta).sum(),
            cpu_usage_ratio: usage_ratio,
        },
        processes: procs,
        terminated: Default::default(),
    }
}

struct Harness {
    monitor: Arc<PowerMonitor>,
    meter: Arc<FakePowerMeter>,
    informer: Arc<ScriptedInformer>,
    clock: Arc<ManualClock>,
}

impl Harness {
    fn new() -> Self {
        Self::with_builder(|b| b)
    }

    fn with_builder(f: impl FnOnce(PowerMonitorBuilder) -> PowerMonitorBuilder) -> Self {
        let meter = Arc::new(FakePowerMeter::new(&["package", "dram"]));
        Self::with_meter(meter, f)
    }

    fn with_meter(
        meter: Arc<FakePowerMeter>,
        f: impl FnOnce(PowerMonitorBuilder) -> PowerMonitorBuilder,
    ) -> Self {
        let informer = Arc::new(ScriptedInformer::default());
        let clock = Arc::new(ManualClock::default());
        let builder = PowerMonitor::builder()
            .interval(INTERVAL)
            .power_meter(meter.clone())
            .resource_informer(informer.clone())
            .clock(clock.clone());
        let monitor = Arc::new(f(builder).build().unwrap());
        Self {
            monitor,
            meter,
            informer,
            clock,
        }
    }

    fn zone(&self, name: &str) -> Arc<FakeZone> {
        self.meter.fake_zone(name).unwrap()
    }

    fn zone_key(&self, name: &str) -> Zone {
        self.zone(name).key()
    }

    fn add_joules(&self, name: &str, joules: f64) {
        self.zone(name).add_energy(Energy::from_joules(joules));
    }

    /// Advance one interval and run a tick
    async fn step(&self, res: Resources) -> Arc<Snapshot> {
        self.clock.advance(INTERVAL);
        self.informer.set(res);
        self.monitor.refresh().await.unwrap()
    }
}

fn close(a: f64, b: f64) -> bool {
    (a - b).abs() <= 1e-6 + b.abs() * 0.01
}

#[tokio::test]
async fn test_snapshot_before_first_publish() {
    let h = Harness::new();

    assert!(matches!(h.monitor.snapshot(), Err(MonitorError::NoData)));
    assert!(matches!(h.monitor.is_ready(), Err(MonitorError::NoData)));
    assert!(matches!(h.monitor.is_live(), Err(MonitorError::NoHeartbeat)));
    assert!(h.monitor.last_collection_time().is_none());
}

#[tokio::test]
async fn test_invalid_config_rejected() {
    let result = PowerMonitor::builder()
        .interval(Duration::ZERO)
        .power_meter(Arc::new(FakePowerMeter::new(&["package"])))
        .resource_informer(Arc::new(ScriptedInformer::default()))
        .build();
    assert!(matches!(result, Err(MonitorError::InvalidConfig(_))));

    let result = PowerMonitor::builder()
        .resource_informer(Arc::new(ScriptedInformer::default()))
        .build();
    assert!(matches!(result, Err(MonitorError::InvalidConfig(_))));
}

#[tokio::test]
async fn test_first_tick_seeds_energy_without_power() {
    let h = Harness::new();
    h.add_joules("package", 100.0);

    let snap = h
        .step(resources(vec![proc_info(1, 1.0, None), proc_info(2, 3.0, None)], 0.5))
        .await;
    let pkg = h.zone_key("package");

    for p in snap.processes.values() {
        for usage in p.zones.values() {
            assert!(usage.power.is_zero());
        }
    }
    // 100 J * 0.5 busy * 1/4 of the CPU time
    assert_eq!(snap.processes["1"].zones[&pkg].energy_total, Energy::from_joules(12.5));
    assert_eq!(snap.processes["2"].zones[&pkg].energy_total, Energy::from_joules(37.5));
}

#[tokio::test]
async fn test_power_is_conserved_up_the_hierarchy() {
    let h = Harness::new();
    let procs = || {
        vec![
            proc_info(1, 1.0, Some("c1")),
            proc_info(2, 2.0, Some("c1")),
            proc_info(3, 4.0, Some("c2")),
            proc_info(4, 1.0, None),
        ]
    };
    h.step(resources(procs(), 0.8)).await;

    h.add_joules("package", 50.0);
    h.add_joules("dram", 10.0);
    let snap = h.step(resources(procs(), 0.8)).await;

    for (zone, node_usage) in &snap.node.zones {
        // 50 J over 5 s at 80% busy
        let process_sum: f64 = snap.processes.values().map(|p| p.zones[zone].power.watts()).sum();
        assert!(close(process_sum, node_usage.active_power.watts()), "zone {}", zone);

        let container_sum: f64 = snap.containers.values().map(|c| c.zones[zone].power.watts()).sum();
        let contained: f64 = snap
            .processes
            .values()
            .filter(|p| p.container_id.is_some())
            .map(|p| p.zones[zone].power.watts())
            .sum();
        assert!(close(container_sum, contained));

        let pod_sum: f64 = snap.pods.values().map(|p| p.zones[zone].power.watts()).sum();
        assert!(close(pod_sum, container_sum));
    }

    let pkg = h.zone_key("package");
    assert!(close(snap.node.zones[&pkg].active_power.watts(), 8.0));
    assert!(close(snap.processes["3"].zones[&pkg].power.watts(), 4.0));
    assert!(close(snap.containers["c1"].zones[&pkg].power.watts(), 3.0));
    assert_eq!(snap.containers["c1"].pod_id.as_deref(), Some("pod-1"));
}

#[tokio::test]
async fn test_energy_totals_never_decrease() {
    let h = Harness::new();
    let deltas = [1.0, 0.0, 3.0, 0.5, 0.0];
    let mut last: HashMap<(String, Zone), Energy> = HashMap::new();

    h.step(resources(vec![proc_info(1, 1.0, Some("c1")), proc_info(2, 1.0, None)], 0.5))
        .await;
    for (i, d) in deltas.iter().enumerate() {
        h.add_joules("package", 10.0 * i as f64);
        h.add_joules("dram", 2.0);
        let snap = h
            .step(resources(vec![proc_info(1, *d, Some("c1")), proc_info(2, 1.0, None)], 0.5))
            .await;

        for (id, p) in &snap.processes {
            for (zone, usage) in &p.zones {
                assert!(usage.power >= Power::ZERO);
                let key = (format!("process/{}", id), zone.clone());
                let prev = last.insert(key, usage.energy_total).unwrap_or(Energy::ZERO);
                assert!(usage.energy_total >= prev);
            }
        }
        for (id, c) in &snap.containers {
            for (zone, usage) in &c.zones {
                let key = (format!("container/{}", id), zone.clone());
                let prev = last.insert(key, usage.energy_total).unwrap_or(Energy::ZERO);
                assert!(usage.energy_total >= prev);
            }
        }
    }
}

#[tokio::test]
async fn test_counter_wraparound() {
    let zone = Arc::new(FakeZone::new("package", 0).with_max_energy(Energy::from_micro_joules(1000)));
    let meter = Arc::new(FakePowerMeter::from_zones(vec![zone.clone()]));
    let h = Harness::with_meter(meter, |b| b);

    zone.set_energy(Energy::from_micro_joules(990));
    h.step(resources(vec![proc_info(1, 1.0, None)], 1.0)).await;

    zone.set_energy(Energy::from_micro_joules(5));
    let snap = h.step(resources(vec![proc_info(1, 1.0, None)], 1.0)).await;

    let usage = snap.node.zones[&zone.key()];
    assert_eq!(usage.active_energy, Energy::from_micro_joules(15));
    assert_eq!(usage.energy_total, Energy::from_micro_joules(5));
}

#[tokio::test]
async fn test_zero_cpu_delta_yields_zero_power() {
    let h = Harness::new();
    h.step(resources(vec![proc_info(1, 1.0, None)], 0.5)).await;

    h.add_joules("package", 20.0);
    let snap = h
        .step(resources(vec![proc_info(1, 0.0, None), proc_info(2, 0.0, None)], 0.5))
        .await;

    for p in snap.processes.values() {
        for usage in p.zones.values() {
            assert!(usage.power.is_zero());
            assert!(usage.power.watts().is_finite());
        }
    }
}

#[tokio::test]
async fn test_failed_zone_is_omitted() {
    let h = Harness::new();
    h.step(resources(vec![proc_info(1, 1.0, None)], 0.5)).await;

    h.zone("dram").set_failing(true);
    h.add_joules("package", 10.0);
    let snap = h.step(resources(vec![proc_info(1, 1.0, None)], 0.5)).await;

    assert!(snap.node.zones.contains_key(&h.zone_key("package")));
    assert!(!snap.node.zones.contains_key(&h.zone_key("dram")));
    let dram = snap.processes["1"].zones[&h.zone_key("dram")];
    assert!(dram.power.is_zero());
    assert!(dram.delta.is_zero());
}

#[tokio::test]
async fn test_zone_recovery_keeps_totals() {
    let h = Harness::new();
    let procs = || vec![proc_info(1, 1.0, Some("c1"))];
    let dram = h.zone_key("dram");
    h.step(resources(procs(), 1.0)).await;

    h.add_joules("dram", 10.0);
    let before = h.step(resources(procs(), 1.0)).await;
    let process_before = before.processes["1"].zones[&dram].energy_total;
    let container_before = before.containers["c1"].zones[&dram].energy_total;
    assert_eq!(process_before, Energy::from_joules(10.0));

    h.zone("dram").set_failing(true);
    let failed = h.step(resources(procs(), 1.0)).await;
    assert_eq!(failed.processes["1"].zones[&dram].energy_total, process_before);
    assert_eq!(failed.pods["pod-1"].zones[&dram].energy_total, container_before);

    h.zone("dram").set_failing(false);
    h.add_joules("dram", 2.0);
    let after = h.step(resources(procs(), 1.0)).await;

    assert_eq!(after.processes["1"].zones[&dram].energy_total, Energy::from_joules(12.0));
    assert_eq!(after.containers["c1"].zones[&dram].energy_total, Energy::from_joules(12.0));
    assert_eq!(after.pods["pod-1"].zones[&dram].energy_total, Energy::from_joules(12.0));
}

#[tokio::test]
async fn test_informer_failure_keeps_previous_snapshot() {
    let h = Harness::new();
    let first = h.step(resources(vec![proc_info(1, 1.0, None)], 0.5)).await;

    h.informer.set_failing(true);
    h.clock.advance(INTERVAL);
    let err = h.monitor.refresh().await.unwrap_err();
    assert!(matches!(err, MonitorError::Informer(_)));

    let current = h.monitor.current().unwrap().unwrap();
    assert!(Arc::ptr_eq(&first, &current));

    h.informer.set_failing(false);
    let next = h.step(resources(vec![proc_info(1, 1.0, None)], 0.5)).await;
    assert!(next.timestamp > first.timestamp);
}

#[tokio::test]
async fn test_terminated_kept_until_exported() {
    let h = Harness::with_builder(|b| b.min_terminated_energy_threshold(Energy::ZERO));
    h.add_joules("package", 100.0);
    h.step(resources(
        vec![proc_info(1, 1.0, Some("c1")), proc_info(2, 1.0, Some("c2"))],
        0.5,
    ))
    .await;

    // Process 2 and its container are gone
    let snap = h.step(resources(vec![proc_info(1, 1.0, Some("c1"))], 0.5)).await;
    assert!(snap.terminated_processes.contains_key("2"));
    assert!(snap.terminated_containers.contains_key("c2"));
    assert!(!snap.processes.contains_key("2"));

    // Nobody has read it yet, so the next tick keeps it
    let snap = h.step(resources(vec![proc_info(1, 1.0, Some("c1"))], 0.5)).await;
    assert!(snap.terminated_processes.contains_key("2"));

    let exported = h.monitor.snapshot().unwrap();
    assert!(exported.terminated_processes.contains_key("2"));

    let snap = h.step(resources(vec![proc_info(1, 1.0, Some("c1"))], 0.5)).await;
    assert!(snap.terminated_processes.is_empty());
    assert!(snap.terminated_containers.is_empty());
}

#[tokio::test]
async fn test_informer_reported_termination() {
    let h = Harness::new();
    h.step(resources(vec![proc_info(1, 1.0, None), proc_info(2, 1.0, None)], 0.5))
        .await;

    let mut res = resources(vec![proc_info(1, 1.0, None)], 0.5);
    res.terminated.insert(2);
    // Never seen before, so nothing to keep
    res.terminated.insert(99);
    let snap = h.step(res).await;

    assert!(snap.terminated_processes.contains_key("2"));
    assert!(!snap.terminated_processes.contains_key("99"));
}

#[tokio::test]
async fn test_terminated_tracking_disabled() {
    let h = Harness::with_builder(|b| b.max_terminated(0));
    h.step(resources(vec![proc_info(1, 1.0, None), proc_info(2, 1.0, None)], 0.5))
        .await;
    let snap = h.step(resources(vec![proc_info(1, 1.0, None)], 0.5)).await;
    assert!(snap.terminated_processes.is_empty());
}

#[tokio::test]
async fn test_gpu_energy_accumulates() {
    let gpu = Arc::new(FakeGpuMeter::new(vec![GpuDevice {
        index: 0,
        uuid: "GPU-0".to_string(),
        name: "Fake GPU".to_string(),
    }]));
    gpu.set_device_stats(
        0,
        GpuPowerStats {
            total_power: Power::from_watts(120.0),
            idle_power: Power::from_watts(20.0),
            active_power: Power::from_watts(100.0),
        },
        Energy::from_joules(1_000.0),
    );
    gpu.set_process_power(1, 50.0);
    let h = Harness::with_builder(|b| b.gpu_meter(gpu.clone()));

    let first = h.step(resources(vec![proc_info(1, 1.0, None)], 0.5)).await;
    assert!(first.processes["1"].gpu_energy_total.is_zero());
    assert_eq!(first.gpu_stats.len(), 1);

    let second = h.step(resources(vec![proc_info(1, 1.0, None)], 0.5)).await;
    assert!(close(second.processes["1"].gpu_power.watts(), 50.0));
    // 50 W over one 5 s interval
    assert_eq!(second.processes["1"].gpu_energy_total, Energy::from_joules(250.0));

    gpu.set_process_power_failing(true);
    let third = h.step(resources(vec![proc_info(1, 1.0, None)], 0.5)).await;
    assert_eq!(third.processes["1"].gpu_energy_total, Energy::from_joules(250.0));
    assert_eq!(third.gpu_stats.len(), 1);
}

#[tokio::test]
async fn test_publish_signals_and_heartbeat() {
    let h = Harness::new();
    let mut rx = h.monitor.data_channel();
    assert_eq!(h.monitor.zone_names(), vec!["package".to_string(), "dram".to_string()]);

    let snap = h.step(resources(vec![proc_info(1, 1.0, None)], 0.5)).await;
    assert!(rx.has_changed().unwrap());
    assert_eq!(*rx.borrow_and_update(), 1);
    assert_eq!(h.monitor.last_collection_time(), Some(snap.timestamp));
    assert!(h.monitor.is_live().is_ok());
    assert!(h.monitor.is_ready().is_ok());

    h.clock.advance(INTERVAL * 3);
    assert!(matches!(
        h.monitor.is_live(),
        Err(MonitorError::CollectorStalled { .. })
    ));
    assert_eq!(h.monitor.zone_names().len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_readers_never_see_torn_snapshot() {
    let h = Harness::new();
    let start = h.clock.now();
    let generations = 50u32;

    h.clock.set(start);
    h.informer.set(resources(vec![proc_info(1, 0.0, None)], 0.5));
    h.monitor.refresh().await.unwrap();

    let mut readers = Vec::new();
    for _ in 0..4 {
        let monitor = h.monitor.clone();
        readers.push(tokio::spawn(async move {
            let mut last_seen = 0.0f64;
            for _ in 0..2_000 {
                let snap = monitor.snapshot().unwrap();
                let generation = (snap.timestamp - start).num_seconds() as f64 / 5.0;
                assert_eq!(snap.node.timestamp, snap.timestamp);
                assert_eq!(snap.processes["1"].cpu_total_time, generation);
                assert!(generation >= last_seen);
                last_seen = generation;
                tokio::task::yield_now().await;
            }
        }));
    }

    for generation in 1..=generations {
        h.clock.set(start + chrono::Duration::seconds(5 * generation as i64));
        let mut info = proc_info(1, 1.0, None);
        info.cpu_total_time = generation as f64;
        h.informer.set(resources(vec![info], 0.5));
        h.add_joules("package", 1.0);
        h.monitor.refresh().await.unwrap();
        tokio::task::yield_now().await;
    }

    for reader in readers {
        reader.await.unwrap();
    }
}

#[tokio::test]
async fn test_loop_runs_until_shutdown() {
    let meter = Arc::new(FakePowerMeter::free_running(&["package"], 50.0));
    let informer = Arc::new(ScriptedInformer::default());
    informer.set(resources(vec![proc_info(1, 1.0, None)], 0.5));
    let monitor = Arc::new(
        PowerMonitor::builder()
            .interval(Duration::from_millis(10))
            .power_meter(meter)
            .resource_informer(informer)
            .build()
            .unwrap(),
    );

    let health = crate::health::HealthRegistry::new();
    let monitor_loop = MonitorLoop::new(monitor.clone()).with_health(health.clone());
    let mut state = monitor_loop.state();
    let mut data = monitor.data_channel();
    let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);
    let handle = tokio::spawn(monitor_loop.run(shutdown_rx));

    tokio::time::timeout(Duration::from_secs(5), data.changed())
        .await
        .unwrap()
        .unwrap();
    shutdown_tx.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(*state.borrow_and_update(), LoopState::Stopped);
    assert!(monitor.snapshot().is_ok());
    assert!(health.readiness().await.ready);
}
