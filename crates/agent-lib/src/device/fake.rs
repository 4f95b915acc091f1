//! Synthetic meters for development and tests
//!
//! `FakeZone` either free-runs at a base wattage (advancing on every read by
//! the elapsed wall time) or holds a value set explicitly by the caller.

use super::{EnergyZone, GpuDevice, GpuMeter, GpuPowerStats, PowerMeter};
use crate::units::{Energy, Power};
use anyhow::{bail, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

const FAKE_RAPL_PATH: &str = "/sys/class/powercap/intel-rapl";

/// Default wrap point of the fake counters (~262 kJ, like a 32-bit RAPL counter)
pub const DEFAULT_FAKE_MAX_ENERGY: Energy = Energy::from_micro_joules(262_143_328_850);

pub struct FakeZone {
    name: String,
    index: i32,
    path: String,
    max_energy: Energy,
    counter: AtomicU64,
    failing: AtomicBool,
    free_running: Option<FreeRunning>,
}

struct FreeRunning {
    base_watts: f64,
    last_read: Mutex<Instant>,
}

impl FakeZone {
    pub fn new(name: impl Into<String>, index: i32) -> Self {
        let name = name.into();
        Self {
            path: format!("{}:{}", FAKE_RAPL_PATH, index),
            name,
            index,
            max_energy: DEFAULT_FAKE_MAX_ENERGY,
            counter: AtomicU64::new(0),
            failing: AtomicBool::new(false),
            free_running: None,
        }
    }

    /// A zone whose counter advances at `base_watts` of wall-clock time
    pub fn free_running(name: impl Into<String>, index: i32, base_watts: f64) -> Self {
        Self {
            free_running: Some(FreeRunning {
                base_watts,
                last_read: Mutex::new(Instant::now()),
            }),
            ..Self::new(name, index)
        }
    }

    pub fn with_max_energy(mut self, max: Energy) -> Self {
        self.max_energy = max;
        self
    }

    pub fn set_energy(&self, energy: Energy) {
        self.counter.store(energy.micro_joules(), Ordering::SeqCst);
    }

    /// Advance the counter, wrapping at `max_energy` when it is known
    pub fn add_energy(&self, delta: Energy) {
        let max = self.max_energy.micro_joules();
        let _ = self
            .counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                let next = current.wrapping_add(delta.micro_joules());
                Some(if max > 0 { next % max } else { next })
            });
    }

    /// Make subsequent reads fail until reset
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl EnergyZone for FakeZone {
    fn name(&self) -> &str {
        &self.name
    }

    fn index(&self) -> i32 {
        self.index
    }

    fn path(&self) -> &str {
        &self.path
    }

    fn energy(&self) -> Result<Energy> {
        if self.failing.load(Ordering::SeqCst) {
            bail!("fake zone {} read failure", self.name);
        }

        if let Some(free) = &self.free_running {
            let elapsed = {
                let mut last = free
                    .last_read
                    .lock()
                    .map_err(|_| anyhow::anyhow!("fake zone clock poisoned"))?;
                let now = Instant::now();
                let elapsed = now.duration_since(*last).as_secs_f64();
                *last = now;
                elapsed
            };
            self.add_energy(Power::from_watts(free.base_watts).energy_over(elapsed));
        }

        Ok(Energy::from_micro_joules(self.counter.load(Ordering::SeqCst)))
    }

    fn max_energy(&self) -> Energy {
        self.max_energy
    }
}

/// Power meter backed by `FakeZone`s
pub struct FakePowerMeter {
    zones: Vec<Arc<FakeZone>>,
}

impl FakePowerMeter {
    pub fn new(names: &[&str]) -> Self {
        let zones = names
            .iter()
            .enumerate()
            .map(|(i, name)| Arc::new(FakeZone::new(*name, i as i32)))
            .collect();
        Self { zones }
    }

    /// Free-running zones, used when no hardware counters are available
    pub fn free_running(names: &[&str], base_watts: f64) -> Self {
        let zones = names
            .iter()
            .enumerate()
            .map(|(i, name)| Arc::new(FakeZone::free_running(*name, i as i32, base_watts)))
            .collect();
        Self { zones }
    }

    pub fn from_zones(zones: Vec<Arc<FakeZone>>) -> Self {
        Self { zones }
    }

    /// Handle to a zone for driving its counter
    pub fn fake_zone(&self, name: &str) -> Option<Arc<FakeZone>> {
        self.zones.iter().find(|z| z.name == name).cloned()
    }
}

impl PowerMeter for FakePowerMeter {
    fn name(&self) -> &str {
        "fake-cpu-meter"
    }

    fn zones(&self) -> Result<Vec<Arc<dyn EnergyZone>>> {
        Ok(self
            .zones
            .iter()
            .map(|z| z.clone() as Arc<dyn EnergyZone>)
            .collect())
    }
}

/// GPU meter with caller-controlled readings
#[derive(Default)]
pub struct FakeGpuMeter {
    devices: Vec<GpuDevice>,
    state: Mutex<FakeGpuState>,
}

#[derive(Default)]
struct FakeGpuState {
    stats: HashMap<u32, GpuPowerStats>,
    energy: HashMap<u32, Energy>,
    process_power: HashMap<u32, f64>,
    process_power_failing: bool,
}

impl FakeGpuMeter {
    pub fn new(devices: Vec<GpuDevice>) -> Self {
        Self {
            devices,
            state: Mutex::new(FakeGpuState::default()),
        }
    }

    pub fn set_device_stats(&self, index: u32, stats: GpuPowerStats, energy: Energy) {
        if let Ok(mut state) = self.state.lock() {
            state.stats.insert(index, stats);
            state.energy.insert(index, energy);
        }
    }

    pub fn set_process_power(&self, pid: u32, watts: f64) {
        if let Ok(mut state) = self.state.lock() {
            state.process_power.insert(pid, watts);
        }
    }

    pub fn set_process_power_failing(&self, failing: bool) {
        if let Ok(mut state) = self.state.lock() {
            state.process_power_failing = failing;
        }
    }

    fn with_state<T>(&self, f: impl FnOnce(&FakeGpuState) -> Result<T>) -> Result<T> {
        let state = self
            .state
            .lock()
            .map_err(|_| anyhow::anyhow!("fake gpu state poisoned"))?;
        f(&state)
    }
}

impl GpuMeter for FakeGpuMeter {
    fn vendor(&self) -> &str {
        "fake"
    }

    fn devices(&self) -> Vec<GpuDevice> {
        self.devices.clone()
    }

    fn device_power_stats(&self, index: u32) -> Result<GpuPowerStats> {
        self.with_state(|s| {
            s.stats
                .get(&index)
                .copied()
                .ok_or_else(|| anyhow::anyhow!("GPU device not found: index {}", index))
        })
    }

    fn total_energy(&self, index: u32) -> Result<Energy> {
        self.with_state(|s| {
            s.energy
                .get(&index)
                .copied()
                .ok_or_else(|| anyhow::anyhow!("GPU device not found: index {}", index))
        })
    }

    fn process_power(&self) -> Result<HashMap<u32, f64>> {
        self.with_state(|s| {
            if s.process_power_failing {
                bail!("process power unavailable");
            }
            Ok(s.process_power.clone())
        })
    }
}
