//! One logical zone over several same-named zones
//!
//! Multi-socket hosts expose one `package` (and `dram`, ...) zone per socket.
//! `AggregatedZone` presents them as a single counter: each read adds the
//! wrap-corrected deltas of every member, and the combined counter itself
//! wraps at the sum of the members' maxima so downstream delta math keeps
//! working unchanged.

use super::EnergyZone;
use crate::monitor::calculate_energy_delta;
use crate::units::Energy;
use anyhow::{anyhow, bail, Result};
use std::sync::{Arc, Mutex};

/// Sum of several zones sharing a name, exposed as one `EnergyZone`
pub struct AggregatedZone {
    name: String,
    path: String,
    zones: Vec<Arc<dyn EnergyZone>>,
    max_energy: Energy,
    state: Mutex<AggregateState>,
}

struct AggregateState {
    /// Last raw reading per member, same order as `zones`
    last: Vec<Option<Energy>>,
    current: u64,
}

impl AggregatedZone {
    /// Takes its name from the first member
    pub fn new(zones: Vec<Arc<dyn EnergyZone>>) -> Result<Self> {
        let Some(first) = zones.first() else {
            bail!("aggregated zone needs at least one member");
        };
        let name = first.name().to_string();

        let max = zones
            .iter()
            .try_fold(0u64, |sum, z| sum.checked_add(z.max_energy().micro_joules()))
            .unwrap_or(u64::MAX);

        Ok(Self {
            path: format!("aggregated-{}", name),
            name,
            max_energy: Energy::from_micro_joules(max),
            state: Mutex::new(AggregateState {
                last: vec![None; zones.len()],
                current: 0,
            }),
            zones,
        })
    }
}

impl EnergyZone for AggregatedZone {
    fn name(&self) -> &str {
        &self.name
    }

    /// Aggregates have no hardware index
    fn index(&self) -> i32 {
        -1
    }

    fn path(&self) -> &str {
        &self.path
    }

    fn energy(&self) -> Result<Energy> {
        // Read every member before touching state so a failure changes nothing
        let readings = self
            .zones
            .iter()
            .map(|z| {
                z.energy()
                    .map_err(|e| anyhow!("member {} of {} failed: {}", z.path(), self.name, e))
            })
            .collect::<Result<Vec<_>>>()?;

        let mut state = self
            .state
            .lock()
            .map_err(|_| anyhow!("aggregated zone {} state poisoned", self.name))?;

        let mut total: u128 = 0;
        for ((zone, reading), last) in self.zones.iter().zip(readings).zip(state.last.iter_mut()) {
            let delta = match last {
                Some(prev) => calculate_energy_delta(reading, *prev, zone.max_energy()),
                None => reading,
            };
            total += u128::from(delta.micro_joules());
            *last = Some(reading);
        }

        let next = u128::from(state.current) + total;
        let max = u128::from(self.max_energy.micro_joules());
        state.current = if max > 0 {
            (next % max) as u64
        } else {
            next.min(u128::from(u64::MAX)) as u64
        };

        Ok(Energy::from_micro_joules(state.current))
    }

    fn max_energy(&self) -> Energy {
        self.max_energy
    }
}
