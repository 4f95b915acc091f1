//! Bounded store of terminated resources
//!
//! Entries are ranked by the energy they consumed in a single target zone.
//! When the store is full, the lowest value entry goes first: anything
//! below the energy threshold, then the oldest termination, then the
//! smallest energy.

use super::types::Resource;
use crate::device::Zone;
use crate::units::Energy;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct EvictionKey {
    significant: bool,
    terminated_at: DateTime<Utc>,
    energy: Energy,
    id: String,
}

#[derive(Debug, Clone)]
struct TrackedEntry<T> {
    resource: T,
    key: EvictionKey,
}

/// Bounded set of terminated workloads kept until the next export
#[derive(Debug, Clone)]
pub struct TerminatedResourceTracker<T: Resource> {
    kind: &'static str,
    target_zone: Option<Zone>,
    max_size: usize,
    min_energy_threshold: Energy,
    entries: HashMap<String, TrackedEntry<T>>,
    eviction_order: BTreeSet<EvictionKey>,
}

impl<T: Resource> TerminatedResourceTracker<T> {
    /// `max_size` of zero disables tracking entirely
    pub fn new(
        kind: &'static str,
        target_zone: Option<Zone>,
        max_size: usize,
        min_energy_threshold: Energy,
    ) -> Self {
        Self {
            kind,
            target_zone,
            max_size,
            min_energy_threshold,
            entries: HashMap::new(),
            eviction_order: BTreeSet::new(),
        }
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    pub fn target_zone(&self) -> Option<&Zone> {
        self.target_zone.as_ref()
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn energy_of(&self, resource: &T) -> Energy {
        self.target_zone
            .as_ref()
            .and_then(|zone| resource.zone_usage().get(zone))
            .map(|usage| usage.energy_total)
            .unwrap_or(Energy::ZERO)
    }

    /// Record a terminated resource. Re-adding an ID replaces the earlier
    /// entry. Returns the IDs evicted to stay within capacity.
    pub fn add(&mut self, resource: T, terminated_at: DateTime<Utc>) -> Vec<String> {
        if self.max_size == 0 {
            return Vec::new();
        }

        let id = resource.string_id();
        let energy = self.energy_of(&resource);
        let key = EvictionKey {
            significant: energy >= self.min_energy_threshold,
            terminated_at,
            energy,
            id: id.clone(),
        };

        if let Some(previous) = self.entries.remove(&id) {
            self.eviction_order.remove(&previous.key);
        }
        self.eviction_order.insert(key.clone());
        self.entries.insert(id, TrackedEntry { resource, key });

        let mut evicted = Vec::new();
        while self.entries.len() > self.max_size {
            let Some(victim) = self.eviction_order.pop_first() else {
                break;
            };
            self.entries.remove(&victim.id);
            debug!(
                kind = self.kind,
                id = %victim.id,
                energy = %victim.energy,
                "Evicted terminated resource"
            );
            evicted.push(victim.id);
        }
        evicted
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    /// Copy of every tracked resource keyed by ID
    pub fn items(&self) -> HashMap<String, T> {
        self.entries
            .iter()
            .map(|(id, entry)| (id.clone(), entry.resource.clone()))
            .collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.eviction_order.clear();
    }
}
