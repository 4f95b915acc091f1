//! RAPL counters exposed through the Linux powercap sysfs interface
//!
//! Layout: `/sys/class/powercap/intel-rapl:N/{name,energy_uj,max_energy_range_uj}`
//! with sub-zones such as `intel-rapl:N:M` for core/uncore/dram.

use super::{AggregatedZone, EnergyZone, PowerMeter};
use crate::units::Energy;
use anyhow::{bail, Context, Result};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

pub const DEFAULT_POWERCAP_PATH: &str = "/sys/class/powercap";

/// A single powercap zone directory
pub struct PowercapZone {
    name: String,
    index: i32,
    path: String,
    energy_path: PathBuf,
    max_energy: Energy,
}

impl PowercapZone {
    fn open(dir: &Path, index: i32) -> Result<Self> {
        let raw_name = read_trimmed(&dir.join("name"))?;
        let max_energy = read_trimmed(&dir.join("max_energy_range_uj"))
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(Energy::from_micro_joules)
            .unwrap_or_default();

        Ok(Self {
            name: normalize_zone_name(&raw_name),
            index,
            path: dir.to_string_lossy().to_string(),
            energy_path: dir.join("energy_uj"),
            max_energy,
        })
    }
}

impl EnergyZone for PowercapZone {
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
        let raw = read_trimmed(&self.energy_path)?;
        let uj = raw
            .parse::<u64>()
            .with_context(|| format!("invalid energy value {:?} in {}", raw, self.path))?;
        Ok(Energy::from_micro_joules(uj))
    }

    fn max_energy(&self) -> Energy {
        self.max_energy
    }
}

/// Power meter reading every RAPL zone below a powercap root.
///
/// Same-named zones of different sockets are merged into one
/// `AggregatedZone`, so zone names are unique.
pub struct PowercapPowerMeter {
    zones: Vec<Arc<dyn EnergyZone>>,
}

impl PowercapPowerMeter {
    /// Discover all zones below `root` (normally `/sys/class/powercap`)
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        Self::with_zone_filter(root, &[])
    }

    /// Discover zones below `root`, keeping only the names in `filter`
    /// (case-insensitive). An empty filter keeps every zone.
    pub fn with_zone_filter(root: impl AsRef<Path>, filter: &[String]) -> Result<Self> {
        let root = root.as_ref();
        let mut dirs: Vec<PathBuf> = fs::read_dir(root)
            .with_context(|| format!("failed to read powercap root {}", root.display()))?
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| {
                path.file_name()
                    .and_then(|n| n.to_str())
                    .map(is_rapl_zone_dir)
                    .unwrap_or(false)
            })
            .collect();
        dirs.sort();

        let mut discovered: Vec<Arc<dyn EnergyZone>> = Vec::with_capacity(dirs.len());
        for dir in dirs {
            let index = zone_index(&dir);
            match PowercapZone::open(&dir, index) {
                Ok(zone) => {
                    debug!(zone = %zone.name, path = %zone.path, "Discovered powercap zone");
                    discovered.push(Arc::new(zone));
                }
                Err(e) => debug!(path = %dir.display(), error = %e, "Skipping unreadable powercap zone"),
            }
        }

        if discovered.is_empty() {
            bail!("no RAPL zones found under {}", root.display());
        }

        let discovered = filter_zones(discovered, filter);
        if discovered.is_empty() {
            bail!(
                "no RAPL zones under {} match filter {:?}",
                root.display(),
                filter
            );
        }

        let zones = merge_sockets(discovered)?;
        info!(zones = zones.len(), "Using powercap RAPL power meter");
        Ok(Self { zones })
    }
}

fn filter_zones(zones: Vec<Arc<dyn EnergyZone>>, filter: &[String]) -> Vec<Arc<dyn EnergyZone>> {
    if filter.is_empty() {
        return zones;
    }

    let wanted: HashSet<String> = filter.iter().map(|n| n.trim().to_lowercase()).collect();
    let (included, excluded): (Vec<_>, Vec<_>) = zones
        .into_iter()
        .partition(|z| wanted.contains(&z.name().to_lowercase()));
    debug!(
        included = ?included.iter().map(|z| z.name()).collect::<Vec<_>>(),
        excluded = ?excluded.iter().map(|z| z.name()).collect::<Vec<_>>(),
        "Filtered RAPL zones"
    );
    included
}

/// One zone per name, in discovery order
fn merge_sockets(zones: Vec<Arc<dyn EnergyZone>>) -> Result<Vec<Arc<dyn EnergyZone>>> {
    let mut groups: Vec<(String, Vec<Arc<dyn EnergyZone>>)> = Vec::new();
    for zone in zones {
        match groups.iter_mut().find(|(name, _)| name == zone.name()) {
            Some((_, members)) => members.push(zone),
            None => groups.push((zone.name().to_string(), vec![zone])),
        }
    }

    groups
        .into_iter()
        .map(|(_, mut members)| {
            if members.len() == 1 {
                Ok(members.remove(0))
            } else {
                Ok(Arc::new(AggregatedZone::new(members)?) as Arc<dyn EnergyZone>)
            }
        })
        .collect()
}

impl PowerMeter for PowercapPowerMeter {
    fn name(&self) -> &str {
        "rapl-powercap"
    }

    fn zones(&self) -> Result<Vec<Arc<dyn EnergyZone>>> {
        Ok(self.zones.clone())
    }
}

fn read_trimmed(path: &Path) -> Result<String> {
    let content =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    Ok(content.trim().to_string())
}

/// `intel-rapl:0`, `intel-rapl:0:1`, `amd-rapl:0` but not the control-type directory `intel-rapl`
fn is_rapl_zone_dir(name: &str) -> bool {
    (name.starts_with("intel-rapl:") || name.starts_with("amd-rapl:")) && !name.ends_with(':')
}

fn zone_index(dir: &Path) -> i32 {
    dir.file_name()
        .and_then(|n| n.to_str())
        .and_then(|n| n.rsplit(':').next())
        .and_then(|i| i.parse().ok())
        .unwrap_or(-1)
}

/// `package-0` becomes `package`; sub-zone names are kept as is
fn normalize_zone_name(raw: &str) -> String {
    match raw.split_once('-') {
        Some((prefix, suffix)) if suffix.chars().all(|c| c.is_ascii_digit()) => {
            prefix.to_lowercase()
        }
        _ => raw.to_lowercase(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_zone(root: &Path, dir: &str, name: &str, energy: u64, max: u64) {
        let zone = root.join(dir);
        fs::create_dir_all(&zone).unwrap();
        fs::write(zone.join("name"), format!("{}\n", name)).unwrap();
        fs::write(zone.join("energy_uj"), format!("{}\n", energy)).unwrap();
        fs::write(zone.join("max_energy_range_uj"), format!("{}\n", max)).unwrap();
    }

    #[test]
    fn test_discovers_rapl_zones() {
        let temp = TempDir::new().unwrap();
        write_zone(temp.path(), "intel-rapl:0", "package-0", 1000, 262143328850);
        write_zone(temp.path(), "intel-rapl:0:0", "core", 400, 262143328850);
        write_zone(temp.path(), "intel-rapl:0:1", "dram", 200, 65712999613);
        fs::create_dir_all(temp.path().join("intel-rapl")).unwrap();

        let meter = PowercapPowerMeter::new(temp.path()).unwrap();
        let zones = meter.zones().unwrap();
        let names: Vec<&str> = zones.iter().map(|z| z.name()).collect();
        assert_eq!(names, vec!["package", "core", "dram"]);

        let package = meter.zone("package").unwrap();
        assert_eq!(package.energy().unwrap().micro_joules(), 1000);
        assert_eq!(package.max_energy().micro_joules(), 262143328850);
        assert_eq!(package.index(), 0);

        let dram = meter.zone("dram").unwrap();
        assert_eq!(dram.index(), 1);
    }

    #[test]
    fn test_energy_read_tracks_file() {
        let temp = TempDir::new().unwrap();
        write_zone(temp.path(), "intel-rapl:0", "package-0", 1000, 0);
        let meter = PowercapPowerMeter::new(temp.path()).unwrap();
        let zone = meter.zone("package").unwrap();

        fs::write(temp.path().join("intel-rapl:0/energy_uj"), "2500\n").unwrap();
        assert_eq!(zone.energy().unwrap().micro_joules(), 2500);
        assert_eq!(zone.max_energy(), Energy::ZERO);

        fs::write(temp.path().join("intel-rapl:0/energy_uj"), "garbage\n").unwrap();
        assert!(zone.energy().is_err());
    }

    #[test]
    fn test_no_zones_is_error() {
        let temp = TempDir::new().unwrap();
        assert!(PowercapPowerMeter::new(temp.path()).is_err());
        assert!(PowercapPowerMeter::new(temp.path().join("missing")).is_err());
    }

    #[test]
    fn test_two_sockets_merge_into_one_zone() {
        let temp = TempDir::new().unwrap();
        write_zone(temp.path(), "intel-rapl:0", "package-0", 1000, 262143328850);
        write_zone(temp.path(), "intel-rapl:0:0", "dram", 100, 65712999613);
        write_zone(temp.path(), "intel-rapl:1", "package-1", 3000, 262143328850);
        write_zone(temp.path(), "intel-rapl:1:0", "dram", 300, 65712999613);

        let meter = PowercapPowerMeter::new(temp.path()).unwrap();
        let zones = meter.zones().unwrap();
        let names: Vec<&str> = zones.iter().map(|z| z.name()).collect();
        assert_eq!(names, vec!["package", "dram"]);

        let package = meter.zone("package").unwrap();
        assert_eq!(package.path(), "aggregated-package");
        assert_eq!(package.max_energy().micro_joules(), 2 * 262143328850);
        assert_eq!(package.energy().unwrap().micro_joules(), 4000);

        fs::write(temp.path().join("intel-rapl:0/energy_uj"), "1500\n").unwrap();
        fs::write(temp.path().join("intel-rapl:1/energy_uj"), "3250\n").unwrap();
        assert_eq!(package.energy().unwrap().micro_joules(), 4750);

        let dram = meter.zone("dram").unwrap();
        assert_eq!(dram.energy().unwrap().micro_joules(), 400);
    }

    #[test]
    fn test_zone_filter() {
        let temp = TempDir::new().unwrap();
        write_zone(temp.path(), "intel-rapl:0", "package-0", 1000, 0);
        write_zone(temp.path(), "intel-rapl:0:0", "core", 400, 0);
        write_zone(temp.path(), "intel-rapl:0:1", "dram", 200, 0);

        let filter = vec!["Package".to_string(), "DRAM".to_string()];
        let meter = PowercapPowerMeter::with_zone_filter(temp.path(), &filter).unwrap();
        let names: Vec<String> = meter
            .zones()
            .unwrap()
            .iter()
            .map(|z| z.name().to_string())
            .collect();
        assert_eq!(names, vec!["package", "dram"]);

        let unknown = vec!["psys".to_string()];
        assert!(PowercapPowerMeter::with_zone_filter(temp.path(), &unknown).is_err());
    }

    #[test]
    fn test_normalize_zone_name() {
        assert_eq!(normalize_zone_name("package-0"), "package");
        assert_eq!(normalize_zone_name("core"), "core");
        assert_eq!(normalize_zone_name("psys"), "psys");
    }
}
