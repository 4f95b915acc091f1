//! Console dump of node power, one table per published snapshot

use crate::monitor::{Node, PowerDataProvider};
use std::io::Write;
use std::sync::Arc;
use tabled::{settings::Style, Table, Tabled};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Tabled)]
struct ZoneRow {
    #[tabled(rename = "Zone")]
    zone: String,
    #[tabled(rename = "Power(W)")]
    power: String,
    #[tabled(rename = "Active(W)")]
    active_power: String,
    #[tabled(rename = "Absolute(J)")]
    energy: String,
}

/// Render the node zones as a table sorted by zone name
pub fn render_node(node: &Node) -> String {
    let mut rows: Vec<ZoneRow> = node
        .zones
        .iter()
        .map(|(zone, usage)| ZoneRow {
            zone: zone.name.clone(),
            power: format!("{:.2}", usage.power.watts()),
            active_power: format!("{:.2}", usage.active_power.watts()),
            energy: format!(
                "{:.2}",
                usage.active_energy_total.joules() + usage.idle_energy_total.joules()
            ),
        })
        .collect();
    rows.sort_by(|a, b| a.zone.cmp(&b.zone));

    Table::new(rows).with(Style::rounded()).to_string()
}

/// Writes a node table every time the provider publishes
pub struct StdoutExporter {
    provider: Arc<dyn PowerDataProvider>,
    updates: watch::Receiver<u64>,
    out: Box<dyn Write + Send>,
}

impl StdoutExporter {
    /// Exporter writing to the process stdout
    pub fn new(provider: Arc<dyn PowerDataProvider>) -> Self {
        Self::with_output(provider, Box::new(std::io::stdout()))
    }

    pub fn with_output(provider: Arc<dyn PowerDataProvider>, out: Box<dyn Write + Send>) -> Self {
        // Subscribe now so no publish between construction and `run` is missed
        let updates = provider.data_channel();
        Self {
            provider,
            updates,
            out,
        }
    }

    /// Run until `shutdown` fires or the provider goes away
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        info!("Starting stdout exporter");

        loop {
            tokio::select! {
                biased;
                _ = shutdown.recv() => break,
                changed = self.updates.changed() => {
                    if changed.is_err() {
                        debug!("Power data channel closed");
                        break;
                    }
                    self.write_snapshot();
                }
            }
        }

        if let Err(e) = self.out.flush() {
            warn!(error = %e, "Failed to flush stdout exporter");
        }
        info!("Stdout exporter stopped");
    }

    fn write_snapshot(&mut self) {
        let snapshot = match self.provider.snapshot() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(error = %e, "Failed to read power snapshot");
                return;
            }
        };

        let table = render_node(&snapshot.node);
        if let Err(e) = writeln!(self.out, "{}\n{}", snapshot.timestamp.to_rfc3339(), table) {
            warn!(error = %e, "Failed to write power snapshot");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Zone;
    use crate::error::{MonitorError, Result as MonitorResult};
    use crate::monitor::{NodeZoneUsage, Snapshot};
    use crate::units::{Energy, Power};
    use chrono::{DateTime, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Clone, Default)]
    struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

    impl SharedBuffer {
        fn contents(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    struct ChannelProvider {
        snapshot: Arc<Snapshot>,
        reads: AtomicUsize,
        tx: watch::Sender<u64>,
    }

    impl PowerDataProvider for ChannelProvider {
        fn snapshot(&self) -> MonitorResult<Arc<Snapshot>> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            if self.snapshot.node.zones.is_empty() {
                return Err(MonitorError::NoData);
            }
            Ok(self.snapshot.clone())
        }

        fn data_channel(&self) -> watch::Receiver<u64> {
            self.tx.subscribe()
        }

        fn zone_names(&self) -> Vec<String> {
            vec!["package".to_string(), "dram".to_string()]
        }

        fn last_collection_time(&self) -> Option<DateTime<Utc>> {
            Some(self.snapshot.timestamp)
        }
    }

    fn zone_usage(watts: f64, joules: f64) -> NodeZoneUsage {
        NodeZoneUsage {
            power: Power::from_watts(watts),
            active_power: Power::from_watts(watts / 2.0),
            active_energy_total: Energy::from_joules(joules / 2.0),
            idle_energy_total: Energy::from_joules(joules / 2.0),
            ..Default::default()
        }
    }

    fn snapshot() -> Snapshot {
        let mut snapshot = Snapshot::new(Utc::now());
        snapshot.node.zones.insert(
            Zone::new("package", "/sys/class/powercap/intel-rapl:0"),
            zone_usage(40.0, 1200.0),
        );
        snapshot.node.zones.insert(
            Zone::new("dram", "/sys/class/powercap/intel-rapl:0:0"),
            zone_usage(4.0, 100.0),
        );
        snapshot
    }

    #[test]
    fn test_render_node_sorted_by_zone() {
        let table = render_node(&snapshot().node);

        assert!(table.contains("Zone"));
        assert!(table.contains("Power(W)"));
        assert!(table.contains("40.00"));
        assert!(table.contains("1200.00"));
        let dram = table.find("dram").unwrap();
        let package = table.find("package").unwrap();
        assert!(dram < package);
    }

    #[tokio::test]
    async fn test_writes_table_per_publish() {
        let provider = Arc::new(ChannelProvider {
            snapshot: Arc::new(snapshot()),
            reads: AtomicUsize::new(0),
            tx: watch::channel(0).0,
        });
        let buffer = SharedBuffer::default();
        let exporter = StdoutExporter::with_output(provider.clone(), Box::new(buffer.clone()));
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = tokio::spawn(exporter.run(shutdown_rx));

        provider.tx.send_modify(|g| *g += 1);
        for _ in 0..100 {
            if provider.reads.load(Ordering::SeqCst) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();

        assert_eq!(provider.reads.load(Ordering::SeqCst), 1);
        let out = buffer.contents();
        assert!(out.contains("package"));
        assert!(out.contains("Absolute(J)"));
    }

    #[test]
    fn test_skips_unavailable_snapshot() {
        let provider = Arc::new(ChannelProvider {
            snapshot: Arc::new(Snapshot::new(Utc::now())),
            reads: AtomicUsize::new(0),
            tx: watch::channel(0).0,
        });
        let buffer = SharedBuffer::default();
        let mut exporter = StdoutExporter::with_output(provider.clone(), Box::new(buffer.clone()));

        exporter.write_snapshot();

        assert_eq!(provider.reads.load(Ordering::SeqCst), 1);
        assert!(buffer.contents().is_empty());
    }
}
