//! Usage metering engine.
//!
//! [`UsageMeter::update`] runs the CPU, memory, disk and network samplers and
//! the process inspector, then commits the new snapshot together with the
//! delta, history, rolling stats and alerts under one write lock. Sampling
//! happens outside the state lock, so readers never wait on the OS and never
//! observe a partially updated state. Concurrent updates are serialized on
//! the source lock from the first sample to the commit, so snapshots are
//! committed in the order they were taken.

pub mod history;
pub mod usage;

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, warn};

use crate::collector::{CollectError, MetricsSource, ProcessDetails, ProcessInspector};
use crate::config::{DEFAULT_HISTORY_LIMIT, GovernorConfig};
use crate::error::{GovernError, Result};

pub use history::{Aggregate, UsageHistory, UsageStats};
pub use usage::{
    CpuUsage, DiskUsage, MemoryUsage, NetworkUsage, ProcessUsage, ResourceKind, ResourceUsage,
    UsageDelta,
};

/// Settings of a [`UsageMeter`].
#[derive(Debug, Clone, PartialEq)]
pub struct MeterConfig {
    pub process_id: u32,
    pub history_limit: usize,
    pub disk_paths: Vec<PathBuf>,
    /// Empty means all interfaces.
    pub network_interfaces: Vec<String>,
}

impl Default for MeterConfig {
    fn default() -> Self {
        Self {
            process_id: std::process::id(),
            history_limit: DEFAULT_HISTORY_LIMIT,
            disk_paths: vec![PathBuf::from("/")],
            network_interfaces: Vec::new(),
        }
    }
}

impl From<&GovernorConfig> for MeterConfig {
    fn from(config: &GovernorConfig) -> Self {
        Self {
            process_id: config.resolved_pid(),
            history_limit: config.history_limit,
            disk_paths: config.disk_paths.clone(),
            network_interfaces: config.network_interfaces.clone(),
        }
    }
}

/// Everything the meter knows, copied out at once.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MeterSnapshot {
    pub current: Option<ResourceUsage>,
    pub previous: Option<ResourceUsage>,
    pub delta: UsageDelta,
    pub history: Vec<ResourceUsage>,
    pub stats: UsageStats,
    pub alerts: BTreeMap<ResourceKind, String>,
}

#[derive(Debug)]
struct Selection {
    disk_paths: Vec<PathBuf>,
    network_interfaces: Vec<String>,
}

#[derive(Debug, Default)]
struct MeterState {
    current: Option<ResourceUsage>,
    previous: Option<ResourceUsage>,
    delta: UsageDelta,
    history: UsageHistory,
    stats: UsageStats,
    limits: BTreeMap<ResourceKind, u64>,
    alerts: BTreeMap<ResourceKind, String>,
}

impl MeterState {
    fn commit(&mut self, usage: ResourceUsage) {
        self.delta = match &self.current {
            Some(prev) => UsageDelta::between(prev, &usage),
            None => UsageDelta::default(),
        };
        self.previous = self.current.replace(usage.clone());
        self.history.push(usage);
        self.stats = UsageStats::from_history(&self.history);
        self.refresh_alerts();
    }

    fn refresh_alerts(&mut self) {
        self.alerts.clear();
        let Some(current) = &self.current else {
            return;
        };
        for (&kind, &threshold) in &self.limits {
            let value = current.value_of(kind);
            if value > threshold {
                self.alerts.insert(
                    kind,
                    format!("{} usage {} exceeds limit {}", kind, value, threshold),
                );
            }
        }
    }
}

fn sampling(sampler: &'static str) -> impl FnOnce(CollectError) -> GovernError {
    move |source| GovernError::Sampling { sampler, source }
}

/// Samples one process and the host it runs on.
pub struct UsageMeter {
    pid: u32,
    source: Mutex<Box<dyn MetricsSource>>,
    inspector: Box<dyn ProcessInspector>,
    selection: RwLock<Selection>,
    state: RwLock<MeterState>,
}

impl UsageMeter {
    pub fn new(
        source: Box<dyn MetricsSource>,
        inspector: Box<dyn ProcessInspector>,
        config: MeterConfig,
    ) -> Self {
        Self {
            pid: config.process_id,
            source: Mutex::new(source),
            inspector,
            selection: RwLock::new(Selection {
                disk_paths: config.disk_paths,
                network_interfaces: config.network_interfaces,
            }),
            state: RwLock::new(MeterState {
                history: UsageHistory::new(config.history_limit),
                ..Default::default()
            }),
        }
    }

    pub fn process_id(&self) -> u32 {
        self.pid
    }

    /// Takes a fresh snapshot and commits it.
    ///
    /// Blocks while another update is in flight. Any sampler failure
    /// abandons the cycle: current, previous, history and stats keep their
    /// last committed values.
    pub fn update(&self) -> Result<()> {
        let (disk_paths, interfaces) = {
            let selection = self.selection.read();
            (
                selection.disk_paths.clone(),
                selection.network_interfaces.clone(),
            )
        };

        // Held until the commit below.
        let mut source = self.source.lock();
        let cpu = source.sample_cpu().map_err(sampling("cpu"))?;
        let memory = source.sample_memory().map_err(sampling("memory"))?;
        let disk = source.sample_disk(&disk_paths).map_err(sampling("disk"))?;
        let network = source
            .sample_network(&interfaces)
            .map_err(sampling("network"))?;
        let process = self.inspector.inspect(self.pid).map_err(sampling("process"))?;

        let usage = ResourceUsage::from_samples(Utc::now(), cpu, memory, disk, network, process);
        debug!(
            pid = self.pid,
            cpu = usage.cpu.usage,
            memory = usage.memory.usage,
            disk_percent = usage.disk.percent,
            "usage updated"
        );

        let mut state = self.state.write();
        state.commit(usage);
        drop(source);
        for (kind, message) in &state.alerts {
            warn!(%kind, "{}", message);
        }
        Ok(())
    }

    pub fn set_disk_paths(&self, paths: Vec<PathBuf>) {
        self.selection.write().disk_paths = paths;
    }

    /// Restricts network metering to `interfaces`; empty means all.
    pub fn set_network_interfaces(&self, interfaces: Vec<String>) {
        self.selection.write().network_interfaces = interfaces;
    }

    pub fn disk_paths(&self) -> Vec<PathBuf> {
        self.selection.read().disk_paths.clone()
    }

    pub fn network_interfaces(&self) -> Vec<String> {
        self.selection.read().network_interfaces.clone()
    }

    /// Records the active threshold of `kind`, used for alerting.
    pub fn set_limit(&self, kind: ResourceKind, value: u64) {
        let mut state = self.state.write();
        state.limits.insert(kind, value);
        state.refresh_alerts();
    }

    pub fn remove_limit(&self, kind: ResourceKind) {
        let mut state = self.state.write();
        state.limits.remove(&kind);
        state.refresh_alerts();
    }

    pub fn limit(&self, kind: ResourceKind) -> Option<u64> {
        self.state.read().limits.get(&kind).copied()
    }

    /// Latest committed snapshot.
    pub fn current(&self) -> Option<ResourceUsage> {
        self.state.read().current.clone()
    }

    pub fn previous(&self) -> Option<ResourceUsage> {
        self.state.read().previous.clone()
    }

    /// Delta between the two latest snapshots; all zeros before the second update.
    pub fn delta(&self) -> UsageDelta {
        self.state.read().delta.clone()
    }

    /// History, oldest first.
    pub fn history(&self) -> Vec<ResourceUsage> {
        self.state.read().history.to_vec()
    }

    pub fn stats(&self) -> UsageStats {
        self.state.read().stats.clone()
    }

    /// Breached thresholds as of the latest snapshot.
    pub fn alerts(&self) -> BTreeMap<ResourceKind, String> {
        self.state.read().alerts.clone()
    }

    pub fn snapshot(&self) -> MeterSnapshot {
        let state = self.state.read();
        MeterSnapshot {
            current: state.current.clone(),
            previous: state.previous.clone(),
            delta: state.delta.clone(),
            history: state.history.to_vec(),
            stats: state.stats.clone(),
            alerts: state.alerts.clone(),
        }
    }

    /// Detailed record of the metered process, read on demand.
    pub fn inspect_process(&self) -> Result<ProcessDetails> {
        self.inspector
            .details(self.pid)
            .map_err(sampling("process"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::mock::{DAEMON_PID, MockFs, ScriptedSource, StaticInspector};
    use crate::collector::{ProcfsInspector, ProcfsSource};

    const PID: u32 = 4321;

    fn meter(history: usize) -> (ScriptedSource, UsageMeter) {
        let script = ScriptedSource::new();
        let meter = UsageMeter::new(
            Box::new(script.clone()),
            Box::new(StaticInspector::new(PID, "agent")),
            MeterConfig {
                process_id: PID,
                history_limit: history,
                ..Default::default()
            },
        );
        (script, meter)
    }

    #[test]
    fn test_first_update_has_zero_delta() {
        let (script, meter) = meter(10);
        script.set_memory(500);
        meter.update().unwrap();

        assert!(meter.delta().is_zero());
        assert!(meter.previous().is_none());
        assert_eq!(meter.current().unwrap().memory.usage, 500);
        assert_eq!(meter.current().unwrap().process.name, "agent");
    }

    #[test]
    fn test_delta_is_current_minus_previous() {
        let (script, meter) = meter(10);
        script.set_memory(500);
        script.set_network(1000, 2000);
        meter.update().unwrap();

        script.set_memory(300);
        script.set_network(1500, 2600);
        script.set_cpu_percent(25.0);
        meter.update().unwrap();

        let delta = meter.delta();
        assert_eq!(delta.memory_usage, -200);
        assert_eq!(delta.net_bytes_sent, 500);
        assert_eq!(delta.net_bytes_recv, 600);
        assert_eq!(delta.cpu_usage, 25.0);
        assert_eq!(meter.previous().unwrap().memory.usage, 500);
    }

    #[test]
    fn test_history_capacity_three_after_four_updates() {
        let (script, meter) = meter(3);
        for rss in [1, 2, 3, 4] {
            script.set_memory(rss);
            meter.update().unwrap();
        }

        let history = meter.history();
        assert_eq!(history.len(), 3);
        let order: Vec<u64> = history.iter().map(|u| u.memory.usage).collect();
        assert_eq!(order, vec![2, 3, 4]);
    }

    #[test]
    fn test_failed_sampler_commits_nothing() {
        let (script, meter) = meter(10);
        script.set_memory(100);
        meter.update().unwrap();
        let before = meter.snapshot();

        script.set_memory(900);
        script.fail("network");
        let err = meter.update().unwrap_err();
        assert!(matches!(err, GovernError::Sampling { sampler: "network", .. }));

        let after = meter.snapshot();
        assert_eq!(after.current, before.current);
        assert_eq!(after.history.len(), 1);
        assert!(after.previous.is_none());

        script.recover();
        meter.update().unwrap();
        assert_eq!(meter.current().unwrap().memory.usage, 900);
    }

    // Parks the first inspection until the test lets it go.
    struct GatedInspector {
        inner: StaticInspector,
        entered: Mutex<Option<std::sync::mpsc::Sender<()>>>,
    }

    impl ProcessInspector for GatedInspector {
        fn inspect(&self, pid: u32) -> std::result::Result<crate::collector::ProcessSample, CollectError> {
            if let Some(entered) = self.entered.lock().take() {
                entered.send(()).unwrap();
                std::thread::sleep(std::time::Duration::from_millis(300));
            }
            self.inner.inspect(pid)
        }

        fn details(&self, pid: u32) -> std::result::Result<ProcessDetails, CollectError> {
            self.inner.details(pid)
        }
    }

    #[test]
    fn test_concurrent_updates_commit_in_sample_order() {
        let script = ScriptedSource::new();
        let (tx, rx) = std::sync::mpsc::channel();
        let meter = std::sync::Arc::new(UsageMeter::new(
            Box::new(script.clone()),
            Box::new(GatedInspector {
                inner: StaticInspector::new(PID, "agent"),
                entered: Mutex::new(Some(tx)),
            }),
            MeterConfig {
                process_id: PID,
                history_limit: 10,
                ..Default::default()
            },
        ));

        script.set_memory(1);
        let slow = {
            let meter = std::sync::Arc::clone(&meter);
            std::thread::spawn(move || meter.update())
        };
        rx.recv().unwrap();

        script.set_memory(2);
        meter.update().unwrap();
        slow.join().unwrap().unwrap();

        let order: Vec<u64> = meter.history().iter().map(|u| u.memory.usage).collect();
        assert_eq!(order, vec![1, 2]);
        assert_eq!(meter.current().unwrap().memory.usage, 2);
        assert_eq!(meter.previous().unwrap().memory.usage, 1);
        assert_eq!(meter.delta().memory_usage, 1);
    }

    #[test]
    fn test_missing_process_fails_update() {
        let script = ScriptedSource::new();
        let meter = UsageMeter::new(
            Box::new(script),
            Box::new(StaticInspector::new(PID, "agent")),
            MeterConfig {
                process_id: PID + 1,
                ..Default::default()
            },
        );
        assert!(matches!(
            meter.update(),
            Err(GovernError::Sampling { sampler: "process", .. })
        ));
        assert!(meter.current().is_none());
    }

    #[test]
    fn test_stats_over_window() {
        let (script, meter) = meter(10);
        for cpu in [10.0, 30.0, 20.0] {
            script.set_cpu_percent(cpu);
            meter.update().unwrap();
        }

        let stats = meter.stats();
        assert_eq!(stats.samples, 3);
        assert_eq!(stats.cpu_percent.min, 10.0);
        assert_eq!(stats.cpu_percent.max, 30.0);
        assert!((stats.cpu_percent.avg - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_alerts_follow_limits() {
        let (script, meter) = meter(10);
        script.set_memory(150);
        meter.update().unwrap();
        assert!(meter.alerts().is_empty());

        meter.set_limit(ResourceKind::Memory, 100);
        assert_eq!(meter.limit(ResourceKind::Memory), Some(100));
        let alerts = meter.alerts();
        assert_eq!(
            alerts.get(&ResourceKind::Memory).map(String::as_str),
            Some("memory usage 150 exceeds limit 100")
        );

        meter.remove_limit(ResourceKind::Memory);
        assert!(meter.alerts().is_empty());
    }

    #[test]
    fn test_selection_setters() {
        let (_, meter) = meter(10);
        assert_eq!(meter.disk_paths(), vec![PathBuf::from("/")]);

        meter.set_disk_paths(vec![PathBuf::from("/data")]);
        meter.set_network_interfaces(vec!["eth0".into()]);
        assert_eq!(meter.disk_paths(), vec![PathBuf::from("/data")]);
        assert_eq!(meter.network_interfaces(), vec!["eth0".to_string()]);
    }

    #[test]
    fn test_procfs_meter_end_to_end() {
        let fs = MockFs::typical_system();
        let meter = UsageMeter::new(
            Box::new(ProcfsSource::new(fs.clone(), "/proc", DAEMON_PID)),
            Box::new(ProcfsInspector::new(fs, "/proc")),
            MeterConfig {
                process_id: DAEMON_PID,
                history_limit: 5,
                disk_paths: vec![PathBuf::from("/"), PathBuf::from("/data")],
                network_interfaces: vec!["eth0".into()],
            },
        );
        meter.update().unwrap();

        let usage = meter.current().unwrap();
        assert_eq!(usage.memory.usage, 8000 * 1024);
        assert!((usage.disk.percent - 28.0).abs() < 1e-9);
        assert_eq!(usage.network.bytes_sent, 123456789);
        assert_eq!(usage.process.children, vec![1001, 1002]);
        assert_eq!(usage.process.descriptors, 6);

        let details = meter.inspect_process().unwrap();
        assert_eq!(details.name, "hostgovd");
    }
}
