//! Resource manager: one lifecycle over the meter and the enforcer.
//!
//! [`ResourceManager::start`] spawns two loops on the current tokio runtime:
//!
//! ```text
//!   metering loop (update_interval)      enforcement loop (check_interval)
//!   ───────────────────────────────      ─────────────────────────────────
//!   spawn_blocking(meter.update)         spawn_blocking(meter.update)
//!                                        enforcer.check().await
//! ```
//!
//! Both stop when the manager's cancellation token fires, either through
//! [`ResourceManager::stop`] or through the parent token the host passed in.

pub mod tuning;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::collector::{self, MetricsSource, ProcessDetails, ProcessInspector};
use crate::config::GovernorConfig;
use crate::error::{GovernError, Result};
use crate::limits::{ActionHandler, AlertHandler, LimitEnforcer, LimitType, ResourceLimit};
use crate::metering::{
    MeterConfig, ResourceKind, ResourceUsage, UsageDelta, UsageMeter, UsageStats,
};

pub use tuning::{AllocatorStats, PriorityClass, priority_class};

/// Host and runtime facts reported by [`ResourceManager::system_info`].
#[derive(Debug, Clone, Serialize)]
pub struct SystemInfo {
    pub os: String,
    pub arch: String,
    pub os_version: Option<String>,
    pub kernel_version: Option<String>,
    pub host_name: Option<String>,
    pub cpu_count: usize,
    /// Current scheduler parallelism hint.
    pub parallelism: usize,
    /// Worker threads of the tokio runtime the call was made on.
    pub runtime_workers: Option<usize>,
    pub allocator: Option<AllocatorStats>,
    pub process_id: u32,
}

pub struct ResourceManager {
    config: GovernorConfig,
    meter: Arc<UsageMeter>,
    enforcer: Arc<LimitEnforcer>,
    cancel: CancellationToken,
    started: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    parallelism: AtomicUsize,
}

impl ResourceManager {
    /// Builds a manager with the platform's default collectors.
    pub fn new(config: GovernorConfig) -> Self {
        Self::from_parts(config, None, None, CancellationToken::new())
    }

    /// Like [`ResourceManager::new`], stopping when `parent` is cancelled.
    pub fn with_parent(config: GovernorConfig, parent: &CancellationToken) -> Self {
        Self::from_parts(config, None, None, parent.child_token())
    }

    /// Builds a manager over the given collectors.
    pub fn with_parts(
        config: GovernorConfig,
        source: Box<dyn MetricsSource>,
        inspector: Box<dyn ProcessInspector>,
    ) -> Self {
        Self::from_parts(config, Some(source), Some(inspector), CancellationToken::new())
    }

    pub fn from_parts(
        config: GovernorConfig,
        source: Option<Box<dyn MetricsSource>>,
        inspector: Option<Box<dyn ProcessInspector>>,
        cancel: CancellationToken,
    ) -> Self {
        let meter_config = MeterConfig::from(&config);
        let source = source.unwrap_or_else(|| collector::default_source(meter_config.process_id));
        let inspector = inspector.unwrap_or_else(collector::default_inspector);
        let meter = Arc::new(UsageMeter::new(source, inspector, meter_config));
        let enforcer = Arc::new(LimitEnforcer::new(Arc::clone(&meter), cancel.clone()));

        Self {
            config,
            meter,
            enforcer,
            cancel,
            started: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
            parallelism: AtomicUsize::new(tuning::available_cores()),
        }
    }

    pub fn config(&self) -> &GovernorConfig {
        &self.config
    }

    pub fn meter(&self) -> &Arc<UsageMeter> {
        &self.meter
    }

    pub fn enforcer(&self) -> &Arc<LimitEnforcer> {
        &self.enforcer
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Starts the metering and enforcement loops.
    ///
    /// Returns false if already started, already stopped or called outside
    /// a tokio runtime.
    pub fn start(&self) -> bool {
        if self.cancel.is_cancelled() {
            debug!("manager stopped, not starting");
            return false;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("no tokio runtime, manager not started");
            return false;
        };
        if self.started.swap(true, Ordering::AcqRel) {
            return false;
        }

        let metering = handle.spawn(metering_loop(
            Arc::clone(&self.meter),
            self.cancel.clone(),
            self.config.update_interval,
        ));
        let enforcement = handle.spawn(enforcement_loop(
            Arc::clone(&self.enforcer),
            self.cancel.clone(),
            self.config.check_interval,
        ));
        self.tasks.lock().extend([metering, enforcement]);

        info!(
            pid = self.meter.process_id(),
            update_interval_ms = self.config.update_interval.as_millis() as u64,
            check_interval_ms = self.config.check_interval.as_millis() as u64,
            history_limit = self.config.history_limit,
            "resource manager started"
        );
        true
    }

    /// Cancels both loops. Safe to call repeatedly.
    pub fn stop(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();
        info!("resource manager stopped");
    }

    /// Stops and waits for both loops to exit.
    pub async fn shutdown(&self) {
        self.stop();
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                error!(error = %e, "manager task failed");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::Acquire) && !self.cancel.is_cancelled()
    }

    /// Runs one update followed by one check, outside the loops.
    pub async fn update_and_check(&self) -> Result<()> {
        let meter = Arc::clone(&self.meter);
        match tokio::task::spawn_blocking(move || meter.update()).await {
            Ok(result) => result?,
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(_) => return Err(GovernError::Cancelled),
        }
        self.enforcer.check().await
    }

    // ============================================================
    // Limits and handlers
    // ============================================================

    pub fn add_limit(&self, limit: ResourceLimit) {
        self.enforcer.add_limit(limit);
    }

    pub fn remove_limit(&self, kind: ResourceKind, limit_type: LimitType) {
        self.enforcer.remove_limit(kind, limit_type);
    }

    /// Soft limit on process CPU percent. The threshold is truncated to an
    /// integer percent.
    pub fn limit_cpu(&self, percent: f64, action: impl Into<String>) {
        self.add_limit(ResourceLimit::soft(
            ResourceKind::Cpu,
            percent.max(0.0) as u64,
            action,
        ));
    }

    /// Soft limit on process memory (RSS) in bytes.
    pub fn limit_memory(&self, bytes: u64, action: impl Into<String>) {
        self.add_limit(ResourceLimit::soft(ResourceKind::Memory, bytes, action));
    }

    /// Soft limit on used bytes across the metered disk paths.
    pub fn limit_disk(&self, bytes: u64, action: impl Into<String>) {
        self.add_limit(ResourceLimit::soft(ResourceKind::Disk, bytes, action));
    }

    /// Soft limit on bytes sent plus received.
    pub fn limit_network(&self, bytes: u64, action: impl Into<String>) {
        self.add_limit(ResourceLimit::soft(ResourceKind::Network, bytes, action));
    }

    pub fn register_alert_handler(&self, handler: AlertHandler) {
        self.enforcer.register_alert_handler(handler);
    }

    pub fn register_action_handler(&self, name: impl Into<String>, handler: ActionHandler) {
        self.enforcer.register_action_handler(name, handler);
    }

    // ============================================================
    // Tuning
    // ============================================================

    /// Applies `priority` to the metered process.
    ///
    /// On unix the value is the niceness passed to `setpriority`; on Windows
    /// it is mapped through [`priority_class`].
    pub fn set_process_priority(&self, priority: i32) -> Result<()> {
        let pid = self.meter.process_id();
        match tuning::set_priority(pid, priority) {
            Ok(()) => {
                info!(pid, priority, class = ?priority_class(priority), "process priority set");
                Ok(())
            }
            Err(e) => {
                warn!(pid, priority, error = %e, "failed to set process priority");
                Err(e)
            }
        }
    }

    /// Sets the scheduler parallelism hint and returns the previous one.
    /// Zero leaves the hint unchanged.
    pub fn set_parallelism(&self, n: usize) -> usize {
        if n == 0 {
            return self.parallelism();
        }
        let old = self.parallelism.swap(n, Ordering::AcqRel);
        info!(old, new = n, "parallelism hint set");
        old
    }

    pub fn parallelism(&self) -> usize {
        self.parallelism.load(Ordering::Acquire)
    }

    /// Returns unused allocator memory to the OS. True if anything was done.
    pub fn optimize_memory_usage(&self) -> bool {
        let before = tuning::allocator_stats();
        let released = tuning::release_memory_to_os();
        let after = tuning::allocator_stats();
        match (before, after) {
            (Some(b), Some(a)) => info!(
                released,
                resident_before = b.resident,
                resident_after = a.resident,
                "memory optimized"
            ),
            _ => info!(released, "memory optimized"),
        }
        released
    }

    /// Resets the parallelism hint to the available cores.
    pub fn optimize_cpu_usage(&self) -> usize {
        let cores = tuning::available_cores();
        self.set_parallelism(cores);
        cores
    }

    pub fn optimize_resource_usage(&self) {
        self.optimize_memory_usage();
        self.optimize_cpu_usage();
    }

    // ============================================================
    // Read accessors
    // ============================================================

    pub fn resource_usage(&self) -> Option<ResourceUsage> {
        self.meter.current()
    }

    pub fn previous_usage(&self) -> Option<ResourceUsage> {
        self.meter.previous()
    }

    pub fn usage_delta(&self) -> UsageDelta {
        self.meter.delta()
    }

    pub fn usage_history(&self) -> Vec<ResourceUsage> {
        self.meter.history()
    }

    pub fn usage_stats(&self) -> UsageStats {
        self.meter.stats()
    }

    pub fn resource_alerts(&self) -> BTreeMap<ResourceKind, String> {
        self.meter.alerts()
    }

    pub fn resource_limits(&self) -> BTreeMap<ResourceKind, Vec<ResourceLimit>> {
        self.enforcer.limits()
    }

    pub fn process_info(&self) -> Result<ProcessDetails> {
        self.meter.inspect_process()
    }

    pub fn system_info(&self) -> SystemInfo {
        SystemInfo {
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            os_version: sysinfo::System::long_os_version(),
            kernel_version: sysinfo::System::kernel_version(),
            host_name: sysinfo::System::host_name(),
            cpu_count: tuning::available_cores(),
            parallelism: self.parallelism(),
            runtime_workers: tokio::runtime::Handle::try_current()
                .ok()
                .map(|h| h.metrics().num_workers()),
            allocator: tuning::allocator_stats(),
            process_id: self.meter.process_id(),
        }
    }
}

impl Drop for ResourceManager {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn metering_loop(meter: Arc<UsageMeter>, cancel: CancellationToken, interval: Duration) {
    let mut tick = tokio::time::interval(interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tick.tick() => {}
        }

        let meter = Arc::clone(&meter);
        let t0 = Instant::now();
        match tokio::task::spawn_blocking(move || meter.update()).await {
            Ok(Ok(())) => debug!(duration_ms = t0.elapsed().as_millis() as u64, "metering tick"),
            Ok(Err(e)) => error!(error = %e, "usage update failed"),
            Err(e) => error!(error = %e, "usage update panicked in spawn_blocking"),
        }
    }
    debug!("metering loop stopped");
}

async fn enforcement_loop(enforcer: Arc<LimitEnforcer>, cancel: CancellationToken, interval: Duration) {
    let mut tick = tokio::time::interval(interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tick.tick() => {}
        }

        let meter = Arc::clone(enforcer.meter());
        match tokio::task::spawn_blocking(move || meter.update()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(error = %e, "usage update failed, skipping limit check");
                continue;
            }
            Err(e) => {
                error!(error = %e, "usage update panicked in spawn_blocking");
                continue;
            }
        }

        if let Err(e) = enforcer.check().await {
            if cancel.is_cancelled() {
                break;
            }
            error!(error = %e, "limit check failed");
        }
    }
    debug!("enforcement loop stopped");
}
