//! hostgovd - resource governor daemon.
//!
//! Meters a process (itself by default), enforces the configured limits and
//! keeps its own handles in a registry with an idle sweep.

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;
#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use clap::Parser;
use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{Level, debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use hostgov_core::collector::ProcessDetails;
use hostgov_core::fmt::{
    FmtStyle, format_bytes, format_duration, format_limit_value, parse_bytes, usage_line,
};
use hostgov_core::limits::{actions, alert_handler, sync_action};
use hostgov_core::manager::tuning;
use hostgov_core::{
    GovernError, GovernorConfig, RegistryConfig, Resource, ResourceKind, ResourceLimit,
    ResourceManager, ResourceRegistry, ResourceUsage, SystemInfo,
};

/// Custom action returning allocator memory to the OS on breach.
const PURGE_ACTION: &str = "purge";

/// Resource governor daemon.
#[derive(Parser, Debug)]
#[command(name = "hostgovd", about = "Resource governor daemon", version)]
struct Args {
    /// Metering interval in seconds.
    #[arg(short, long, default_value = "5", env = "HOSTGOV_INTERVAL")]
    interval: u64,

    /// Limit check interval in seconds.
    #[arg(long, default_value = "1", env = "HOSTGOV_CHECK_INTERVAL")]
    check_interval: u64,

    /// Number of snapshots kept in history.
    #[arg(long, default_value = "100", env = "HOSTGOV_HISTORY")]
    history: usize,

    /// Process to meter. Defaults to the daemon itself.
    #[arg(long, env = "HOSTGOV_PID")]
    pid: Option<u32>,

    /// Mount point included in disk usage (repeatable).
    #[arg(long = "disk-path", default_value = "/", env = "HOSTGOV_DISK_PATHS", value_delimiter = ',')]
    disk_paths: Vec<PathBuf>,

    /// Network interface to count (repeatable). All interfaces when omitted.
    #[arg(long = "interface", env = "HOSTGOV_INTERFACES", value_delimiter = ',')]
    interfaces: Vec<String>,

    /// Soft CPU limit in percent.
    #[arg(long, env = "HOSTGOV_MAX_CPU")]
    max_cpu: Option<f64>,

    #[arg(long, default_value = actions::LOG, env = "HOSTGOV_CPU_ACTION")]
    cpu_action: String,

    /// Soft memory limit (e.g. "512M", "2G").
    #[arg(long, value_parser = parse_bytes, env = "HOSTGOV_MAX_MEMORY")]
    max_memory: Option<u64>,

    #[arg(long, default_value = actions::LOG, env = "HOSTGOV_MEMORY_ACTION")]
    memory_action: String,

    /// Soft disk usage limit (e.g. "100G").
    #[arg(long, value_parser = parse_bytes, env = "HOSTGOV_MAX_DISK")]
    max_disk: Option<u64>,

    #[arg(long, default_value = actions::LOG, env = "HOSTGOV_DISK_ACTION")]
    disk_action: String,

    /// Soft limit on bytes sent plus received.
    #[arg(long, value_parser = parse_bytes, env = "HOSTGOV_MAX_NETWORK")]
    max_network: Option<u64>,

    #[arg(long, default_value = actions::LOG, env = "HOSTGOV_NETWORK_ACTION")]
    network_action: String,

    /// Registry resources idle for longer than this many seconds are released.
    #[arg(long, default_value = "1800", env = "HOSTGOV_IDLE_TIMEOUT")]
    idle_timeout: u64,

    /// Registry idle sweep interval in seconds.
    #[arg(long, default_value = "600", env = "HOSTGOV_CLEANUP_INTERVAL")]
    cleanup_interval: u64,

    /// Priority applied to the metered process (niceness on unix).
    #[arg(long, env = "HOSTGOV_PRIORITY", allow_hyphen_values = true)]
    priority: Option<i32>,

    /// Worker threads. Defaults to the available cores.
    #[arg(long, env = "HOSTGOV_THREADS")]
    threads: Option<usize>,

    /// Seconds between status lines in the log.
    #[arg(long, default_value = "60", env = "HOSTGOV_STATUS_INTERVAL")]
    status_interval: u64,

    /// Write the daemon pid here. The handle is tracked in the registry and
    /// the file is removed on shutdown.
    #[arg(long, env = "HOSTGOV_PID_FILE")]
    pid_file: Option<PathBuf>,

    /// Take one snapshot, check limits, print a JSON report and exit.
    #[arg(long)]
    once: bool,

    /// Increase logging verbosity (-v for debug, -vv for trace). Default is info level.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode - only show errors.
    #[arg(short, long)]
    quiet: bool,
}

impl Args {
    fn governor_config(&self) -> GovernorConfig {
        let registry = RegistryConfig::default()
            .with_idle_timeout(Duration::from_secs(self.idle_timeout))
            .with_cleanup_interval(Duration::from_secs(self.cleanup_interval.max(1)));
        let mut config = GovernorConfig::default()
            .with_update_interval(Duration::from_secs(self.interval.max(1)))
            .with_check_interval(Duration::from_secs(self.check_interval.max(1)))
            .with_history_limit(self.history)
            .with_disk_paths(self.disk_paths.iter().cloned())
            .with_network_interfaces(self.interfaces.iter().cloned())
            .with_registry(registry);
        if let Some(pid) = self.pid {
            config = config.with_process_id(pid);
        }
        config
    }

    /// Limits requested on the command line, in check order.
    fn limits(&self) -> Vec<ResourceLimit> {
        let cpu = self
            .max_cpu
            .map(|p| ResourceLimit::soft(ResourceKind::Cpu, p.max(0.0) as u64, &self.cpu_action));
        let memory = self
            .max_memory
            .map(|b| ResourceLimit::soft(ResourceKind::Memory, b, &self.memory_action));
        let disk = self
            .max_disk
            .map(|b| ResourceLimit::soft(ResourceKind::Disk, b, &self.disk_action));
        let network = self
            .max_network
            .map(|b| ResourceLimit::soft(ResourceKind::Network, b, &self.network_action));
        [cpu, memory, disk, network].into_iter().flatten().collect()
    }
}

/// Initializes the tracing subscriber with the appropriate log level.
/// Default level is INFO. Use -q for quiet mode (errors only).
fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let mut filter = EnvFilter::from_default_env();
    for target in ["hostgovd", "hostgov_core"] {
        if let Ok(directive) = format!("{}={}", target, level).parse() {
            filter = filter.add_directive(directive);
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// Output of `--once`.
#[derive(Debug, Serialize)]
struct Report {
    timestamp: DateTime<Utc>,
    system: SystemInfo,
    usage: Option<ResourceUsage>,
    process: Option<ProcessDetails>,
    limits: Vec<ResourceLimit>,
    alerts: BTreeMap<ResourceKind, String>,
    /// Error the limit check ended with, if any.
    check: Option<String>,
}

impl Report {
    fn collect(manager: &ResourceManager, check: Option<&GovernError>) -> Self {
        Self {
            timestamp: Utc::now(),
            system: manager.system_info(),
            usage: manager.resource_usage(),
            process: manager
                .process_info()
                .inspect_err(|e| warn!(error = %e, "process details unavailable"))
                .ok(),
            limits: manager.resource_limits().into_values().flatten().collect(),
            alerts: manager.resource_alerts(),
            check: check.map(ToString::to_string),
        }
    }
}

fn configure(manager: &ResourceManager, args: &Args) {
    manager.register_alert_handler(alert_handler(|kind, message| {
        warn!(kind = %kind, "ALERT: {}", message);
    }));
    manager.register_action_handler(
        PURGE_ACTION,
        sync_action(|breach| {
            let released = tuning::release_memory_to_os();
            info!(breach = %breach, released, "purged allocator memory");
            Ok(())
        }),
    );

    for limit in args.limits() {
        if !manager.enforcer().has_action(&limit.action) && limit.action != actions::NONE {
            warn!(kind = %limit.kind, action = %limit.action, "unknown action, breaches will be ignored");
        }
        info!(
            "Limit: {} {} -> {}",
            limit.kind,
            format_limit_value(limit.kind, limit.value),
            limit.action
        );
        manager.add_limit(limit);
    }

    if let Some(priority) = args.priority
        && let Err(e) = manager.set_process_priority(priority)
    {
        error!("Failed to set priority {}: {}", priority, e);
    }
    if let Some(threads) = args.threads {
        manager.set_parallelism(threads);
    }
}

/// Creates the pid file and hands it to the registry.
fn track_pid_file(registry: &ResourceRegistry, path: &Path) -> std::io::Result<()> {
    let mut file = File::create(path)?;
    writeln!(file, "{}", std::process::id())?;
    file.flush()?;
    let resource = registry.track_file(file, path);
    debug!(id = %resource.id(), path = %path.display(), "pid file tracked");
    Ok(())
}

fn log_status(manager: &ResourceManager, registry: &ResourceRegistry) {
    match manager.resource_usage() {
        Some(usage) => info!("Status: {}", usage_line(&usage)),
        None => debug!("Status: no snapshot yet"),
    }
    if let Some(stats) = tuning::allocator_stats() {
        debug!(
            "Allocator: allocated={}, resident={}, retained={}",
            format_bytes(stats.allocated, FmtStyle::Compact),
            format_bytes(stats.resident, FmtStyle::Compact),
            format_bytes(stats.retained, FmtStyle::Compact)
        );
    }
    let stats = registry.stats();
    debug!(
        active = stats.current_active,
        created = stats.total_created,
        closed = stats.total_closed,
        closure_errors = stats.closure_errors,
        "registry"
    );
}

async fn run_once(manager: &ResourceManager) -> bool {
    let result = manager.update_and_check().await;
    if let Err(e) = &result {
        warn!("Limit check: {}", e);
    }
    let report = Report::collect(manager, result.as_ref().err());
    match serde_json::to_string_pretty(&report) {
        Ok(json) => println!("{}", json),
        Err(e) => error!("Failed to encode report: {}", e),
    }
    result.is_ok()
}

async fn run(args: Args, manager: ResourceManager, shutdown: CancellationToken) {
    let registry = ResourceRegistry::new(manager.config().registry);
    if let Some(path) = &args.pid_file
        && let Err(e) = track_pid_file(&registry, path)
    {
        error!("Failed to write pid file {}: {}", path.display(), e);
    }
    registry.start_idle_sweep();

    if !manager.start() {
        error!("Resource manager did not start");
        return;
    }
    info!("Governor running (pid {})", manager.meter().process_id());

    let status_every = Duration::from_secs(args.status_interval.max(1));
    let mut status = tokio::time::interval_at(tokio::time::Instant::now() + status_every, status_every);
    status.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            res = &mut ctrl_c => {
                if let Err(e) = res {
                    warn!("Failed to listen for Ctrl-C: {}", e);
                }
                info!("Received shutdown signal");
                break;
            }
            _ = shutdown.cancelled() => break,
            _ = status.tick() => log_status(&manager, &registry),
        }
    }

    info!("Shutting down...");
    shutdown.cancel();
    manager.shutdown().await;

    let errors = registry.stop();
    for e in &errors {
        error!("Failed to release resource: {}", e);
    }
    if let Some(path) = &args.pid_file
        && let Err(e) = std::fs::remove_file(path)
    {
        warn!("Failed to remove pid file {}: {}", path.display(), e);
    }

    let stats = manager.usage_stats();
    info!(
        "Shutdown complete: {} samples, avg cpu {:.1}%, peak mem {:.1}%",
        stats.samples, stats.cpu_percent.avg, stats.memory_percent.max
    );
}

fn main() {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    info!("hostgovd {} starting", env!("CARGO_PKG_VERSION"));
    let config = args.governor_config();
    info!(
        "Config: interval={}, check={}, history={}, pid={}",
        format_duration(config.update_interval, FmtStyle::Detail),
        format_duration(config.check_interval, FmtStyle::Detail),
        config.history_limit,
        config.resolved_pid()
    );

    let shutdown = CancellationToken::new();
    let manager = ResourceManager::with_parent(config, &shutdown);
    configure(&manager, &args);

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(manager.parallelism())
        .thread_name("hostgovd-worker")
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!("Failed to build runtime: {}", e);
            std::process::exit(1);
        }
    };
    debug!("Runtime: {} workers", manager.parallelism());

    if args.once {
        let ok = runtime.block_on(run_once(&manager));
        std::process::exit(if ok { 0 } else { 2 });
    }

    runtime.block_on(run(args, manager, shutdown));
}

#[cfg(test)]
mod tests {
    use super::*;
    use hostgov_core::LimitType;
    use hostgov_core::collector::mock::{ScriptedSource, StaticInspector};

    fn parse(argv: &[&str]) -> Args {
        Args::try_parse_from(std::iter::once("hostgovd").chain(argv.iter().copied())).unwrap()
    }

    #[test]
    fn test_defaults_map_to_config() {
        let config = parse(&[]).governor_config();
        let default = GovernorConfig::default();
        assert_eq!(config.update_interval, default.update_interval);
        assert_eq!(config.check_interval, default.check_interval);
        assert_eq!(config.history_limit, default.history_limit);
        assert_eq!(config.disk_paths, vec![PathBuf::from("/")]);
        assert!(config.network_interfaces.is_empty());
        assert_eq!(config.registry, RegistryConfig::default());
        assert_eq!(config.process_id, None);
    }

    #[test]
    fn test_flags_map_to_config() {
        let args = parse(&[
            "--interval", "2", "--check-interval", "0", "--history", "10", "--pid", "42",
            "--disk-path", "/data", "--disk-path", "/var", "--interface", "eth0,eth1",
            "--idle-timeout", "30",
        ]);
        let config = args.governor_config();
        assert_eq!(config.update_interval, Duration::from_secs(2));
        assert_eq!(config.check_interval, Duration::from_secs(1));
        assert_eq!(config.history_limit, 10);
        assert_eq!(config.process_id, Some(42));
        assert_eq!(config.disk_paths, vec![PathBuf::from("/data"), PathBuf::from("/var")]);
        assert_eq!(config.network_interfaces, vec!["eth0", "eth1"]);
        assert_eq!(config.registry.idle_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_limits_from_flags() {
        let args = parse(&[
            "--max-cpu", "85.7", "--max-memory", "512M", "--memory-action", "reject",
            "--max-network", "1G",
        ]);
        let limits = args.limits();
        assert_eq!(limits.len(), 3);
        assert_eq!(limits[0], ResourceLimit::soft(ResourceKind::Cpu, 85, actions::LOG));
        assert_eq!(
            limits[1],
            ResourceLimit::soft(ResourceKind::Memory, 512 << 20, actions::REJECT)
        );
        assert_eq!(limits[2].kind, ResourceKind::Network);
        assert_eq!(limits[2].value, 1 << 30);
        assert!(limits.iter().all(|l| l.limit_type == LimitType::Soft));
    }

    #[test]
    fn test_rejects_bad_size() {
        let result = Args::try_parse_from(["hostgovd", "--max-memory", "lots"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_negative_priority_accepted() {
        assert_eq!(parse(&["--priority", "-5"]).priority, Some(-5));
    }

    #[tokio::test]
    async fn test_report_after_breach() {
        let source = ScriptedSource::new();
        source.set_memory(300);
        let manager = ResourceManager::with_parts(
            GovernorConfig::default().with_process_id(4242),
            Box::new(source),
            Box::new(StaticInspector::new(4242, "hostgovd")),
        );
        configure(&manager, &parse(&["--max-memory", "200", "--memory-action", "reject"]));

        let result = manager.update_and_check().await;
        let err = result.as_ref().unwrap_err();
        let report = Report::collect(&manager, Some(err));
        let json = serde_json::to_value(&report).unwrap();

        assert_eq!(json["limits"][0]["action"], "reject");
        assert_eq!(json["usage"]["memory"]["usage"], 300);
        assert!(json["alerts"]["memory"].as_str().unwrap().contains("exceeds limit 200"));
        assert!(json["check"].as_str().unwrap().contains("memory"));
        assert_eq!(json["process"]["name"], "hostgovd");
    }

    #[test]
    fn test_pid_file_tracked_and_released() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hostgovd.pid");
        let registry = ResourceRegistry::default();

        track_pid_file(&registry, &path).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.trim(), std::process::id().to_string());
        assert_eq!(registry.len(), 1);

        assert!(registry.stop().is_empty());
        assert_eq!(registry.stats().total_closed, 1);
    }
}
