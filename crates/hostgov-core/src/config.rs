//! Runtime configuration for the manager, the meter and the registry.
//!
//! All values have defaults; hosts override them with the `with_*` builders
//! or by deserializing a `GovernorConfig` from their own config source.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default number of snapshots kept in the usage history.
pub const DEFAULT_HISTORY_LIMIT: usize = 100;
/// Default interval between metering updates.
pub const DEFAULT_UPDATE_INTERVAL: Duration = Duration::from_secs(5);
/// Default interval between limit checks.
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(1);
/// Default interval of the registry's idle sweep.
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(10 * 60);
/// Default idle time after which the sweep releases a resource.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Configuration of the resource manager and its metering engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernorConfig {
    /// Process to meter. `None` means the current process.
    pub process_id: Option<u32>,
    /// Capacity of the usage history ring.
    pub history_limit: usize,
    /// Interval of the metering loop.
    #[serde(with = "duration_ms")]
    pub update_interval: Duration,
    /// Interval of the update-and-check enforcement loop.
    #[serde(with = "duration_ms")]
    pub check_interval: Duration,
    /// Filesystem paths whose usage is summed into the disk metrics.
    pub disk_paths: Vec<PathBuf>,
    /// Network interfaces to meter. Empty means all interfaces.
    pub network_interfaces: Vec<String>,
    pub registry: RegistryConfig,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            process_id: None,
            history_limit: DEFAULT_HISTORY_LIMIT,
            update_interval: DEFAULT_UPDATE_INTERVAL,
            check_interval: DEFAULT_CHECK_INTERVAL,
            disk_paths: vec![PathBuf::from("/")],
            network_interfaces: Vec::new(),
            registry: RegistryConfig::default(),
        }
    }
}

impl GovernorConfig {
    pub fn with_process_id(mut self, pid: u32) -> Self {
        self.process_id = Some(pid);
        self
    }

    /// Sets the history capacity. Zero falls back to the default.
    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = if limit == 0 {
            DEFAULT_HISTORY_LIMIT
        } else {
            limit
        };
        self
    }

    pub fn with_update_interval(mut self, interval: Duration) -> Self {
        self.update_interval = interval;
        self
    }

    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    pub fn with_disk_paths<I, P>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.disk_paths = paths.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_network_interfaces<I, S>(mut self, ifaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.network_interfaces = ifaces.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_registry(mut self, registry: RegistryConfig) -> Self {
        self.registry = registry;
        self
    }

    /// Resolves the metered process id, defaulting to the current process.
    pub fn resolved_pid(&self) -> u32 {
        self.process_id.unwrap_or_else(std::process::id)
    }
}

/// Configuration of the resource handle registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Interval of the background idle sweep.
    #[serde(with = "duration_ms")]
    pub cleanup_interval: Duration,
    /// Resources idle for longer than this are released by the sweep.
    #[serde(with = "duration_ms")]
    pub idle_timeout: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }
}

impl RegistryConfig {
    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }
}

/// Durations are (de)serialized as integer milliseconds.
mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = GovernorConfig::default();
        assert_eq!(config.history_limit, 100);
        assert_eq!(config.update_interval, Duration::from_secs(5));
        assert_eq!(config.check_interval, Duration::from_secs(1));
        assert_eq!(config.disk_paths, vec![PathBuf::from("/")]);
        assert!(config.network_interfaces.is_empty());
        assert_eq!(config.registry.cleanup_interval, Duration::from_secs(600));
        assert_eq!(config.registry.idle_timeout, Duration::from_secs(1800));
    }

    #[test]
    fn test_zero_history_falls_back_to_default() {
        let config = GovernorConfig::default().with_history_limit(0);
        assert_eq!(config.history_limit, DEFAULT_HISTORY_LIMIT);
    }

    #[test]
    fn test_resolved_pid_defaults_to_self() {
        assert_eq!(GovernorConfig::default().resolved_pid(), std::process::id());
        assert_eq!(
            GovernorConfig::default().with_process_id(42).resolved_pid(),
            42
        );
    }

    #[test]
    fn test_deserialize_partial() {
        let json = r#"{"history_limit": 3, "update_interval": 250, "network_interfaces": ["eth0"]}"#;
        let config: GovernorConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.history_limit, 3);
        assert_eq!(config.update_interval, Duration::from_millis(250));
        assert_eq!(config.network_interfaces, vec!["eth0".to_string()]);
        // Unspecified fields keep their defaults.
        assert_eq!(config.check_interval, DEFAULT_CHECK_INTERVAL);
    }
}
