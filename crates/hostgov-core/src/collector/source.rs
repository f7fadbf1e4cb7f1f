//! Sampler traits implemented by the platform collectors and the raw samples
//! they return.
//!
//! The meter only talks to [`MetricsSource`] and [`ProcessInspector`]; which
//! implementation backs them is decided once, at construction.

use std::path::PathBuf;

use serde::Serialize;

use crate::collector::procfs::parser::ParseError;

/// Error type for collection failures.
#[derive(Debug, thiserror::Error)]
pub enum CollectError {
    /// Process disappeared during collection.
    #[error("process {0} disappeared")]
    ProcessGone(u32),
    /// I/O error reading OS files.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Parse error in OS files.
    #[error("parse error: {0}")]
    Parse(String),
    /// The metric is not available on this platform.
    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl From<ParseError> for CollectError {
    fn from(e: ParseError) -> Self {
        CollectError::Parse(e.message)
    }
}

/// CPU sample for the system and the metered process.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CpuSample {
    /// System-wide busy percentage.
    pub system_percent: f64,
    /// Busy percentage per core.
    pub per_core: Vec<f64>,
    /// Process CPU percentage over the last sampling interval.
    pub process_percent: f64,
    /// Cumulative process user time in seconds.
    pub user_time: f64,
    /// Cumulative process kernel time in seconds.
    pub system_time: f64,
    pub cores: usize,
}

/// Memory sample, in bytes.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MemorySample {
    pub rss: u64,
    pub vms: u64,
    pub swap: u64,
    /// Process RSS as a percentage of total system memory.
    pub percent: f64,
    pub total: u64,
    pub free: u64,
    pub available: u64,
}

/// Disk sample summed over the configured paths and the physical devices.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DiskSample {
    pub used: u64,
    pub total: u64,
    pub free: u64,
    pub read_bytes: u64,
    pub write_bytes: u64,
    pub read_count: u64,
    pub write_count: u64,
    /// Milliseconds spent reading.
    pub read_time: u64,
    /// Milliseconds spent writing.
    pub write_time: u64,
}

/// Network sample summed over the selected interfaces.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NetworkSample {
    pub bytes_sent: u64,
    pub bytes_recv: u64,
    pub packets_sent: u64,
    pub packets_recv: u64,
    /// Inbound plus outbound drops.
    pub dropped: u64,
    /// Inbound plus outbound errors.
    pub errors: u64,
}

/// Process facts gathered on every update.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProcessSample {
    pub pid: u32,
    pub name: String,
    pub status: String,
    /// Creation time in unix milliseconds.
    pub create_time: i64,
    pub threads: u32,
    pub descriptors: u32,
    pub children: Vec<u32>,
}

/// Detailed process record served on demand.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProcessDetails {
    pub pid: u32,
    pub ppid: u32,
    pub name: String,
    pub cmdline: Vec<String>,
    pub status: String,
    pub create_time: i64,
    pub threads: u32,
    pub descriptors: u32,
    pub children: Vec<u32>,
    pub rss: u64,
    pub vms: u64,
    pub nice: i32,
    pub user_time: f64,
    pub system_time: f64,
}

/// OS metrics provider for one target process.
///
/// Implementations may keep counters between calls to turn cumulative values
/// into rates, hence `&mut self`.
pub trait MetricsSource: Send {
    fn sample_cpu(&mut self) -> Result<CpuSample, CollectError>;

    fn sample_memory(&mut self) -> Result<MemorySample, CollectError>;

    /// Capacity is summed across `paths`; IO counters cover all physical disks.
    fn sample_disk(&mut self, paths: &[PathBuf]) -> Result<DiskSample, CollectError>;

    /// Counters summed across `interfaces`, or across all interfaces when empty.
    fn sample_network(&mut self, interfaces: &[String]) -> Result<NetworkSample, CollectError>;
}

/// Platform process inspector.
pub trait ProcessInspector: Send + Sync {
    fn inspect(&self, pid: u32) -> Result<ProcessSample, CollectError>;

    fn details(&self, pid: u32) -> Result<ProcessDetails, CollectError>;
}

impl<T: MetricsSource + ?Sized> MetricsSource for Box<T> {
    fn sample_cpu(&mut self) -> Result<CpuSample, CollectError> {
        (**self).sample_cpu()
    }

    fn sample_memory(&mut self) -> Result<MemorySample, CollectError> {
        (**self).sample_memory()
    }

    fn sample_disk(&mut self, paths: &[PathBuf]) -> Result<DiskSample, CollectError> {
        (**self).sample_disk(paths)
    }

    fn sample_network(&mut self, interfaces: &[String]) -> Result<NetworkSample, CollectError> {
        (**self).sample_network(interfaces)
    }
}

/// Returns true when `name` passes an interface filter (empty means all).
pub(crate) fn interface_selected(filter: &[String], name: &str) -> bool {
    filter.is_empty() || filter.iter().any(|f| f == name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interface_selected() {
        assert!(interface_selected(&[], "eth0"));
        let filter = vec!["eth0".to_string()];
        assert!(interface_selected(&filter, "eth0"));
        assert!(!interface_selected(&filter, "lo"));
    }

    #[test]
    fn test_parse_error_converts() {
        let err: CollectError = ParseError::new("bad line").into();
        assert!(matches!(err, CollectError::Parse(ref m) if m == "bad line"));
        assert_eq!(err.to_string(), "parse error: bad line");
    }
}
