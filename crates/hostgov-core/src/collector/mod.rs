//! OS metrics collection.
//!
//! The meter samples through two capabilities, [`MetricsSource`] and
//! [`ProcessInspector`], each with a procfs implementation for Linux and a
//! `sysinfo` implementation for every other OS.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        UsageMeter                           │
//! │        MetricsSource                ProcessInspector        │
//! └───────────┬──────────────────────────────┬──────────────────┘
//!             │                              │
//!   ┌─────────┴─────────┐          ┌─────────┴─────────┐
//!   │                   │          │                   │
//! ┌─▼────────────┐ ┌────▼───────┐ ┌▼───────────────┐ ┌─▼────────────────┐
//! │ ProcfsSource │ │SysinfoSource│ │ProcfsInspector │ │SnapshotInspector │
//! │ (Linux)      │ │ (portable) │ │ (Linux)        │ │ (portable)       │
//! └──────┬───────┘ └────────────┘ └───────┬────────┘ └──────────────────┘
//!        │                                │
//!        └────────────┬───────────────────┘
//!              ┌──────▼──────┐
//!              │  FileSystem │ (trait)
//!              └──────┬──────┘
//!          ┌──────────┼──────────┐
//!   ┌──────▼──────┐ ┌─▼───────────┐ ┌─────────────┐
//!   │   RealFs    │ │   MockFs    │ │  Scenarios  │
//!   │ (Linux)     │ │ (Testing)   │ │ (Fixtures)  │
//!   └─────────────┘ └─────────────┘ └─────────────┘
//! ```
//!
//! # Testing (with MockFs)
//!
//! ```
//! use hostgov_core::collector::{MetricsSource, MockFs, ProcfsSource};
//! use hostgov_core::collector::mock::DAEMON_PID;
//!
//! let mut source = ProcfsSource::new(MockFs::typical_system(), "/proc", DAEMON_PID);
//! let memory = source.sample_memory().unwrap();
//! assert_eq!(memory.rss, 8000 * 1024);
//! ```

pub mod mock;
pub mod portable;
pub mod procfs;
pub mod source;
pub mod traits;

pub use mock::MockFs;
pub use portable::{SnapshotInspector, SysinfoSource};
pub use procfs::{ProcfsInspector, ProcfsSource, SystemCollector};
pub use source::{
    CollectError, CpuSample, DiskSample, MemorySample, MetricsSource, NetworkSample,
    ProcessDetails, ProcessInspector, ProcessSample,
};
pub use traits::{DiskSpace, FileSystem, RealFs};

/// Returns the metrics source for this platform, metering `pid`.
#[cfg(target_os = "linux")]
pub fn default_source(pid: u32) -> Box<dyn MetricsSource> {
    Box::new(ProcfsSource::new(RealFs::new(), "/proc", pid))
}

/// Returns the metrics source for this platform, metering `pid`.
#[cfg(not(target_os = "linux"))]
pub fn default_source(pid: u32) -> Box<dyn MetricsSource> {
    Box::new(SysinfoSource::new(pid))
}

/// Returns the process inspector for this platform.
#[cfg(target_os = "linux")]
pub fn default_inspector() -> Box<dyn ProcessInspector> {
    Box::new(ProcfsInspector::new(RealFs::new(), "/proc"))
}

/// Returns the process inspector for this platform.
#[cfg(not(target_os = "linux"))]
pub fn default_inspector() -> Box<dyn ProcessInspector> {
    Box::new(SnapshotInspector::new())
}
