//! hostgov-core: resource governance for a long-running process.
//!
//! Provides:
//! - `registry`: tracking and guaranteed release of closable handles
//! - `metering`: periodic usage snapshots, deltas, bounded history
//! - `limits`: soft/hard limits and named enforcement actions
//! - `manager`: façade running metering and enforcement loops
//! - `collector`: OS metrics sources (procfs on Linux, sysinfo elsewhere)
//! - `fmt`: formatting helpers (bytes, durations, usage lines)
//! - `config`: governor and registry settings
//!
//! With `jemalloc` feature:
//! - allocator statistics and purging behind `manager::tuning`

pub mod collector;
pub mod config;
pub mod error;
pub mod fmt;
pub mod limits;
pub mod manager;
pub mod metering;
pub mod registry;

pub use config::{GovernorConfig, RegistryConfig};
pub use error::{BoxError, GovernError, Result};
pub use limits::{LimitEnforcer, LimitType, ResourceLimit};
pub use manager::{ResourceManager, SystemInfo};
pub use metering::{ResourceKind, ResourceUsage, UsageMeter};
pub use registry::{Resource, ResourceRegistry, ResourceStats, ScopedRegistry};
