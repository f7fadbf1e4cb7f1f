//! Usage snapshot model and the field-wise delta between two snapshots.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::collector::{CpuSample, DiskSample, MemorySample, NetworkSample, ProcessSample};

/// Governed resource category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Cpu,
    Memory,
    Disk,
    Network,
}

impl ResourceKind {
    /// All kinds in evaluation order.
    pub const ALL: [ResourceKind; 4] = [
        ResourceKind::Cpu,
        ResourceKind::Memory,
        ResourceKind::Disk,
        ResourceKind::Network,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Cpu => "cpu",
            ResourceKind::Memory => "memory",
            ResourceKind::Disk => "disk",
            ResourceKind::Network => "network",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cpu" => Ok(ResourceKind::Cpu),
            "memory" | "mem" => Ok(ResourceKind::Memory),
            "disk" => Ok(ResourceKind::Disk),
            "network" | "net" => Ok(ResourceKind::Network),
            other => Err(format!("unknown resource kind: {}", other)),
        }
    }
}

/// CPU part of a snapshot. Times are cumulative seconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CpuUsage {
    /// Process CPU percentage; the value limits are checked against.
    pub usage: f64,
    pub system_percent: f64,
    pub per_core: Vec<f64>,
    pub total_time: f64,
    pub user_time: f64,
    pub system_time: f64,
    pub cores: usize,
}

/// Memory part of a snapshot, in bytes.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MemoryUsage {
    /// Process memory in use (RSS).
    pub usage: u64,
    pub rss: u64,
    pub vms: u64,
    pub swap: u64,
    pub percent: f64,
    pub total: u64,
    pub free: u64,
    pub available: u64,
}

/// Disk part of a snapshot: capacity summed over the configured paths and
/// IO counters summed over physical devices.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DiskUsage {
    /// Used bytes.
    pub usage: u64,
    pub total: u64,
    pub free: u64,
    /// `usage / total * 100` over the summed bytes.
    pub percent: f64,
    pub read_bytes: u64,
    pub write_bytes: u64,
    pub read_count: u64,
    pub write_count: u64,
    pub read_time: u64,
    pub write_time: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NetworkUsage {
    pub bytes_sent: u64,
    pub bytes_recv: u64,
    pub packets_sent: u64,
    pub packets_recv: u64,
    pub dropped: u64,
    pub errors: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProcessUsage {
    pub pid: u32,
    pub name: String,
    pub status: String,
    /// Unix milliseconds.
    pub create_time: i64,
    pub threads: u32,
    pub descriptors: u32,
    pub children: Vec<u32>,
}

/// One point-in-time measurement.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResourceUsage {
    pub timestamp: DateTime<Utc>,
    pub cpu: CpuUsage,
    pub memory: MemoryUsage,
    pub disk: DiskUsage,
    pub network: NetworkUsage,
    pub process: ProcessUsage,
}

impl ResourceUsage {
    /// Assembles a snapshot from raw samples.
    pub fn from_samples(
        timestamp: DateTime<Utc>,
        cpu: CpuSample,
        memory: MemorySample,
        disk: DiskSample,
        network: NetworkSample,
        process: ProcessSample,
    ) -> Self {
        Self {
            timestamp,
            cpu: CpuUsage {
                usage: cpu.process_percent,
                system_percent: cpu.system_percent,
                per_core: cpu.per_core,
                total_time: cpu.user_time + cpu.system_time,
                user_time: cpu.user_time,
                system_time: cpu.system_time,
                cores: cpu.cores,
            },
            memory: MemoryUsage {
                usage: memory.rss,
                rss: memory.rss,
                vms: memory.vms,
                swap: memory.swap,
                percent: memory.percent,
                total: memory.total,
                free: memory.free,
                available: memory.available,
            },
            disk: DiskUsage {
                usage: disk.used,
                total: disk.total,
                free: disk.free,
                percent: if disk.total > 0 {
                    disk.used as f64 / disk.total as f64 * 100.0
                } else {
                    0.0
                },
                read_bytes: disk.read_bytes,
                write_bytes: disk.write_bytes,
                read_count: disk.read_count,
                write_count: disk.write_count,
                read_time: disk.read_time,
                write_time: disk.write_time,
            },
            network: NetworkUsage {
                bytes_sent: network.bytes_sent,
                bytes_recv: network.bytes_recv,
                packets_sent: network.packets_sent,
                packets_recv: network.packets_recv,
                dropped: network.dropped,
                errors: network.errors,
            },
            process: ProcessUsage {
                pid: process.pid,
                name: process.name,
                status: process.status,
                create_time: process.create_time,
                threads: process.threads,
                descriptors: process.descriptors,
                children: process.children,
            },
        }
    }

    /// The single value limits of `kind` are compared against: CPU percent
    /// rounded to an integer, memory and disk bytes, network bytes sent plus
    /// received.
    pub fn value_of(&self, kind: ResourceKind) -> u64 {
        match kind {
            ResourceKind::Cpu => self.cpu.usage.max(0.0).round() as u64,
            ResourceKind::Memory => self.memory.usage,
            ResourceKind::Disk => self.disk.usage,
            ResourceKind::Network => self.network.bytes_sent + self.network.bytes_recv,
        }
    }
}

fn diff(cur: u64, prev: u64) -> i64 {
    cur as i64 - prev as i64
}

/// Signed field-wise difference between two consecutive snapshots.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UsageDelta {
    pub elapsed_ms: i64,

    pub cpu_usage: f64,
    pub cpu_system_percent: f64,
    /// Empty when the core count changed between the snapshots.
    pub cpu_per_core: Vec<f64>,
    pub cpu_total_time: f64,
    pub cpu_user_time: f64,
    pub cpu_system_time: f64,

    pub memory_usage: i64,
    pub memory_vms: i64,
    pub memory_swap: i64,
    pub memory_percent: f64,
    pub memory_free: i64,
    pub memory_available: i64,

    pub disk_usage: i64,
    pub disk_free: i64,
    pub disk_percent: f64,
    pub disk_read_bytes: i64,
    pub disk_write_bytes: i64,
    pub disk_read_count: i64,
    pub disk_write_count: i64,
    pub disk_read_time: i64,
    pub disk_write_time: i64,

    pub net_bytes_sent: i64,
    pub net_bytes_recv: i64,
    pub net_packets_sent: i64,
    pub net_packets_recv: i64,
    pub net_dropped: i64,
    pub net_errors: i64,

    pub process_threads: i64,
    pub process_descriptors: i64,
}

impl UsageDelta {
    /// Computes `cur - prev` for every numeric field.
    pub fn between(prev: &ResourceUsage, cur: &ResourceUsage) -> Self {
        let cpu_per_core = if prev.cpu.per_core.len() == cur.cpu.per_core.len() {
            cur.cpu
                .per_core
                .iter()
                .zip(&prev.cpu.per_core)
                .map(|(c, p)| c - p)
                .collect()
        } else {
            Vec::new()
        };

        Self {
            elapsed_ms: (cur.timestamp - prev.timestamp).num_milliseconds(),

            cpu_usage: cur.cpu.usage - prev.cpu.usage,
            cpu_system_percent: cur.cpu.system_percent - prev.cpu.system_percent,
            cpu_per_core,
            cpu_total_time: cur.cpu.total_time - prev.cpu.total_time,
            cpu_user_time: cur.cpu.user_time - prev.cpu.user_time,
            cpu_system_time: cur.cpu.system_time - prev.cpu.system_time,

            memory_usage: diff(cur.memory.usage, prev.memory.usage),
            memory_vms: diff(cur.memory.vms, prev.memory.vms),
            memory_swap: diff(cur.memory.swap, prev.memory.swap),
            memory_percent: cur.memory.percent - prev.memory.percent,
            memory_free: diff(cur.memory.free, prev.memory.free),
            memory_available: diff(cur.memory.available, prev.memory.available),

            disk_usage: diff(cur.disk.usage, prev.disk.usage),
            disk_free: diff(cur.disk.free, prev.disk.free),
            disk_percent: cur.disk.percent - prev.disk.percent,
            disk_read_bytes: diff(cur.disk.read_bytes, prev.disk.read_bytes),
            disk_write_bytes: diff(cur.disk.write_bytes, prev.disk.write_bytes),
            disk_read_count: diff(cur.disk.read_count, prev.disk.read_count),
            disk_write_count: diff(cur.disk.write_count, prev.disk.write_count),
            disk_read_time: diff(cur.disk.read_time, prev.disk.read_time),
            disk_write_time: diff(cur.disk.write_time, prev.disk.write_time),

            net_bytes_sent: diff(cur.network.bytes_sent, prev.network.bytes_sent),
            net_bytes_recv: diff(cur.network.bytes_recv, prev.network.bytes_recv),
            net_packets_sent: diff(cur.network.packets_sent, prev.network.packets_sent),
            net_packets_recv: diff(cur.network.packets_recv, prev.network.packets_recv),
            net_dropped: diff(cur.network.dropped, prev.network.dropped),
            net_errors: diff(cur.network.errors, prev.network.errors),

            process_threads: cur.process.threads as i64 - prev.process.threads as i64,
            process_descriptors: cur.process.descriptors as i64 - prev.process.descriptors as i64,
        }
    }

    /// Returns true when every numeric field is zero.
    pub fn is_zero(&self) -> bool {
        let mut scalars = self.clone();
        if scalars.cpu_per_core.iter().all(|v| *v == 0.0) {
            scalars.cpu_per_core.clear();
        }
        scalars == UsageDelta::default()
    }
}
