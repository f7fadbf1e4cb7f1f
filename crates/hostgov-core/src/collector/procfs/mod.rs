//! Collectors for the Linux `/proc` filesystem.
//!
//! `ProcfsSource` turns the cumulative counters exposed by `/proc` into the
//! per-interval rates the meter wants, keeping the previous readings between
//! calls.

pub mod parser;
pub mod process;
pub mod system;

use std::path::PathBuf;

use crate::collector::source::{
    CollectError, CpuSample, DiskSample, MemorySample, MetricsSource, NetworkSample,
};
use crate::collector::traits::FileSystem;
use parser::CpuStat;
use process::{CLK_TCK, read_proc_stat};

pub use process::ProcfsInspector;
pub use system::SystemCollector;

/// Sector size used by `/proc/diskstats`, independent of the device.
const SECTOR_SIZE: u64 = 512;

/// Shortest per-core window, in ticks, a CPU rate is computed over. Shorter
/// windows repeat the previous rates and keep the baseline.
const MIN_CPU_WINDOW_TICKS: u64 = CLK_TCK / 2;

/// `MetricsSource` backed by `/proc` and `statvfs`.
pub struct ProcfsSource<F: FileSystem> {
    system: SystemCollector<F>,
    pid: u32,
    prev_total: Option<CpuStat>,
    prev_cores: Vec<CpuStat>,
    prev_process_ticks: Option<u64>,
    last_cpu: Option<CpuSample>,
}

impl<F: FileSystem> ProcfsSource<F> {
    /// Creates a source metering `pid`.
    ///
    /// # Arguments
    /// * `fs` - Filesystem implementation (real or mock)
    /// * `proc_path` - Base path to proc filesystem (usually "/proc")
    /// * `pid` - Process whose CPU and memory are metered
    pub fn new(fs: F, proc_path: impl Into<String>, pid: u32) -> Self {
        Self {
            system: SystemCollector::new(fs, proc_path),
            pid,
            prev_total: None,
            prev_cores: Vec::new(),
            prev_process_ticks: None,
            last_cpu: None,
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Gives access to the underlying collector, mostly for tests that
    /// advance a mock filesystem between samples.
    pub fn system_mut(&mut self) -> &mut SystemCollector<F> {
        &mut self.system
    }
}

impl<F: FileSystem> MetricsSource for ProcfsSource<F> {
    /// System CPU is measured against the previous reading, or since boot on
    /// the first call. Process CPU is the share of one core over the same
    /// interval and reads 0 on the first call. Calls closer together than
    /// `MIN_CPU_WINDOW_TICKS` repeat the previous rates.
    fn sample_cpu(&mut self) -> Result<CpuSample, CollectError> {
        let stat = self.system.collect_stat()?;
        let proc = read_proc_stat(self.system.fs(), self.system.proc_path(), self.pid)?;
        let process_ticks = proc.utime + proc.stime;
        let cores = stat.cores.len().max(1);

        if let (Some(prev), Some(last)) = (self.prev_total.as_ref(), self.last_cpu.as_ref()) {
            let window = stat.total.total_ticks().saturating_sub(prev.total_ticks()) / cores as u64;
            if window < MIN_CPU_WINDOW_TICKS {
                return Ok(CpuSample {
                    user_time: proc.utime as f64 / CLK_TCK as f64,
                    system_time: proc.stime as f64 / CLK_TCK as f64,
                    ..last.clone()
                });
            }
        }

        let per_core = if self.prev_cores.len() == stat.cores.len() {
            stat.cores
                .iter()
                .zip(&self.prev_cores)
                .map(|(cur, prev)| cur.busy_percent(Some(prev)))
                .collect()
        } else {
            stat.cores.iter().map(|c| c.busy_percent(None)).collect()
        };

        let process_percent = match (self.prev_total.as_ref(), self.prev_process_ticks) {
            (Some(prev), Some(prev_ticks)) => {
                let wall_ticks =
                    stat.total.total_ticks().saturating_sub(prev.total_ticks()) as f64 / cores as f64;
                if wall_ticks > 0.0 {
                    process_ticks.saturating_sub(prev_ticks) as f64 / wall_ticks * 100.0
                } else {
                    0.0
                }
            }
            _ => 0.0,
        };

        let sample = CpuSample {
            system_percent: stat.total.busy_percent(self.prev_total.as_ref()),
            per_core,
            process_percent,
            user_time: proc.utime as f64 / CLK_TCK as f64,
            system_time: proc.stime as f64 / CLK_TCK as f64,
            cores,
        };

        self.prev_total = Some(stat.total);
        self.prev_cores = stat.cores;
        self.prev_process_ticks = Some(process_ticks);
        self.last_cpu = Some(sample.clone());
        Ok(sample)
    }

    fn sample_memory(&mut self) -> Result<MemorySample, CollectError> {
        let info = self.system.collect_meminfo()?;
        let status_path = format!("{}/{}/status", self.system.proc_path(), self.pid);
        let status = self
            .system
            .fs()
            .read_to_string(std::path::Path::new(&status_path))
            .map_err(|_| CollectError::ProcessGone(self.pid))?;
        let status = parser::parse_proc_status(&status)?;

        let total = info.mem_total * 1024;
        let rss = status.vm_rss * 1024;
        Ok(MemorySample {
            rss,
            vms: status.vm_size * 1024,
            swap: status.vm_swap * 1024,
            percent: if total > 0 {
                rss as f64 / total as f64 * 100.0
            } else {
                0.0
            },
            total,
            free: info.mem_free * 1024,
            available: info.mem_available * 1024,
        })
    }

    fn sample_disk(&mut self, paths: &[PathBuf]) -> Result<DiskSample, CollectError> {
        let space = self.system.collect_disk_space(paths)?;
        let disks = self.system.collect_diskstats()?;

        let mut sample = DiskSample {
            used: space.used,
            total: space.total,
            free: space.free,
            ..Default::default()
        };
        for disk in &disks {
            sample.read_bytes += disk.read_sectors * SECTOR_SIZE;
            sample.write_bytes += disk.write_sectors * SECTOR_SIZE;
            sample.read_count += disk.reads;
            sample.write_count += disk.writes;
            sample.read_time += disk.read_time;
            sample.write_time += disk.write_time;
        }
        Ok(sample)
    }

    fn sample_network(&mut self, interfaces: &[String]) -> Result<NetworkSample, CollectError> {
        let devices = self.system.collect_net_dev(interfaces)?;
        Ok(devices
            .iter()
            .fold(NetworkSample::default(), |mut acc, dev| {
                acc.bytes_sent += dev.tx_bytes;
                acc.bytes_recv += dev.rx_bytes;
                acc.packets_sent += dev.tx_packets;
                acc.packets_recv += dev.rx_packets;
                acc.dropped += dev.rx_drop + dev.tx_drop;
                acc.errors += dev.rx_errs + dev.tx_errs;
                acc
            }))
    }
}
