//! Portable collectors built on `sysinfo`, used where `/proc` is absent.
//!
//! Coarser than the procfs path: descriptor counts are a fixed estimate,
//! children come from walking the process table, and neither thread counts
//! nor the user/kernel CPU split are available (both read as 0).

use std::path::PathBuf;

use parking_lot::Mutex;
use sysinfo::{Disks, Networks, Pid, Process, ProcessesToUpdate, System};

use crate::collector::source::{
    CollectError, CpuSample, DiskSample, MemorySample, MetricsSource, NetworkSample,
    ProcessDetails, ProcessInspector, ProcessSample, interface_selected,
};

/// Descriptor count reported when the OS offers no cheap way to count them.
pub const ESTIMATED_DESCRIPTORS: u32 = 32;

/// `MetricsSource` backed by `sysinfo`.
pub struct SysinfoSource {
    system: System,
    disks: Disks,
    networks: Networks,
    pid: Pid,
}

impl SysinfoSource {
    pub fn new(pid: u32) -> Self {
        Self {
            system: System::new(),
            disks: Disks::new_with_refreshed_list(),
            networks: Networks::new_with_refreshed_list(),
            pid: Pid::from_u32(pid),
        }
    }

    fn refresh_process(&mut self) -> Result<&Process, CollectError> {
        self.system
            .refresh_processes(ProcessesToUpdate::Some(&[self.pid]), true);
        self.system
            .process(self.pid)
            .ok_or(CollectError::ProcessGone(self.pid.as_u32()))
    }
}

impl MetricsSource for SysinfoSource {
    fn sample_cpu(&mut self) -> Result<CpuSample, CollectError> {
        self.system.refresh_cpu_usage();
        let system_percent = self.system.global_cpu_usage() as f64;
        let per_core: Vec<f64> = self
            .system
            .cpus()
            .iter()
            .map(|c| c.cpu_usage() as f64)
            .collect();
        let process_percent = self.refresh_process()?.cpu_usage() as f64;

        Ok(CpuSample {
            system_percent,
            cores: per_core.len().max(1),
            per_core,
            process_percent,
            user_time: 0.0,
            system_time: 0.0,
        })
    }

    fn sample_memory(&mut self) -> Result<MemorySample, CollectError> {
        self.system.refresh_memory();
        let total = self.system.total_memory();
        let free = self.system.free_memory();
        let available = self.system.available_memory();

        let process = self.refresh_process()?;
        let rss = process.memory();
        Ok(MemorySample {
            rss,
            vms: process.virtual_memory(),
            swap: 0,
            percent: if total > 0 {
                rss as f64 / total as f64 * 100.0
            } else {
                0.0
            },
            total,
            free,
            available,
        })
    }

    /// IO counters are the metered process's own totals; system-wide disk IO
    /// is not exposed portably.
    fn sample_disk(&mut self, paths: &[PathBuf]) -> Result<DiskSample, CollectError> {
        self.disks.refresh(true);
        let mut sample = DiskSample::default();
        for path in paths {
            let disk = self
                .disks
                .list()
                .iter()
                .filter(|d| path.starts_with(d.mount_point()))
                .max_by_key(|d| d.mount_point().components().count())
                .ok_or_else(|| {
                    CollectError::Io(std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        format!("no mounted disk holds {:?}", path),
                    ))
                })?;
            sample.total += disk.total_space();
            sample.free += disk.available_space();
            sample.used += disk.total_space().saturating_sub(disk.available_space());
        }

        let usage = self.refresh_process()?.disk_usage();
        sample.read_bytes = usage.total_read_bytes;
        sample.write_bytes = usage.total_written_bytes;
        Ok(sample)
    }

    fn sample_network(&mut self, interfaces: &[String]) -> Result<NetworkSample, CollectError> {
        self.networks.refresh(true);
        let mut sample = NetworkSample::default();
        for (name, data) in &self.networks {
            if !interface_selected(interfaces, name) {
                continue;
            }
            sample.bytes_sent += data.total_transmitted();
            sample.bytes_recv += data.total_received();
            sample.packets_sent += data.total_packets_transmitted();
            sample.packets_recv += data.total_packets_received();
            sample.errors += data.total_errors_on_received() + data.total_errors_on_transmitted();
        }
        Ok(sample)
    }
}

/// Process inspector walking a `sysinfo` process table snapshot.
pub struct SnapshotInspector {
    system: Mutex<System>,
}

impl Default for SnapshotInspector {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotInspector {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }

    fn with_process<T>(
        &self,
        pid: u32,
        f: impl FnOnce(&Process, Vec<u32>) -> T,
    ) -> Result<T, CollectError> {
        let mut system = self.system.lock();
        system.refresh_processes(ProcessesToUpdate::All, true);

        let target = Pid::from_u32(pid);
        let process = system
            .process(target)
            .ok_or(CollectError::ProcessGone(pid))?;
        let mut children: Vec<u32> = system
            .processes()
            .values()
            .filter(|p| p.parent() == Some(target))
            .map(|p| p.pid().as_u32())
            .collect();
        children.sort_unstable();
        Ok(f(process, children))
    }
}

fn status_of(process: &Process) -> String {
    process.status().to_string().to_lowercase()
}

impl ProcessInspector for SnapshotInspector {
    fn inspect(&self, pid: u32) -> Result<ProcessSample, CollectError> {
        self.with_process(pid, |process, children| ProcessSample {
            pid,
            name: process.name().to_string_lossy().into_owned(),
            status: status_of(process),
            create_time: process.start_time() as i64 * 1000,
            threads: 0,
            descriptors: ESTIMATED_DESCRIPTORS,
            children,
        })
    }

    fn details(&self, pid: u32) -> Result<ProcessDetails, CollectError> {
        self.with_process(pid, |process, children| ProcessDetails {
            pid,
            ppid: process.parent().map(|p| p.as_u32()).unwrap_or(0),
            name: process.name().to_string_lossy().into_owned(),
            cmdline: process
                .cmd()
                .iter()
                .map(|s| s.to_string_lossy().into_owned())
                .collect(),
            status: status_of(process),
            create_time: process.start_time() as i64 * 1000,
            threads: 0,
            descriptors: ESTIMATED_DESCRIPTORS,
            children,
            rss: process.memory(),
            vms: process.virtual_memory(),
            nice: 0,
            user_time: 0.0,
            system_time: 0.0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inspect_self() {
        let inspector = SnapshotInspector::new();
        let sample = inspector.inspect(std::process::id()).unwrap();

        assert_eq!(sample.pid, std::process::id());
        assert_eq!(sample.descriptors, ESTIMATED_DESCRIPTORS);
        assert_eq!(sample.threads, 0);
        assert!(sample.create_time > 0);
    }

    #[test]
    fn test_inspect_missing_process() {
        let inspector = SnapshotInspector::new();
        assert!(matches!(
            inspector.inspect(u32::MAX - 1),
            Err(CollectError::ProcessGone(_))
        ));
    }

    #[test]
    fn test_sysinfo_source_samples_self() {
        let mut source = SysinfoSource::new(std::process::id());
        let cpu = source.sample_cpu().unwrap();
        assert!(cpu.cores >= 1);
        assert_eq!(cpu.user_time, 0.0);

        let mem = source.sample_memory().unwrap();
        assert!(mem.rss > 0);
        assert!(mem.total >= mem.rss);

        source.sample_network(&[]).unwrap();
    }
}
