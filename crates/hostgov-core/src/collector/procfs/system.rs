//! System collector for gathering global metrics from `/proc/` and `statvfs`.

use std::path::{Path, PathBuf};

use crate::collector::procfs::parser::{
    DiskStats, GlobalStat, MemInfo, NetDevStats, is_physical_disk, parse_diskstats,
    parse_global_stat, parse_meminfo, parse_net_dev,
};
use crate::collector::source::{CollectError, interface_selected};
use crate::collector::traits::{DiskSpace, FileSystem};

/// Collects system-wide metrics from `/proc/`.
#[derive(Debug, Clone)]
pub struct SystemCollector<F: FileSystem> {
    fs: F,
    proc_path: String,
}

impl<F: FileSystem> SystemCollector<F> {
    /// Creates a new system collector.
    ///
    /// # Arguments
    /// * `fs` - Filesystem implementation (real or mock)
    /// * `proc_path` - Base path to proc filesystem (usually "/proc")
    pub fn new(fs: F, proc_path: impl Into<String>) -> Self {
        Self {
            fs,
            proc_path: proc_path.into(),
        }
    }

    pub fn fs(&self) -> &F {
        &self.fs
    }

    pub fn fs_mut(&mut self) -> &mut F {
        &mut self.fs
    }

    pub fn proc_path(&self) -> &str {
        &self.proc_path
    }

    fn read(&self, rel: &str) -> Result<String, CollectError> {
        let path = format!("{}/{}", self.proc_path, rel);
        Ok(self.fs.read_to_string(Path::new(&path))?)
    }

    /// Collects memory information from `/proc/meminfo` (values in kB).
    pub fn collect_meminfo(&self) -> Result<MemInfo, CollectError> {
        Ok(parse_meminfo(&self.read("meminfo")?)?)
    }

    /// Collects CPU counters and boot time from `/proc/stat`.
    pub fn collect_stat(&self) -> Result<GlobalStat, CollectError> {
        Ok(parse_global_stat(&self.read("stat")?)?)
    }

    /// Collects IO counters of physical disks from `/proc/diskstats`.
    pub fn collect_diskstats(&self) -> Result<Vec<DiskStats>, CollectError> {
        let disks = parse_diskstats(&self.read("diskstats")?)?;
        Ok(disks
            .into_iter()
            .filter(|d| is_physical_disk(&d.device))
            .collect())
    }

    /// Collects interface counters from `/proc/net/dev`, keeping the
    /// interfaces accepted by `filter` (empty accepts all).
    pub fn collect_net_dev(&self, filter: &[String]) -> Result<Vec<NetDevStats>, CollectError> {
        let devices = parse_net_dev(&self.read("net/dev")?)?;
        Ok(devices
            .into_iter()
            .filter(|d| interface_selected(filter, &d.interface))
            .collect())
    }

    /// Sums filesystem capacity over `paths`.
    pub fn collect_disk_space(&self, paths: &[PathBuf]) -> Result<DiskSpace, CollectError> {
        let mut sum = DiskSpace::default();
        for path in paths {
            let space = self.fs.disk_space(path)?;
            sum.total += space.total;
            sum.used += space.used;
            sum.free += space.free;
        }
        Ok(sum)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::mock::MockFs;

    #[test]
    fn test_collect_meminfo() {
        let collector = SystemCollector::new(MockFs::typical_system(), "/proc");
        let info = collector.collect_meminfo().unwrap();
        assert_eq!(info.mem_total, 16384000);
        assert_eq!(info.mem_available, 12000000);
    }

    #[test]
    fn test_collect_stat() {
        let collector = SystemCollector::new(MockFs::typical_system(), "/proc");
        let stat = collector.collect_stat().unwrap();
        assert_eq!(stat.cores.len(), 4);
        assert_eq!(stat.btime, 1700000000);
    }

    #[test]
    fn test_collect_diskstats_skips_partitions() {
        let collector = SystemCollector::new(MockFs::typical_system(), "/proc");
        let disks = collector.collect_diskstats().unwrap();
        let names: Vec<_> = disks.iter().map(|d| d.device.as_str()).collect();
        assert_eq!(names, vec!["sda", "nvme0n1"]);
    }

    #[test]
    fn test_collect_net_dev_filter() {
        let collector = SystemCollector::new(MockFs::typical_system(), "/proc");
        assert_eq!(collector.collect_net_dev(&[]).unwrap().len(), 2);

        let only_eth = collector.collect_net_dev(&["eth0".to_string()]).unwrap();
        assert_eq!(only_eth.len(), 1);
        assert_eq!(only_eth[0].interface, "eth0");

        let unknown = collector.collect_net_dev(&["wlan9".to_string()]).unwrap();
        assert!(unknown.is_empty());
    }

    #[test]
    fn test_collect_disk_space_sums_paths() {
        let collector = SystemCollector::new(MockFs::typical_system(), "/proc");
        let space = collector
            .collect_disk_space(&[PathBuf::from("/"), PathBuf::from("/data")])
            .unwrap();
        assert_eq!(space.total, 100 * GIB + 400 * GIB);
        assert_eq!(space.used, 40 * GIB + 100 * GIB);
    }

    #[test]
    fn test_missing_files_error() {
        let collector = SystemCollector::new(MockFs::new(), "/proc");
        assert!(matches!(
            collector.collect_meminfo(),
            Err(CollectError::Io(_))
        ));
        assert!(collector.collect_disk_space(&[PathBuf::from("/")]).is_err());
    }

    const GIB: u64 = 1024 * 1024 * 1024;
}
