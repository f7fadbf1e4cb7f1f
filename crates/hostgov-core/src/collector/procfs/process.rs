//! Process inspector for gathering per-process facts from `/proc/[pid]/`.

use std::io;
use std::path::Path;

use tracing::debug;

use crate::collector::procfs::parser::{ProcStat, ProcStatus, parse_global_stat, parse_proc_stat, parse_proc_status};
use crate::collector::source::{CollectError, ProcessDetails, ProcessInspector, ProcessSample};
use crate::collector::traits::FileSystem;

/// Clock ticks per second (USER_HZ). Standard value for Linux.
pub const CLK_TCK: u64 = 100;

/// Page size used to convert `rss` pages into bytes.
pub const PAGE_SIZE: u64 = 4096;

/// Reads and parses `/proc/[pid]/stat`. A missing file means the process is gone.
pub(crate) fn read_proc_stat<F: FileSystem>(
    fs: &F,
    proc_path: &str,
    pid: u32,
) -> Result<ProcStat, CollectError> {
    let path = format!("{}/{}/stat", proc_path, pid);
    let content = fs
        .read_to_string(Path::new(&path))
        .map_err(|_| CollectError::ProcessGone(pid))?;
    Ok(parse_proc_stat(&content)?)
}

/// Maps the single-letter state from `stat` to a readable status.
pub fn state_name(state: char) -> &'static str {
    match state {
        'R' => "running",
        'S' => "sleeping",
        'D' => "disk-sleep",
        'Z' => "zombie",
        'T' => "stopped",
        't' => "tracing-stop",
        'X' | 'x' => "dead",
        'I' => "idle",
        'W' => "paging",
        'P' => "parked",
        _ => "unknown",
    }
}

/// Inspects processes through `/proc`.
#[derive(Debug, Clone)]
pub struct ProcfsInspector<F: FileSystem> {
    fs: F,
    proc_path: String,
}

impl<F: FileSystem> ProcfsInspector<F> {
    /// Creates a new inspector.
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

    fn read_status(&self, pid: u32) -> Result<ProcStatus, CollectError> {
        let path = format!("{}/{}/status", self.proc_path, pid);
        let content = self
            .fs
            .read_to_string(Path::new(&path))
            .map_err(|_| CollectError::ProcessGone(pid))?;
        Ok(parse_proc_status(&content)?)
    }

    /// Boot time in seconds since epoch, or 0 when `/proc/stat` is unreadable.
    fn boot_time(&self) -> u64 {
        let path = format!("{}/stat", self.proc_path);
        self.fs
            .read_to_string(Path::new(&path))
            .ok()
            .and_then(|c| parse_global_stat(&c).ok())
            .map(|s| s.btime)
            .unwrap_or(0)
    }

    /// Process start time in unix milliseconds.
    ///
    /// Formula: boot_time + starttime_jiffies / CLK_TCK. Returns 0 when the
    /// boot time is unknown.
    fn create_time_ms(&self, starttime: u64) -> i64 {
        let boot = self.boot_time();
        if boot == 0 {
            return 0;
        }
        (boot * 1000 + starttime * 1000 / CLK_TCK) as i64
    }

    /// Counts entries under `/proc/[pid]/fd`.
    ///
    /// The directory of another user's process is unreadable without
    /// privileges; that case counts as zero instead of failing the update.
    pub fn descriptor_count(&self, pid: u32) -> Result<u32, CollectError> {
        let path = format!("{}/{}/fd", self.proc_path, pid);
        match self.fs.read_dir(Path::new(&path)) {
            Ok(entries) => Ok(entries.len() as u32),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(CollectError::ProcessGone(pid)),
            Err(e) => {
                debug!(pid, error = %e, "fd directory unreadable");
                Ok(0)
            }
        }
    }

    /// Lists PIDs whose parent is `pid`, ascending.
    ///
    /// Processes that disappear during the scan are skipped.
    pub fn children(&self, pid: u32) -> Result<Vec<u32>, CollectError> {
        let entries = self.fs.read_dir(Path::new(&self.proc_path))?;

        let mut children: Vec<u32> = entries
            .iter()
            .filter_map(|entry| entry.file_name()?.to_str()?.parse::<u32>().ok())
            .filter(|&candidate| candidate != pid)
            .filter_map(|candidate| read_proc_stat(&self.fs, &self.proc_path, candidate).ok())
            .filter(|stat| stat.ppid == pid)
            .map(|stat| stat.pid)
            .collect();
        children.sort_unstable();
        Ok(children)
    }

    fn cmdline(&self, pid: u32) -> Vec<String> {
        let path = format!("{}/{}/cmdline", self.proc_path, pid);
        self.fs
            .read_to_string(Path::new(&path))
            .unwrap_or_default()
            .split('\0')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }
}

impl<F: FileSystem> ProcessInspector for ProcfsInspector<F> {
    fn inspect(&self, pid: u32) -> Result<ProcessSample, CollectError> {
        let stat = read_proc_stat(&self.fs, &self.proc_path, pid)?;
        let status = self.read_status(pid)?;

        Ok(ProcessSample {
            pid,
            name: status.name,
            status: state_name(stat.state).to_string(),
            create_time: self.create_time_ms(stat.starttime),
            threads: stat.num_threads.max(0) as u32,
            descriptors: self.descriptor_count(pid)?,
            children: self.children(pid)?,
        })
    }

    fn details(&self, pid: u32) -> Result<ProcessDetails, CollectError> {
        let stat = read_proc_stat(&self.fs, &self.proc_path, pid)?;
        let status = self.read_status(pid)?;

        Ok(ProcessDetails {
            pid,
            ppid: stat.ppid,
            name: status.name,
            cmdline: self.cmdline(pid),
            status: state_name(stat.state).to_string(),
            create_time: self.create_time_ms(stat.starttime),
            threads: stat.num_threads.max(0) as u32,
            descriptors: self.descriptor_count(pid)?,
            children: self.children(pid)?,
            rss: stat.rss.max(0) as u64 * PAGE_SIZE,
            vms: stat.vsize,
            nice: stat.nice,
            user_time: stat.utime as f64 / CLK_TCK as f64,
            system_time: stat.stime as f64 / CLK_TCK as f64,
        })
    }
}
