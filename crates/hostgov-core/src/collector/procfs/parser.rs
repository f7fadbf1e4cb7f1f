//! Parsers for `/proc` filesystem files.
//!
//! Pure functions from file content to structured data, so every format quirk
//! is testable with plain string inputs.

use std::collections::HashMap;

/// Error type for parsing failures.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("parse error: {message}")]
pub struct ParseError {
    pub message: String,
}

impl ParseError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self {
            message: msg.into(),
        }
    }
}

/// Fields of `/proc/[pid]/stat` used for metering.
#[derive(Debug, Clone, Default)]
pub struct ProcStat {
    pub pid: u32,
    pub comm: String,
    pub state: char,
    pub ppid: u32,
    /// User mode time in clock ticks.
    pub utime: u64,
    /// Kernel mode time in clock ticks.
    pub stime: u64,
    pub nice: i32,
    pub num_threads: i32,
    /// Start time after boot in clock ticks.
    pub starttime: u64,
    /// Virtual memory size in bytes.
    pub vsize: u64,
    /// Resident set size in pages.
    pub rss: i64,
}

/// Parses `/proc/[pid]/stat` content.
///
/// The comm field can contain spaces and parentheses, so it is delimited by
/// the first `(` and the last `)`.
/// Format: pid (comm) state ppid pgrp session tty_nr ...
pub fn parse_proc_stat(content: &str) -> Result<ProcStat, ParseError> {
    let content = content.trim();

    let open_paren = content
        .find('(')
        .ok_or_else(|| ParseError::new("missing '(' in stat"))?;
    let close_paren = content
        .rfind(')')
        .ok_or_else(|| ParseError::new("missing ')' in stat"))?;
    if close_paren <= open_paren {
        return Err(ParseError::new("invalid parentheses in stat"));
    }

    let pid: u32 = content[..open_paren]
        .trim()
        .parse()
        .map_err(|_| ParseError::new("invalid pid"))?;
    let comm = content[open_paren + 1..close_paren].to_string();

    // Field indexes below are relative to the first field after comm.
    let fields: Vec<&str> = content[close_paren + 1..].split_whitespace().collect();
    if fields.len() < 22 {
        return Err(ParseError::new(format!(
            "not enough fields in stat: expected 22+, got {}",
            fields.len()
        )));
    }

    fn field<T: std::str::FromStr>(fields: &[&str], idx: usize, name: &str) -> Result<T, ParseError> {
        fields[idx]
            .parse()
            .map_err(|_| ParseError::new(format!("invalid {}", name)))
    }

    Ok(ProcStat {
        pid,
        comm,
        state: fields[0].chars().next().unwrap_or('?'),
        ppid: field(&fields, 1, "ppid")?,
        utime: field(&fields, 11, "utime")?,
        stime: field(&fields, 12, "stime")?,
        nice: field(&fields, 16, "nice")?,
        num_threads: field(&fields, 17, "num_threads")?,
        starttime: field(&fields, 19, "starttime")?,
        vsize: field(&fields, 20, "vsize")?,
        rss: field(&fields, 21, "rss")?,
    })
}

/// Fields of `/proc/[pid]/status` used for metering. Sizes are in kB.
#[derive(Debug, Clone, Default)]
pub struct ProcStatus {
    pub name: String,
    pub pid: u32,
    pub ppid: u32,
    pub threads: u32,
    pub vm_size: u64,
    pub vm_rss: u64,
    pub vm_swap: u64,
}

/// Parses `/proc/[pid]/status` content (`key:\tvalue` lines).
pub fn parse_proc_status(content: &str) -> Result<ProcStatus, ParseError> {
    let fields: HashMap<&str, &str> = content
        .lines()
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.trim(), v.trim()))
        .collect();

    if !fields.contains_key("Name") {
        return Err(ParseError::new("missing Name in status"));
    }

    let number = |key: &str| -> u64 {
        fields
            .get(key)
            .and_then(|s| s.split_whitespace().next())
            .and_then(|s| s.parse().ok())
            .unwrap_or(0)
    };

    Ok(ProcStatus {
        name: fields.get("Name").unwrap_or(&"").to_string(),
        pid: number("Pid") as u32,
        ppid: number("PPid") as u32,
        threads: number("Threads") as u32,
        vm_size: number("VmSize"),
        vm_rss: number("VmRSS"),
        vm_swap: number("VmSwap"),
    })
}

/// Parsed data from `/proc/meminfo`, in kB.
#[derive(Debug, Clone, Default)]
pub struct MemInfo {
    pub mem_total: u64,
    pub mem_free: u64,
    pub mem_available: u64,
    pub swap_total: u64,
    pub swap_free: u64,
}

/// Parses `/proc/meminfo` content.
pub fn parse_meminfo(content: &str) -> Result<MemInfo, ParseError> {
    let mut info = MemInfo::default();
    for line in content.lines() {
        let mut parts = line.split_whitespace();
        let (Some(key), Some(value)) = (parts.next(), parts.next()) else {
            continue;
        };
        let value: u64 = value.parse().unwrap_or(0);
        match key {
            "MemTotal:" => info.mem_total = value,
            "MemFree:" => info.mem_free = value,
            "MemAvailable:" => info.mem_available = value,
            "SwapTotal:" => info.swap_total = value,
            "SwapFree:" => info.swap_free = value,
            _ => {}
        }
    }
    if info.mem_total == 0 {
        return Err(ParseError::new("MemTotal missing from meminfo"));
    }
    Ok(info)
}

/// Single CPU line from `/proc/stat`, in clock ticks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuStat {
    pub cpu_id: Option<u32>, // None for aggregate "cpu" line
    pub user: u64,
    pub nice: u64,
    pub system: u64,
    pub idle: u64,
    pub iowait: u64,
    pub irq: u64,
    pub softirq: u64,
    pub steal: u64,
}

impl CpuStat {
    /// Ticks spent idle (idle + iowait).
    pub fn idle_ticks(&self) -> u64 {
        self.idle + self.iowait
    }

    pub fn total_ticks(&self) -> u64 {
        self.user + self.nice + self.system + self.idle + self.iowait + self.irq + self.softirq + self.steal
    }

    /// Busy percentage relative to an earlier reading, or since boot when
    /// `prev` is `None`.
    pub fn busy_percent(&self, prev: Option<&CpuStat>) -> f64 {
        let (total, idle) = match prev {
            Some(p) => (
                self.total_ticks().saturating_sub(p.total_ticks()),
                self.idle_ticks().saturating_sub(p.idle_ticks()),
            ),
            None => (self.total_ticks(), self.idle_ticks()),
        };
        if total == 0 {
            return 0.0;
        }
        (total.saturating_sub(idle)) as f64 / total as f64 * 100.0
    }
}

/// Global stats from `/proc/stat`.
#[derive(Debug, Clone, Default)]
pub struct GlobalStat {
    /// Aggregate line.
    pub total: CpuStat,
    /// Per-core lines in file order.
    pub cores: Vec<CpuStat>,
    /// Boot time in seconds since epoch.
    pub btime: u64,
}

/// Parses `/proc/stat` content.
pub fn parse_global_stat(content: &str) -> Result<GlobalStat, ParseError> {
    let mut stat = GlobalStat::default();
    let mut seen_total = false;

    for line in content.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        let Some(&head) = parts.first() else {
            continue;
        };
        let get_val = |idx: usize| -> u64 { parts.get(idx).and_then(|s| s.parse().ok()).unwrap_or(0) };

        if let Some(id) = head.strip_prefix("cpu") {
            let cpu = CpuStat {
                cpu_id: id.parse().ok(),
                user: get_val(1),
                nice: get_val(2),
                system: get_val(3),
                idle: get_val(4),
                iowait: get_val(5),
                irq: get_val(6),
                softirq: get_val(7),
                steal: get_val(8),
            };
            if id.is_empty() {
                stat.total = cpu;
                seen_total = true;
            } else {
                stat.cores.push(cpu);
            }
        } else if head == "btime" {
            stat.btime = get_val(1);
        }
    }

    if !seen_total {
        return Err(ParseError::new("aggregate cpu line missing from stat"));
    }
    Ok(stat)
}

/// Parsed data from `/proc/diskstats`.
#[derive(Debug, Clone, Default)]
pub struct DiskStats {
    pub major: u32,
    pub minor: u32,
    /// Device name (sda, nvme0n1, etc.)
    pub device: String,
    pub reads: u64,
    pub read_sectors: u64,
    /// Time spent reading (ms)
    pub read_time: u64,
    pub writes: u64,
    pub write_sectors: u64,
    /// Time spent writing (ms)
    pub write_time: u64,
}

/// Parses `/proc/diskstats` content.
///
/// Format: major minor name reads r_merged r_sectors r_time writes w_merged w_sectors w_time ...
/// Lines with fewer than 14 columns are skipped.
pub fn parse_diskstats(content: &str) -> Result<Vec<DiskStats>, ParseError> {
    let disks = content
        .lines()
        .map(|line| line.split_whitespace().collect::<Vec<_>>())
        .filter(|parts| parts.len() >= 14)
        .map(|parts| {
            let get_val = |idx: usize| -> u64 { parts[idx].parse().unwrap_or(0) };
            DiskStats {
                major: parts[0].parse().unwrap_or(0),
                minor: parts[1].parse().unwrap_or(0),
                device: parts[2].to_string(),
                reads: get_val(3),
                read_sectors: get_val(5),
                read_time: get_val(6),
                writes: get_val(7),
                write_sectors: get_val(9),
                write_time: get_val(10),
            }
        })
        .collect();
    Ok(disks)
}

/// Returns true for whole-disk devices that should be counted in IO totals.
///
/// Partitions are skipped to avoid counting the same IO twice, and virtual
/// devices (loop, ram, device-mapper) are skipped because their IO is
/// already accounted on the backing device.
pub fn is_physical_disk(name: &str) -> bool {
    if name.starts_with("loop") || name.starts_with("ram") || name.starts_with("dm-") {
        return false;
    }
    if name.starts_with("nvme") || name.starts_with("mmcblk") {
        // nvme0n1 is a disk, nvme0n1p1 is a partition.
        return !name.contains('p');
    }
    !name.ends_with(|c: char| c.is_ascii_digit())
}

/// Parsed data from `/proc/net/dev`.
#[derive(Debug, Clone, Default)]
pub struct NetDevStats {
    pub interface: String,
    pub rx_bytes: u64,
    pub rx_packets: u64,
    pub rx_errs: u64,
    pub rx_drop: u64,
    pub tx_bytes: u64,
    pub tx_packets: u64,
    pub tx_errs: u64,
    pub tx_drop: u64,
}

/// Parses `/proc/net/dev` content.
///
/// The two header lines contain `|` and are skipped. Each data line is
/// `iface: rx_bytes rx_packets rx_errs rx_drop fifo frame compressed multicast tx_bytes tx_packets tx_errs tx_drop ...`.
pub fn parse_net_dev(content: &str) -> Result<Vec<NetDevStats>, ParseError> {
    let mut devices = Vec::new();

    for line in content.lines() {
        if line.contains('|') || line.trim().is_empty() {
            continue;
        }
        let Some((iface, rest)) = line.split_once(':') else {
            continue;
        };
        let values: Vec<u64> = rest
            .split_whitespace()
            .map(|s| s.parse().unwrap_or(0))
            .collect();
        if values.len() < 16 {
            continue;
        }

        devices.push(NetDevStats {
            interface: iface.trim().to_string(),
            rx_bytes: values[0],
            rx_packets: values[1],
            rx_errs: values[2],
            rx_drop: values[3],
            tx_bytes: values[8],
            tx_packets: values[9],
            tx_errs: values[10],
            tx_drop: values[11],
        });
    }

    Ok(devices)
}
