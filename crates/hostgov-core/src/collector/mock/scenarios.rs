//! Pre-built mock filesystem scenarios for testing.
//!
//! `typical_system()` is a quiet four-core host running the metered daemon
//! (PID 1000) with two worker children. `busy_system()` is the same host a
//! few seconds later under load, so sampling one after the other yields
//! known rates.

use super::filesystem::MockFs;

/// PID of the metered process in the scenarios.
pub const DAEMON_PID: u32 = 1000;

const GIB: u64 = 1024 * 1024 * 1024;

/// Builds a `/proc/[pid]/stat` line with the fields the collectors read.
#[allow(clippy::too_many_arguments)]
fn stat_line(
    pid: u32,
    comm: &str,
    state: char,
    ppid: u32,
    utime: u64,
    stime: u64,
    threads: u32,
    starttime: u64,
    vsize: u64,
    rss_pages: u64,
) -> String {
    format!(
        "{pid} ({comm}) {state} {ppid} {pid} {pid} 0 -1 4194304 5000 0 0 0 {utime} {stime} 0 0 20 0 {threads} 0 {starttime} {vsize} {rss_pages} 18446744073709551615 0 0 0 0 0 0 0 0 0 0 0 0 17 0 0 0 0 0 0 0 0 0 0 0 0 0 0"
    )
}

fn status_text(name: &str, pid: u32, ppid: u32, threads: u32, vm_size_kb: u64, rss_kb: u64) -> String {
    format!(
        "Name:\t{name}\nState:\tS (sleeping)\nPid:\t{pid}\nPPid:\t{ppid}\nThreads:\t{threads}\nVmSize:\t{vm_size_kb} kB\nVmRSS:\t{rss_kb} kB\nVmSwap:\t0 kB\n"
    )
}

impl MockFs {
    /// Creates a typical system with a few processes.
    ///
    /// Includes: init (PID 1), the daemon (PID 1000) and its workers
    /// (PIDs 1001 and 1002). Mounts: `/` (100 GiB, 40 used) and `/data`
    /// (400 GiB, 100 used).
    pub fn typical_system() -> Self {
        let mut fs = Self::new();

        fs.add_file(
            "/proc/meminfo",
            "\
MemTotal:       16384000 kB
MemFree:         8192000 kB
MemAvailable:   12000000 kB
Buffers:          512000 kB
Cached:          2048000 kB
SwapTotal:       4096000 kB
SwapFree:        4096000 kB
",
        );
        fs.add_file(
            "/proc/stat",
            "\
cpu  10000 500 3000 80000 1000 200 100 0 0 0
cpu0 2500 125 750 20000 250 50 25 0 0 0
cpu1 2500 125 750 20000 250 50 25 0 0 0
cpu2 2500 125 750 20000 250 50 25 0 0 0
cpu3 2500 125 750 20000 250 50 25 0 0 0
ctxt 500000
btime 1700000000
processes 10000
",
        );
        fs.add_file(
            "/proc/diskstats",
            "\
   8       0 sda 12345 100 987654 5000 6789 50 456789 3000 0 4000 8000 0 0 0 0
   8       1 sda1 10000 80 800000 4000 5000 40 400000 2500 0 3500 6500 0 0 0 0
 259       0 nvme0n1 50000 200 2000000 10000 30000 150 1500000 8000 5 15000 18000 0 0 0 0
",
        );
        fs.add_file(
            "/proc/net/dev",
            "\
Inter-|   Receive                                                |  Transmit
 face |bytes    packets errs drop fifo frame compressed multicast|bytes    packets errs drop fifo colls carrier compressed
    lo: 12345678     9876    0    0    0     0          0         0 12345678     9876    0    0    0     0       0          0
  eth0: 987654321   654321    5   10    0     0          0       100 123456789   456789    2    5    0     0       0          0
",
        );

        fs.add_mount("/", 100 * GIB, 40 * GIB);
        fs.add_mount("/data", 400 * GIB, 100 * GIB);

        fs.add_process(
            1,
            &stat_line(1, "systemd", 'S', 0, 1000, 500, 1, 1, 170000000, 3000),
            &status_text("systemd", 1, 0, 1, 166015, 12000),
            "/sbin/init\0",
            40,
        );
        fs.add_process(
            DAEMON_PID,
            &stat_line(DAEMON_PID, "hostgovd", 'S', 1, 100, 50, 4, 100000, 25000000, 2000),
            &status_text("hostgovd", DAEMON_PID, 1, 4, 24414, 8000),
            "/usr/bin/hostgovd\0--interval\x005s\0",
            6,
        );
        for pid in [1001, 1002] {
            fs.add_process(
                pid,
                &stat_line(pid, "worker", 'S', DAEMON_PID, 10, 5, 1, 100500, 10000000, 500),
                &status_text("worker", pid, DAEMON_PID, 1, 9765, 2000),
                "worker\0",
                2,
            );
        }

        fs
    }

    /// Creates the typical system after a burst of load.
    ///
    /// Relative to `typical_system()`: the system CPU moved 1000 ticks of
    /// which 100 idle (90% busy), the daemon burned 150 ticks (60% of one
    /// core over the 250-tick interval) and its RSS grew to 64 MB.
    pub fn busy_system() -> Self {
        let mut fs = Self::typical_system();
        fs.apply_busy_load();
        fs
    }

    /// Rewrites the changing files of `typical_system()` to the busy state.
    pub fn apply_busy_load(&mut self) {
        self.set_file(
            "/proc/stat",
            "\
cpu  10600 500 3300 80100 1000 200 100 0 0 0
cpu0 2650 125 825 20025 250 50 25 0 0 0
cpu1 2650 125 825 20025 250 50 25 0 0 0
cpu2 2650 125 825 20025 250 50 25 0 0 0
cpu3 2650 125 825 20025 250 50 25 0 0 0
ctxt 900000
btime 1700000000
processes 10100
",
        );
        self.set_file(
            "/proc/meminfo",
            "\
MemTotal:       16384000 kB
MemFree:         2048000 kB
MemAvailable:    4096000 kB
Buffers:          512000 kB
Cached:          2048000 kB
SwapTotal:       4096000 kB
SwapFree:        3072000 kB
",
        );
        self.set_file(
            "/proc/diskstats",
            "\
   8       0 sda 12445 100 997654 5100 6889 50 466789 3100 0 4100 8100 0 0 0 0
   8       1 sda1 10100 80 810000 4100 5100 40 410000 2600 0 3600 6600 0 0 0 0
 259       0 nvme0n1 50000 200 2000000 10000 30000 150 1500000 8000 5 15000 18000 0 0 0 0
",
        );
        self.set_file(
            "/proc/net/dev",
            "\
Inter-|   Receive                                                |  Transmit
 face |bytes    packets errs drop fifo frame compressed multicast|bytes    packets errs drop fifo colls carrier compressed
    lo: 12345678     9876    0    0    0     0          0         0 12345678     9876    0    0    0     0       0          0
  eth0: 997654321   664321    5   10    0     0          0       100 128456789   461789    2    5    0     0       0          0
",
        );
        self.set_file(
            "/proc/1000/stat",
            stat_line(DAEMON_PID, "hostgovd", 'R', 1, 200, 100, 6, 100000, 90000000, 16000),
        );
        self.set_file(
            "/proc/1000/status",
            status_text("hostgovd", DAEMON_PID, 1, 6, 87890, 64000),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::traits::FileSystem;
    use std::path::Path;

    #[test]
    fn test_typical_system_has_required_files() {
        let fs = MockFs::typical_system();

        assert!(fs.exists(Path::new("/proc/meminfo")));
        assert!(fs.exists(Path::new("/proc/stat")));
        assert!(fs.exists(Path::new("/proc/diskstats")));
        assert!(fs.exists(Path::new("/proc/net/dev")));
        for pid in [1, 1000, 1001, 1002] {
            assert!(fs.exists(Path::new(&format!("/proc/{}/stat", pid))));
        }
        assert_eq!(fs.disk_space(Path::new("/")).unwrap().total, 100 * GIB);
    }

    #[test]
    fn test_busy_system_changes_daemon_state() {
        let fs = MockFs::busy_system();
        let stat = fs.read_to_string(Path::new("/proc/1000/stat")).unwrap();
        assert!(stat.contains("(hostgovd) R "));

        let meminfo = fs.read_to_string(Path::new("/proc/meminfo")).unwrap();
        assert!(meminfo.contains("MemFree:         2048000 kB"));
    }

    #[test]
    fn test_stat_line_round_trips_through_parser() {
        use crate::collector::procfs::parser::parse_proc_stat;

        let line = stat_line(42, "a b", 'S', 7, 11, 22, 3, 99, 1234, 56);
        let stat = parse_proc_stat(&line).unwrap();
        assert_eq!(stat.comm, "a b");
        assert_eq!(stat.ppid, 7);
        assert_eq!(stat.utime, 11);
        assert_eq!(stat.stime, 22);
        assert_eq!(stat.num_threads, 3);
        assert_eq!(stat.starttime, 99);
        assert_eq!(stat.vsize, 1234);
        assert_eq!(stat.rss, 56);
    }
}
