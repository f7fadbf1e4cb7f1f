//! OS and allocator tuning calls behind the manager's optimize operations.

use serde::Serialize;

use crate::error::{GovernError, Result};

/// Windows priority class an abstract priority maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityClass {
    Idle,
    BelowNormal,
    Normal,
    AboveNormal,
    High,
}

/// Buckets: `<= -15` idle, `<= -5` below normal, `< 5` normal,
/// `< 15` above normal, anything higher is high.
pub fn priority_class(priority: i32) -> PriorityClass {
    match priority {
        p if p <= -15 => PriorityClass::Idle,
        p if p <= -5 => PriorityClass::BelowNormal,
        p if p < 5 => PriorityClass::Normal,
        p if p < 15 => PriorityClass::AboveNormal,
        _ => PriorityClass::High,
    }
}

/// Sets the niceness of `pid` to `priority`.
#[cfg(unix)]
pub(crate) fn set_priority(pid: u32, priority: i32) -> Result<()> {
    // SAFETY: plain syscall, no pointers involved.
    let rc = unsafe { libc::setpriority(libc::PRIO_PROCESS, pid as libc::id_t, priority) };
    if rc == -1 {
        return Err(GovernError::Os {
            op: "setpriority",
            source: std::io::Error::last_os_error(),
        });
    }
    Ok(())
}

#[cfg(windows)]
pub(crate) fn set_priority(pid: u32, priority: i32) -> Result<()> {
    use windows_sys::Win32::Foundation::CloseHandle;
    use windows_sys::Win32::System::Threading::{
        ABOVE_NORMAL_PRIORITY_CLASS, BELOW_NORMAL_PRIORITY_CLASS, HIGH_PRIORITY_CLASS,
        IDLE_PRIORITY_CLASS, NORMAL_PRIORITY_CLASS, OpenProcess, PROCESS_SET_INFORMATION,
        SetPriorityClass,
    };

    let class = match priority_class(priority) {
        PriorityClass::Idle => IDLE_PRIORITY_CLASS,
        PriorityClass::BelowNormal => BELOW_NORMAL_PRIORITY_CLASS,
        PriorityClass::Normal => NORMAL_PRIORITY_CLASS,
        PriorityClass::AboveNormal => ABOVE_NORMAL_PRIORITY_CLASS,
        PriorityClass::High => HIGH_PRIORITY_CLASS,
    };

    // SAFETY: the handle is checked before use and closed exactly once.
    unsafe {
        let handle = OpenProcess(PROCESS_SET_INFORMATION, 0, pid);
        if handle.is_null() {
            return Err(GovernError::Os {
                op: "OpenProcess",
                source: std::io::Error::last_os_error(),
            });
        }
        let ok = SetPriorityClass(handle, class);
        let err = std::io::Error::last_os_error();
        CloseHandle(handle);
        if ok == 0 {
            return Err(GovernError::Os {
                op: "SetPriorityClass",
                source: err,
            });
        }
    }
    Ok(())
}

#[cfg(not(any(unix, windows)))]
pub(crate) fn set_priority(_pid: u32, _priority: i32) -> Result<()> {
    Err(GovernError::UnsupportedPlatform(
        std::env::consts::OS.to_string(),
    ))
}

/// Number of cores the process may run on.
pub fn available_cores() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Allocator counters, in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AllocatorStats {
    pub allocated: u64,
    pub resident: u64,
    pub retained: u64,
}

#[cfg(all(feature = "jemalloc", not(target_env = "msvc")))]
mod jemalloc {
    use std::ffi::{CStr, c_void};
    use std::ptr;

    use super::AllocatorStats;

    /// Purges dirty pages from every arena (`MALLCTL_ARENAS_ALL` = 4096).
    pub(super) fn purge() -> bool {
        // SAFETY: write-only control call with no old/new values.
        unsafe {
            tikv_jemalloc_sys::mallctl(
                c"arena.4096.purge".as_ptr().cast(),
                ptr::null_mut(),
                ptr::null_mut(),
                ptr::null_mut(),
                0,
            ) == 0
        }
    }

    fn read_size(name: &CStr) -> Option<u64> {
        let mut value: usize = 0;
        let mut len = std::mem::size_of::<usize>();
        // SAFETY: `value` and `len` describe a valid size_t out-parameter.
        let rc = unsafe {
            tikv_jemalloc_sys::mallctl(
                name.as_ptr().cast(),
                (&mut value as *mut usize).cast::<c_void>(),
                &mut len,
                ptr::null_mut(),
                0,
            )
        };
        (rc == 0).then_some(value as u64)
    }

    pub(super) fn stats() -> Option<AllocatorStats> {
        // Stats are cached until the epoch is bumped.
        let mut epoch: u64 = 1;
        // SAFETY: `epoch` is a valid u64 new-value buffer.
        unsafe {
            tikv_jemalloc_sys::mallctl(
                c"epoch".as_ptr().cast(),
                ptr::null_mut(),
                ptr::null_mut(),
                (&mut epoch as *mut u64).cast::<c_void>(),
                std::mem::size_of::<u64>(),
            );
        }
        Some(AllocatorStats {
            allocated: read_size(c"stats.allocated")?,
            resident: read_size(c"stats.resident")?,
            retained: read_size(c"stats.retained")?,
        })
    }
}

/// Returns unused allocator memory to the OS. False when the allocator
/// offers no way to do so.
pub fn release_memory_to_os() -> bool {
    #[cfg(all(feature = "jemalloc", not(target_env = "msvc")))]
    {
        jemalloc::purge()
    }
    #[cfg(not(all(feature = "jemalloc", not(target_env = "msvc"))))]
    {
        false
    }
}

pub fn allocator_stats() -> Option<AllocatorStats> {
    #[cfg(all(feature = "jemalloc", not(target_env = "msvc")))]
    {
        jemalloc::stats()
    }
    #[cfg(not(all(feature = "jemalloc", not(target_env = "msvc"))))]
    {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_buckets() {
        assert_eq!(priority_class(-20), PriorityClass::Idle);
        assert_eq!(priority_class(-15), PriorityClass::Idle);
        assert_eq!(priority_class(-14), PriorityClass::BelowNormal);
        assert_eq!(priority_class(-5), PriorityClass::BelowNormal);
        assert_eq!(priority_class(-4), PriorityClass::Normal);
        assert_eq!(priority_class(0), PriorityClass::Normal);
        assert_eq!(priority_class(4), PriorityClass::Normal);
        assert_eq!(priority_class(5), PriorityClass::AboveNormal);
        assert_eq!(priority_class(14), PriorityClass::AboveNormal);
        assert_eq!(priority_class(15), PriorityClass::High);
        assert_eq!(priority_class(i32::MAX), PriorityClass::High);
    }

    #[test]
    fn test_available_cores_positive() {
        assert!(available_cores() >= 1);
    }

    #[cfg(unix)]
    #[test]
    fn test_set_priority_unknown_pid_fails() {
        // pid 0 means "self" to setpriority; use one that cannot exist
        let err = set_priority(u32::MAX / 2, 0).unwrap_err();
        assert!(matches!(err, GovernError::Os { op: "setpriority", .. }));
    }

    #[cfg(all(feature = "jemalloc", not(target_env = "msvc")))]
    #[test]
    fn test_allocator_stats_available() {
        assert!(allocator_stats().is_some());
    }
}
