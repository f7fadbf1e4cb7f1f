//! Abstractions for filesystem access to enable testing and mocking.
//!
//! The `FileSystem` trait allows the procfs collectors to work with both the
//! real `/proc` filesystem on Linux and the in-memory `MockFs` used in tests.

use std::io;
use std::path::{Path, PathBuf};

/// Capacity of the filesystem holding a path, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DiskSpace {
    pub total: u64,
    pub used: u64,
    pub free: u64,
}

/// Abstraction for filesystem operations.
pub trait FileSystem: Send + Sync {
    /// Reads the entire contents of a file as a string.
    fn read_to_string(&self, path: &Path) -> io::Result<String>;

    /// Checks if a path exists.
    fn exists(&self, path: &Path) -> bool;

    /// Lists entries in a directory.
    fn read_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>>;

    /// Returns capacity figures of the filesystem containing `path`.
    fn disk_space(&self, path: &Path) -> io::Result<DiskSpace>;
}

/// Real filesystem implementation that delegates to `std::fs` and `statvfs`.
#[derive(Debug, Default, Clone, Copy)]
pub struct RealFs;

impl RealFs {
    pub fn new() -> Self {
        Self
    }
}

impl FileSystem for RealFs {
    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        std::fs::read_to_string(path)
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
        let entries = std::fs::read_dir(path)?;
        let mut paths = Vec::new();
        for entry in entries {
            paths.push(entry?.path());
        }
        Ok(paths)
    }

    #[cfg(unix)]
    fn disk_space(&self, path: &Path) -> io::Result<DiskSpace> {
        use std::ffi::CString;
        use std::os::unix::ffi::OsStrExt;

        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        // SAFETY: c_path is a valid NUL-terminated string and stat is a
        // properly sized out-parameter owned by this frame.
        let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }

        let frsize = stat.f_frsize as u64;
        let blocks = stat.f_blocks as u64;
        let bfree = stat.f_bfree as u64;
        Ok(DiskSpace {
            total: blocks * frsize,
            used: blocks.saturating_sub(bfree) * frsize,
            free: stat.f_bavail as u64 * frsize,
        })
    }

    #[cfg(not(unix))]
    fn disk_space(&self, path: &Path) -> io::Result<DiskSpace> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("statvfs is not available for {:?}", path),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_real_fs_roundtrip_through_tempdir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("limits"), "memory 512M\n").unwrap();
        std::fs::create_dir(dir.path().join("state")).unwrap();

        let fs = RealFs::new();
        assert_eq!(
            fs.read_to_string(&dir.path().join("limits")).unwrap(),
            "memory 512M\n"
        );
        assert!(fs.exists(&dir.path().join("state")));
        assert!(!fs.exists(&dir.path().join("missing")));

        let mut entries = fs.read_dir(dir.path()).unwrap();
        entries.sort();
        assert_eq!(entries, vec![dir.path().join("limits"), dir.path().join("state")]);
    }

    #[test]
    fn test_real_fs_missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = RealFs.read_to_string(&dir.path().join("nope")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
        assert!(RealFs.read_dir(&dir.path().join("nope")).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_real_fs_disk_space() {
        let dir = tempfile::tempdir().unwrap();
        let space = RealFs.disk_space(dir.path()).unwrap();
        assert!(space.total > 0);
        assert!(space.used <= space.total);
        assert!(space.free <= space.total);

        assert!(RealFs.disk_space(Path::new("/nonexistent/hostgov")).is_err());
    }
}
