//! In-memory mock filesystem for testing collectors without real `/proc`.
//!
//! `MockFs` simulates `/proc` plus per-mount capacity figures, so collector
//! and meter tests run on any OS and in CI.

use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};

use crate::collector::traits::{DiskSpace, FileSystem};

/// In-memory filesystem for testing.
#[derive(Debug, Clone, Default)]
pub struct MockFs {
    files: HashMap<PathBuf, String>,
    directories: HashSet<PathBuf>,
    /// Capacity per mount point, returned by `disk_space`.
    mounts: HashMap<PathBuf, DiskSpace>,
}

impl MockFs {
    /// Creates a new empty mock filesystem.
    pub fn new() -> Self {
        Self::default()
    }

    fn add_parents(&mut self, path: &Path) {
        let mut parent = path.parent();
        while let Some(p) = parent {
            if !p.as_os_str().is_empty() {
                self.directories.insert(p.to_path_buf());
            }
            parent = p.parent();
        }
    }

    /// Adds a file with the given content. Parent directories are created.
    pub fn add_file(&mut self, path: impl AsRef<Path>, content: impl Into<String>) {
        let path = path.as_ref().to_path_buf();
        self.add_parents(&path);
        self.files.insert(path, content.into());
    }

    /// Adds an empty directory.
    pub fn add_dir(&mut self, path: impl AsRef<Path>) {
        let path = path.as_ref().to_path_buf();
        self.add_parents(&path);
        self.directories.insert(path);
    }

    /// Removes a file or a whole directory subtree.
    pub fn remove(&mut self, path: impl AsRef<Path>) {
        let path = path.as_ref();
        self.files.retain(|p, _| !p.starts_with(path));
        self.directories.retain(|p| !p.starts_with(path));
    }

    /// Replaces the content of an existing or new file.
    pub fn set_file(&mut self, path: impl AsRef<Path>, content: impl Into<String>) {
        self.add_file(path, content);
    }

    /// Registers a mount point with the given capacity in bytes.
    pub fn add_mount(&mut self, path: impl AsRef<Path>, total: u64, used: u64) {
        let path = path.as_ref().to_path_buf();
        self.add_dir(&path);
        self.mounts.insert(
            path,
            DiskSpace {
                total,
                used,
                free: total.saturating_sub(used),
            },
        );
    }

    /// Adds `/proc/<pid>/{stat,status,cmdline}` and `fds` empty entries
    /// under `/proc/<pid>/fd`.
    pub fn add_process(&mut self, pid: u32, stat: &str, status: &str, cmdline: &str, fds: u32) {
        let base = PathBuf::from(format!("/proc/{}", pid));
        self.add_dir(&base);
        self.add_file(base.join("stat"), stat);
        self.add_file(base.join("status"), status);
        self.add_file(base.join("cmdline"), cmdline);
        self.add_dir(base.join("fd"));
        for fd in 0..fds {
            self.add_file(base.join("fd").join(fd.to_string()), "");
        }
    }
}

impl FileSystem for MockFs {
    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        self.files.get(path).cloned().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("file not found: {:?}", path),
            )
        })
    }

    fn exists(&self, path: &Path) -> bool {
        self.files.contains_key(path) || self.directories.contains(path)
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
        if !self.directories.contains(path) {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("directory not found: {:?}", path),
            ));
        }

        let children: HashSet<PathBuf> = self
            .files
            .keys()
            .chain(self.directories.iter())
            .filter(|p| p.as_path() != path && p.parent() == Some(path))
            .cloned()
            .collect();
        Ok(children.into_iter().collect())
    }

    /// Resolves `path` to the longest registered mount containing it.
    fn disk_space(&self, path: &Path) -> io::Result<DiskSpace> {
        self.mounts
            .iter()
            .filter(|(mount, _)| path.starts_with(mount))
            .max_by_key(|(mount, _)| mount.components().count())
            .map(|(_, space)| *space)
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no mount for {:?}", path),
                )
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_file_creates_parents() {
        let mut fs = MockFs::new();
        fs.add_file("/proc/net/dev", "lo: 0\n");

        for dir in ["/proc", "/proc/net"] {
            assert!(fs.exists(Path::new(dir)), "{} missing", dir);
        }
        assert_eq!(fs.read_to_string(Path::new("/proc/net/dev")).unwrap(), "lo: 0\n");

        fs.set_file("/proc/net/dev", "lo: 42\n");
        assert_eq!(fs.read_to_string(Path::new("/proc/net/dev")).unwrap(), "lo: 42\n");
    }

    #[test]
    fn test_read_dir_lists_direct_children_only() {
        let mut fs = MockFs::new();
        fs.add_file("/proc/10/stat", "");
        fs.add_file("/proc/10/status", "");
        fs.add_file("/proc/11/stat", "");
        fs.add_file("/proc/meminfo", "");

        let mut top = fs.read_dir(Path::new("/proc")).unwrap();
        top.sort();
        assert_eq!(
            top,
            ["/proc/10", "/proc/11", "/proc/meminfo"].map(PathBuf::from).to_vec()
        );
        assert_eq!(fs.read_dir(Path::new("/proc/10")).unwrap().len(), 2);
        assert!(fs.read_dir(Path::new("/proc/meminfo")).is_err());
    }

    #[test]
    fn test_add_process_with_fds() {
        let mut fs = MockFs::new();
        fs.add_process(1234, "stat", "Name:\tbash\n", "/bin/bash\0", 3);

        assert!(fs.exists(Path::new("/proc/1234/stat")));
        assert!(fs.exists(Path::new("/proc/1234/cmdline")));
        assert_eq!(fs.read_dir(Path::new("/proc/1234/fd")).unwrap().len(), 3);
    }

    #[test]
    fn test_remove_subtree() {
        let mut fs = MockFs::new();
        fs.add_process(7, "stat", "Name:\tx\n", "", 1);
        fs.remove("/proc/7");

        assert!(!fs.exists(Path::new("/proc/7")));
        assert!(!fs.exists(Path::new("/proc/7/fd/0")));
        assert!(fs.exists(Path::new("/proc")));
    }

    #[test]
    fn test_disk_space_longest_mount() {
        let mut fs = MockFs::new();
        fs.add_mount("/", 1000, 400);
        fs.add_mount("/data", 5000, 1000);

        assert_eq!(fs.disk_space(Path::new("/etc")).unwrap().total, 1000);
        let data = fs.disk_space(Path::new("/data/db")).unwrap();
        assert_eq!(data.total, 5000);
        assert_eq!(data.free, 4000);
    }

    #[test]
    fn test_not_found() {
        let fs = MockFs::new();
        let result = fs.read_to_string(Path::new("/nonexistent"));
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::NotFound);
        assert!(fs.disk_space(Path::new("/")).is_err());
    }
}
