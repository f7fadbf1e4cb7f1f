//! Tracked handle types.
//!
//! Every variant embeds a [`BaseResource`] holding the identity, timestamps
//! and a closed flag, so `close` runs the underlying close at most once no
//! matter how many times or from how many threads it is called.

use std::fs::File;
use std::io;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use crate::error::BoxError;

pub const KIND_FILE: &str = "file";
pub const KIND_NETWORK: &str = "network";
pub const KIND_DATABASE: &str = "database";

/// A closable handle owned by the registry.
pub trait Resource: Send + Sync {
    /// `"<kind>:<unix-nanos>:<discriminator>"`.
    fn id(&self) -> &str;
    fn kind(&self) -> &str;
    fn created_at(&self) -> DateTime<Utc>;
    fn last_used_at(&self) -> DateTime<Utc>;
    /// Refreshes the last-used timestamp.
    fn touch(&self);
    /// Closes the handle. Calls after the first are no-ops returning `Ok`.
    fn close(&self) -> Result<(), BoxError>;
}

/// Serializable description of a tracked resource.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceInfo {
    pub id: String,
    pub kind: String,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
}

impl ResourceInfo {
    pub fn of(resource: &dyn Resource) -> Self {
        Self {
            id: resource.id().to_string(),
            kind: resource.kind().to_string(),
            created_at: resource.created_at(),
            last_used_at: resource.last_used_at(),
        }
    }
}

static LAST_ID_NANOS: AtomicI64 = AtomicI64::new(0);

/// Current time in unix nanoseconds, strictly increasing across calls so
/// two handles with the same discriminator never share an id.
fn unique_nanos() -> i64 {
    let now = Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX);
    let mut last = LAST_ID_NANOS.load(Ordering::Relaxed);
    loop {
        let next = now.max(last + 1);
        match LAST_ID_NANOS.compare_exchange_weak(last, next, Ordering::Relaxed, Ordering::Relaxed)
        {
            Ok(_) => return next,
            Err(actual) => last = actual,
        }
    }
}

pub fn resource_id(kind: &str, discriminator: &str) -> String {
    format!("{}:{}:{}", kind, unique_nanos(), discriminator)
}

/// Identity, timestamps and the at-most-once close guard.
#[derive(Debug)]
pub struct BaseResource {
    id: String,
    kind: String,
    created_at: DateTime<Utc>,
    last_used_at: RwLock<DateTime<Utc>>,
    closed: AtomicBool,
}

impl BaseResource {
    pub fn new(kind: impl Into<String>, discriminator: &str) -> Self {
        let kind = kind.into();
        let id = resource_id(&kind, discriminator);
        Self::with_id(id, kind)
    }

    pub fn with_id(id: impl Into<String>, kind: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            kind: kind.into(),
            created_at: now,
            last_used_at: RwLock::new(now),
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn last_used_at(&self) -> DateTime<Utc> {
        *self.last_used_at.read()
    }

    pub fn touch(&self) {
        *self.last_used_at.write() = Utc::now();
    }

    /// Overrides the last-used timestamp.
    pub fn set_last_used_at(&self, at: DateTime<Utc>) {
        *self.last_used_at.write() = at;
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Runs `close` unless the resource was already closed.
    pub fn close_once<F>(&self, close: F) -> Result<(), BoxError>
    where
        F: FnOnce() -> Result<(), BoxError>,
    {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        close()
    }
}

macro_rules! delegate_base {
    () => {
        fn id(&self) -> &str {
            self.base.id()
        }

        fn kind(&self) -> &str {
            self.base.kind()
        }

        fn created_at(&self) -> DateTime<Utc> {
            self.base.created_at()
        }

        fn last_used_at(&self) -> DateTime<Utc> {
            self.base.last_used_at()
        }

        fn touch(&self) {
            self.base.touch()
        }
    };
}

/// Closes `file` and reports the OS error, which dropping would swallow.
#[cfg(unix)]
fn close_file(file: File) -> io::Result<()> {
    use std::os::fd::IntoRawFd;

    let fd = file.into_raw_fd();
    // SAFETY: `fd` was just released by `into_raw_fd` and is closed once.
    if unsafe { libc::close(fd) } == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
fn close_file(file: File) -> io::Result<()> {
    drop(file);
    Ok(())
}

/// An open file.
#[derive(Debug)]
pub struct FileResource {
    base: BaseResource,
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl FileResource {
    pub fn new(file: File, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            base: BaseResource::new(KIND_FILE, &path.to_string_lossy()),
            path,
            file: Mutex::new(Some(file)),
        }
    }

    pub fn base(&self) -> &BaseResource {
        &self.base
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Runs `f` with the file. Returns `None` once closed.
    pub fn with_file<R>(&self, f: impl FnOnce(&mut File) -> R) -> Option<R> {
        self.base.touch();
        self.file.lock().as_mut().map(f)
    }
}

impl Resource for FileResource {
    delegate_base!();

    fn close(&self) -> Result<(), BoxError> {
        self.base.close_once(|| match self.file.lock().take() {
            Some(file) => close_file(file).map_err(Into::into),
            None => Ok(()),
        })
    }
}

/// A TCP connection.
#[derive(Debug)]
pub struct NetworkResource {
    base: BaseResource,
    local_addr: Option<SocketAddr>,
    remote_addr: Option<SocketAddr>,
    stream: Mutex<Option<TcpStream>>,
}

fn addr_or_unknown(addr: Option<SocketAddr>) -> String {
    addr.map_or_else(|| "unknown".to_string(), |a| a.to_string())
}

impl NetworkResource {
    pub fn new(stream: TcpStream) -> Self {
        let local_addr = stream.local_addr().ok();
        let remote_addr = stream.peer_addr().ok();
        let discriminator = format!(
            "{}-{}",
            addr_or_unknown(local_addr),
            addr_or_unknown(remote_addr)
        );
        Self {
            base: BaseResource::new(KIND_NETWORK, &discriminator),
            local_addr,
            remote_addr,
            stream: Mutex::new(Some(stream)),
        }
    }

    pub fn base(&self) -> &BaseResource {
        &self.base
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// Runs `f` with the stream. Returns `None` once closed.
    pub fn with_stream<R>(&self, f: impl FnOnce(&mut TcpStream) -> R) -> Option<R> {
        self.base.touch();
        self.stream.lock().as_mut().map(f)
    }
}

impl Resource for NetworkResource {
    delegate_base!();

    fn close(&self) -> Result<(), BoxError> {
        self.base.close_once(|| {
            let Some(stream) = self.stream.lock().take() else {
                return Ok(());
            };
            match stream.shutdown(Shutdown::Both) {
                Ok(()) => Ok(()),
                // Peer already gone; the socket is released on drop.
                Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
                Err(e) => Err(e.into()),
            }
        })
    }
}

/// A database connection or pool that can be closed explicitly.
pub trait DatabaseHandle: Send {
    fn close(&mut self) -> Result<(), BoxError>;
}

#[derive(Debug)]
pub struct DatabaseResource<D> {
    base: BaseResource,
    conn_info: String,
    handle: Mutex<Option<D>>,
}

impl<D: DatabaseHandle> DatabaseResource<D> {
    pub fn new(handle: D, conn_info: impl Into<String>) -> Self {
        let conn_info = conn_info.into();
        Self {
            base: BaseResource::new(KIND_DATABASE, &conn_info),
            conn_info,
            handle: Mutex::new(Some(handle)),
        }
    }

    pub fn base(&self) -> &BaseResource {
        &self.base
    }

    pub fn conn_info(&self) -> &str {
        &self.conn_info
    }

    /// Runs `f` with the handle. Returns `None` once closed.
    pub fn with_handle<R>(&self, f: impl FnOnce(&mut D) -> R) -> Option<R> {
        self.base.touch();
        self.handle.lock().as_mut().map(f)
    }
}

impl<D: DatabaseHandle> Resource for DatabaseResource<D> {
    delegate_base!();

    fn close(&self) -> Result<(), BoxError> {
        self.base.close_once(|| match self.handle.lock().take() {
            Some(mut handle) => handle.close(),
            None => Ok(()),
        })
    }
}

/// Close callback of a [`GenericResource`].
pub type Closer = Box<dyn FnOnce() -> Result<(), BoxError> + Send>;

/// Arbitrary payload with an optional close callback.
pub struct GenericResource<T> {
    base: BaseResource,
    data: RwLock<T>,
    closer: Mutex<Option<Closer>>,
}

impl<T: Send + Sync> GenericResource<T> {
    pub fn new(kind: impl Into<String>, name: &str, data: T, closer: Option<Closer>) -> Self {
        Self {
            base: BaseResource::new(kind, name),
            data: RwLock::new(data),
            closer: Mutex::new(closer),
        }
    }

    pub fn base(&self) -> &BaseResource {
        &self.base
    }

    pub fn with_data<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        self.base.touch();
        f(&self.data.read())
    }

    pub fn set_data(&self, data: T) {
        self.base.touch();
        *self.data.write() = data;
    }
}

impl<T: Clone + Send + Sync> GenericResource<T> {
    pub fn data(&self) -> T {
        self.with_data(T::clone)
    }
}

impl<T> std::fmt::Debug for GenericResource<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenericResource")
            .field("base", &self.base)
            .finish_non_exhaustive()
    }
}

impl<T: Send + Sync> Resource for GenericResource<T> {
    delegate_base!();

    fn close(&self) -> Result<(), BoxError> {
        self.base.close_once(|| match self.closer.lock().take() {
            Some(closer) => closer(),
            None => Ok(()),
        })
    }
}
