//! Resource handle registry.
//!
//! Tracks closable handles by id so leaks are observable and everything
//! still open can be released at shutdown. Every release path (explicit,
//! bulk, by kind, idle sweep) goes through `release_locked` under the single
//! write lock, which removes the entry before anyone else can see it and so
//! closes each handle at most once.

pub mod resource;
pub mod scoped;

use std::collections::HashMap;
use std::fs::File;
use std::net::TcpStream;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::RegistryConfig;
use crate::error::{GovernError, Result};

pub use resource::{
    BaseResource, Closer, DatabaseHandle, DatabaseResource, FileResource, GenericResource,
    NetworkResource, Resource, ResourceInfo,
};
pub use scoped::ScopedRegistry;

/// Registry counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResourceStats {
    pub total_created: u64,
    pub total_closed: u64,
    /// Always equal to the number of tracked ids.
    pub current_active: u64,
    pub closure_errors: u64,
}

#[derive(Default)]
struct State {
    resources: HashMap<String, Arc<dyn Resource>>,
    /// Cancelled when the id leaves the map, whatever the release path.
    removal: HashMap<String, CancellationToken>,
    stats: ResourceStats,
}

impl State {
    fn insert(&mut self, resource: Arc<dyn Resource>) {
        let id = resource.id().to_string();
        let kind = resource.kind().to_string();
        if self.resources.insert(id.clone(), resource).is_some() {
            warn!(id = %id, kind = %kind, "resource already tracked, replacing");
        }
        self.stats.total_created += 1;
        self.stats.current_active = self.resources.len() as u64;
        debug!(id = %id, kind = %kind, "resource tracked");
    }

    /// Closes and removes `id`. The caller holds the write lock.
    fn release_locked(&mut self, id: &str) -> Result<()> {
        let Some(resource) = self.resources.remove(id) else {
            return Err(GovernError::NotFound(id.to_string()));
        };
        if let Some(removed) = self.removal.remove(id) {
            removed.cancel();
        }
        let closed = resource.close();
        self.stats.total_closed += 1;
        self.stats.current_active = self.resources.len() as u64;

        match closed {
            Ok(()) => {
                debug!(id = %id, kind = %resource.kind(), "resource released");
                Ok(())
            }
            Err(source) => {
                self.stats.closure_errors += 1;
                error!(id = %id, kind = %resource.kind(), error = %source, "failed to close resource");
                Err(GovernError::ClosureFailure {
                    id: id.to_string(),
                    source,
                })
            }
        }
    }

    fn release_matching(&mut self, pred: impl Fn(&dyn Resource) -> bool) -> Vec<GovernError> {
        let ids: Vec<String> = self
            .resources
            .iter()
            .filter(|(_, r)| pred(r.as_ref()))
            .map(|(id, _)| id.clone())
            .collect();
        ids.iter()
            .filter_map(|id| self.release_locked(id).err())
            .collect()
    }
}

struct Inner {
    config: RegistryConfig,
    state: RwLock<State>,
    sweep: Mutex<Option<CancellationToken>>,
    stopped: AtomicBool,
}

/// Cheaply cloneable handle to a shared registry.
#[derive(Clone)]
pub struct ResourceRegistry {
    inner: Arc<Inner>,
}

impl Default for ResourceRegistry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}

impl std::fmt::Debug for ResourceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceRegistry")
            .field("config", &self.inner.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl ResourceRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                state: RwLock::new(State::default()),
                sweep: Mutex::new(None),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> RegistryConfig {
        self.inner.config
    }

    /// Registers `resource` under its id. A resource already tracked under
    /// the same id is replaced without being closed.
    pub fn track(&self, resource: Arc<dyn Resource>) {
        self.inner.state.write().insert(resource);
    }

    /// Tracks `resource` and returns a token cancelled once its id is
    /// released, both under the same lock.
    fn track_watched(&self, resource: Arc<dyn Resource>) -> CancellationToken {
        let id = resource.id().to_string();
        let mut state = self.inner.state.write();
        state.insert(resource);
        state
            .removal
            .entry(id)
            .or_insert_with(CancellationToken::new)
            .clone()
    }

    pub fn track_file(&self, file: File, path: impl Into<PathBuf>) -> Arc<FileResource> {
        let resource = Arc::new(FileResource::new(file, path));
        self.track(resource.clone());
        resource
    }

    pub fn track_network(&self, stream: TcpStream) -> Arc<NetworkResource> {
        let resource = Arc::new(NetworkResource::new(stream));
        self.track(resource.clone());
        resource
    }

    pub fn track_database<D>(&self, handle: D, conn_info: impl Into<String>) -> Arc<DatabaseResource<D>>
    where
        D: DatabaseHandle + 'static,
    {
        let resource = Arc::new(DatabaseResource::new(handle, conn_info));
        self.track(resource.clone());
        resource
    }

    pub fn track_generic<T>(
        &self,
        kind: impl Into<String>,
        name: &str,
        data: T,
        closer: Option<Closer>,
    ) -> Arc<GenericResource<T>>
    where
        T: Send + Sync + 'static,
    {
        let resource = Arc::new(GenericResource::new(kind, name, data, closer));
        self.track(resource.clone());
        resource
    }

    /// Closes and forgets `id`.
    ///
    /// The entry is removed even when close fails; the failure is counted and
    /// returned as [`GovernError::ClosureFailure`]. An unknown id returns
    /// [`GovernError::NotFound`] and leaves the counters alone.
    pub fn release(&self, id: &str) -> Result<()> {
        self.inner.state.write().release_locked(id)
    }

    /// Releases everything, collecting the failures.
    pub fn release_all(&self) -> Vec<GovernError> {
        self.inner.state.write().release_matching(|_| true)
    }

    pub fn release_by_kind(&self, kind: &str) -> Vec<GovernError> {
        self.inner.state.write().release_matching(|r| r.kind() == kind)
    }

    /// Looks up `id`, refreshing its last-used time on a hit.
    pub fn get(&self, id: &str) -> Option<Arc<dyn Resource>> {
        let resource = self.inner.state.read().resources.get(id).cloned()?;
        resource.touch();
        Some(resource)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.state.read().resources.contains_key(id)
    }

    /// Tracked resources, oldest first.
    pub fn list_resources(&self) -> Vec<ResourceInfo> {
        let mut list: Vec<ResourceInfo> = self
            .inner
            .state
            .read()
            .resources
            .values()
            .map(|r| ResourceInfo::of(r.as_ref()))
            .collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        list
    }

    pub fn stats(&self) -> ResourceStats {
        self.inner.state.read().stats
    }

    pub fn len(&self) -> usize {
        self.inner.state.read().resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Releases every resource unused for longer than `idle_timeout`.
    pub fn cleanup_idle_resources(&self, idle_timeout: Duration) -> Vec<GovernError> {
        let idle_timeout = chrono::Duration::from_std(idle_timeout).unwrap_or(chrono::TimeDelta::MAX);
        let now = Utc::now();
        let mut state = self.inner.state.write();
        state.release_matching(|r| {
            let idle = now - r.last_used_at();
            if idle > idle_timeout {
                info!(id = %r.id(), kind = %r.kind(), idle_secs = idle.num_seconds(), "releasing idle resource");
                true
            } else {
                false
            }
        })
    }

    /// Starts the background idle sweep on the current tokio runtime.
    ///
    /// Returns false when the sweep is already running, the registry was
    /// stopped or there is no runtime.
    pub fn start_idle_sweep(&self) -> bool {
        if self.inner.stopped.load(Ordering::Acquire) {
            return false;
        }
        let mut sweep = self.inner.sweep.lock();
        if sweep.is_some() {
            return false;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("no tokio runtime, idle sweep not started");
            return false;
        };

        let token = CancellationToken::new();
        let cancel = token.clone();
        let weak = Arc::downgrade(&self.inner);
        let RegistryConfig {
            cleanup_interval,
            idle_timeout,
        } = self.inner.config;

        handle.spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + cleanup_interval, cleanup_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(inner) = weak.upgrade() else { break };
                        let registry = ResourceRegistry { inner };
                        let errors = registry.cleanup_idle_resources(idle_timeout);
                        if !errors.is_empty() {
                            warn!(errors = errors.len(), "idle sweep had close failures");
                        }
                    }
                }
            }
            debug!("idle sweep stopped");
        });
        *sweep = Some(token);
        info!(
            interval_secs = cleanup_interval.as_secs(),
            idle_timeout_secs = idle_timeout.as_secs(),
            "idle sweep started"
        );
        true
    }

    /// Stops the idle sweep and releases everything still tracked.
    ///
    /// Only the first call does any work; later calls return no errors.
    pub fn stop(&self) -> Vec<GovernError> {
        if self.inner.stopped.swap(true, Ordering::AcqRel) {
            debug!("registry already stopped");
            return Vec::new();
        }
        if let Some(token) = self.inner.sweep.lock().take() {
            token.cancel();
        }
        let errors = self.release_all();
        info!(closure_errors = errors.len(), "registry stopped");
        errors
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BoxError;
    use std::sync::atomic::AtomicUsize;

    fn counting_closer(calls: &Arc<AtomicUsize>, fail: bool) -> Closer {
        let calls = Arc::clone(calls);
        Box::new(move || -> std::result::Result<(), BoxError> {
            calls.fetch_add(1, Ordering::SeqCst);
            if fail { Err("close failed".into()) } else { Ok(()) }
        })
    }

    #[test]
    fn test_track_then_release_restores_active() {
        let registry = ResourceRegistry::default();
        let before = registry.stats();

        let calls = Arc::new(AtomicUsize::new(0));
        let res = registry.track_generic("job", "a", (), Some(counting_closer(&calls, false)));
        assert_eq!(registry.stats().current_active, before.current_active + 1);

        registry.release(res.id()).unwrap();
        let after = registry.stats();
        assert_eq!(after.current_active, before.current_active);
        assert_eq!(after.total_closed, before.total_closed + 1);
        assert_eq!(after.total_created, 1);
    }

    #[test]
    fn test_double_release_closes_once() {
        let registry = ResourceRegistry::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let res = registry.track_generic("job", "a", (), Some(counting_closer(&calls, false)));

        assert!(registry.release(res.id()).is_ok());
        let err = registry.release(res.id()).unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(registry.stats().total_closed, 1);
    }

    #[test]
    fn test_release_races_idle_cleanup_closes_once() {
        for _ in 0..200 {
            let registry = ResourceRegistry::default();
            let calls = Arc::new(AtomicUsize::new(0));
            let res = registry.track_generic("job", "a", (), Some(counting_closer(&calls, false)));
            let id = res.id().to_string();
            let barrier = Arc::new(std::sync::Barrier::new(2));

            let releaser = {
                let registry = registry.clone();
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    registry.release(&id)
                })
            };
            barrier.wait();
            let swept = registry.cleanup_idle_resources(Duration::ZERO);
            let released = releaser.join().unwrap();

            assert!(swept.is_empty());
            assert!(released.is_ok() || released.is_err_and(|e| e.is_not_found()));
            assert_eq!(calls.load(Ordering::SeqCst), 1);
            let stats = registry.stats();
            assert_eq!(stats.total_closed, 1);
            assert_eq!(stats.current_active, 0);
        }
    }

    #[test]
    fn test_release_unknown_leaves_counters() {
        let registry = ResourceRegistry::default();
        registry.track_generic("job", "a", (), None);
        let before = registry.stats();

        assert!(matches!(registry.release("job:0:missing"), Err(GovernError::NotFound(_))));
        assert_eq!(registry.stats(), before);
    }

    #[test]
    fn test_close_failure_still_removes() {
        let registry = ResourceRegistry::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let res = registry.track_generic("job", "a", (), Some(counting_closer(&calls, true)));

        let err = registry.release(res.id()).unwrap_err();
        assert!(matches!(err, GovernError::ClosureFailure { .. }));
        assert!(!registry.contains(res.id()));
        let stats = registry.stats();
        assert_eq!(stats.closure_errors, 1);
        assert_eq!(stats.total_closed, 1);
        assert_eq!(stats.current_active, 0);
    }

    // Resource with a caller-chosen id.
    struct Fixed {
        base: BaseResource,
    }

    impl Resource for Fixed {
        fn id(&self) -> &str {
            self.base.id()
        }
        fn kind(&self) -> &str {
            self.base.kind()
        }
        fn created_at(&self) -> chrono::DateTime<Utc> {
            self.base.created_at()
        }
        fn last_used_at(&self) -> chrono::DateTime<Utc> {
            self.base.last_used_at()
        }
        fn touch(&self) {
            self.base.touch()
        }
        fn close(&self) -> std::result::Result<(), BoxError> {
            self.base.close_once(|| Ok(()))
        }
    }

    fn fixed(id: &str) -> Arc<Fixed> {
        Arc::new(Fixed {
            base: BaseResource::with_id(id, "job"),
        })
    }

    #[test]
    fn test_overwrite_keeps_active_equal_to_len() {
        let registry = ResourceRegistry::default();
        registry.track(fixed("job:1:a"));
        registry.track(fixed("job:1:a"));

        let stats = registry.stats();
        assert_eq!(stats.total_created, 2);
        assert_eq!(stats.current_active, 1);
        assert_eq!(registry.len(), 1);

        registry.release("job:1:a").unwrap();
        assert_eq!(registry.stats().current_active, 0);
    }

    #[test]
    fn test_release_all_collects_errors() {
        let registry = ResourceRegistry::default();
        let calls = Arc::new(AtomicUsize::new(0));
        registry.track_generic("job", "ok1", (), Some(counting_closer(&calls, false)));
        registry.track_generic("job", "bad", (), Some(counting_closer(&calls, true)));
        registry.track_generic("job", "ok2", (), Some(counting_closer(&calls, false)));

        let errors = registry.release_all();
        assert_eq!(errors.len(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_release_by_kind() {
        let registry = ResourceRegistry::default();
        registry.track_generic("cache", "a", (), None);
        registry.track_generic("cache", "b", (), None);
        let keep = registry.track_generic("job", "c", (), None);

        assert!(registry.release_by_kind("cache").is_empty());
        let left = registry.list_resources();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].id, keep.id());
    }

    #[test]
    fn test_get_touches() {
        let registry = ResourceRegistry::default();
        let res = registry.track_generic("job", "a", (), None);
        let past = Utc::now() - chrono::Duration::hours(1);
        res.base().set_last_used_at(past);

        let found = registry.get(res.id()).unwrap();
        assert!(found.last_used_at() > past);
        assert!(registry.get("nope").is_none());
    }

    #[test]
    fn test_cleanup_idle_releases_exact_subset() {
        let registry = ResourceRegistry::default();
        let old = registry.track_generic("job", "old", (), None);
        let older = registry.track_generic("job", "older", (), None);
        let fresh = registry.track_generic("job", "fresh", (), None);

        old.base().set_last_used_at(Utc::now() - chrono::Duration::minutes(31));
        older.base().set_last_used_at(Utc::now() - chrono::Duration::hours(2));
        let fresh_used = Utc::now() - chrono::Duration::minutes(5);
        fresh.base().set_last_used_at(fresh_used);

        let errors = registry.cleanup_idle_resources(Duration::from_secs(30 * 60));
        assert!(errors.is_empty());
        assert!(!registry.contains(old.id()));
        assert!(!registry.contains(older.id()));
        assert!(registry.contains(fresh.id()));
        assert_eq!(fresh.last_used_at(), fresh_used);
        assert_eq!(registry.stats().total_closed, 2);
    }

    #[test]
    fn test_list_resources_oldest_first() {
        let registry = ResourceRegistry::default();
        let a = registry.track_generic("job", "a", (), None);
        let b = registry.track_generic("job", "b", (), None);
        let ids: Vec<String> = registry.list_resources().into_iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![a.id().to_string(), b.id().to_string()]);
    }

    #[test]
    fn test_track_file_and_network() {
        let registry = ResourceRegistry::default();
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let file = registry.track_file(tmp.reopen().unwrap(), tmp.path());
        assert_eq!(file.kind(), "file");

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let stream = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let conn = registry.track_network(stream);
        assert_eq!(conn.kind(), "network");

        assert_eq!(registry.len(), 2);
        assert!(registry.stop().is_empty());
        assert!(registry.is_empty());
        assert!(file.base().is_closed());
        assert!(conn.base().is_closed());
    }

    #[test]
    fn test_stop_is_idempotent() {
        let registry = ResourceRegistry::default();
        let calls = Arc::new(AtomicUsize::new(0));
        registry.track_generic("job", "bad", (), Some(counting_closer(&calls, true)));

        assert_eq!(registry.stop().len(), 1);
        assert!(registry.stop().is_empty());
        assert!(registry.is_stopped());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_sweep_needs_runtime() {
        let registry = ResourceRegistry::default();
        assert!(!registry.start_idle_sweep());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_sweep_runs_on_interval() {
        let config = RegistryConfig::default()
            .with_cleanup_interval(Duration::from_secs(60))
            .with_idle_timeout(Duration::from_secs(120));
        let registry = ResourceRegistry::new(config);
        let stale = registry.track_generic("job", "stale", (), None);
        stale
            .base()
            .set_last_used_at(Utc::now() - chrono::Duration::minutes(10));
        let live = registry.track_generic("job", "live", (), None);

        assert!(registry.start_idle_sweep());
        assert!(!registry.start_idle_sweep());

        tokio::time::sleep(Duration::from_secs(61)).await;
        tokio::task::yield_now().await;
        assert!(!registry.contains(stale.id()));
        assert!(registry.contains(live.id()));

        registry.stop();
        assert!(!registry.start_idle_sweep());
    }
}
