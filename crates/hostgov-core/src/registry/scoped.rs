//! Registry view whose resources are released when a token is cancelled.

use std::fs::File;
use std::net::TcpStream;
use std::ops::Deref;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::ResourceRegistry;
use super::resource::{
    Closer, DatabaseHandle, DatabaseResource, FileResource, GenericResource, NetworkResource,
    Resource,
};
use crate::error::{GovernError, Result};

/// Tracks into a shared [`ResourceRegistry`] and releases each tracked
/// resource once `token` is cancelled, tying handles to a request or session
/// lifetime.
///
/// Every `track*` call spawns one waiter task on the current tokio runtime.
/// The waiter ends when the token fires or when the resource leaves the
/// registry by any other path. Without a runtime nothing is tracked and
/// [`GovernError::NoRuntime`] is returned.
#[derive(Debug, Clone)]
pub struct ScopedRegistry {
    registry: ResourceRegistry,
    token: CancellationToken,
}

impl ScopedRegistry {
    pub fn new(registry: ResourceRegistry, token: CancellationToken) -> Self {
        Self { registry, token }
    }

    pub fn registry(&self) -> &ResourceRegistry {
        &self.registry
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn track(&self, resource: Arc<dyn Resource>) -> Result<()> {
        let id = resource.id().to_string();
        let Ok(handle) = Handle::try_current() else {
            warn!(id = %id, "no tokio runtime, scoped resource not tracked");
            return Err(GovernError::NoRuntime(id));
        };
        let removed = self.registry.track_watched(resource);

        let registry = self.registry.clone();
        let token = self.token.clone();
        handle.spawn(async move {
            tokio::select! {
                _ = removed.cancelled() => {}
                _ = token.cancelled() => match registry.release(&id) {
                    Ok(()) => debug!(id = %id, "scoped resource released"),
                    Err(e) if e.is_not_found() => debug!(id = %id, "scoped resource already released"),
                    Err(e) => warn!(id = %id, error = %e, "failed to release scoped resource"),
                },
            }
        });
        Ok(())
    }

    pub fn track_file(&self, file: File, path: impl Into<PathBuf>) -> Result<Arc<FileResource>> {
        let resource = Arc::new(FileResource::new(file, path));
        self.track(resource.clone())?;
        Ok(resource)
    }

    pub fn track_network(&self, stream: TcpStream) -> Result<Arc<NetworkResource>> {
        let resource = Arc::new(NetworkResource::new(stream));
        self.track(resource.clone())?;
        Ok(resource)
    }

    pub fn track_database<D>(
        &self,
        handle: D,
        conn_info: impl Into<String>,
    ) -> Result<Arc<DatabaseResource<D>>>
    where
        D: DatabaseHandle + 'static,
    {
        let resource = Arc::new(DatabaseResource::new(handle, conn_info));
        self.track(resource.clone())?;
        Ok(resource)
    }

    pub fn track_generic<T>(
        &self,
        kind: impl Into<String>,
        name: &str,
        data: T,
        closer: Option<Closer>,
    ) -> Result<Arc<GenericResource<T>>>
    where
        T: Send + Sync + 'static,
    {
        let resource = Arc::new(GenericResource::new(kind, name, data, closer));
        self.track(resource.clone())?;
        Ok(resource)
    }
}

impl Deref for ScopedRegistry {
    type Target = ResourceRegistry;

    fn deref(&self) -> &ResourceRegistry {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BoxError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn settle() {
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_cancel_releases_scoped_resources() {
        let registry = ResourceRegistry::default();
        let outside = registry.track_generic("job", "outside", (), None);

        let scope = ScopedRegistry::new(registry.clone(), CancellationToken::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let inside = scope.track_generic(
            "job",
            "inside",
            (),
            Some(Box::new(move || -> Result<(), BoxError> {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }) as Closer),
        ).unwrap();
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let file = scope.track_file(tmp.reopen().unwrap(), tmp.path()).unwrap();
        assert_eq!(registry.len(), 3);

        scope.token().cancel();
        settle().await;

        assert!(!registry.contains(inside.id()));
        assert!(!registry.contains(file.id()));
        assert!(registry.contains(outside.id()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(registry.stats().total_closed, 2);
    }

    #[tokio::test]
    async fn test_explicit_release_before_cancel() {
        let registry = ResourceRegistry::default();
        let token = CancellationToken::new();
        let scope = ScopedRegistry::new(registry.clone(), token.child_token());
        let res = scope.track_generic("job", "early", (), None).unwrap();

        scope.release(res.id()).unwrap();
        token.cancel();
        settle().await;

        let stats = registry.stats();
        assert_eq!(stats.total_closed, 1);
        assert_eq!(stats.closure_errors, 0);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_waiter_exits_after_explicit_release() {
        let registry = ResourceRegistry::default();
        let scope = ScopedRegistry::new(registry.clone(), CancellationToken::new());
        let baseline = Arc::strong_count(&registry.inner);

        let ids: Vec<String> = (0..8)
            .map(|i| {
                let res = scope.track_generic("job", &format!("r{i}"), (), None).unwrap();
                res.id().to_string()
            })
            .collect();
        assert_eq!(Arc::strong_count(&registry.inner), baseline + ids.len());

        for id in &ids {
            registry.release(id).unwrap();
        }
        settle().await;

        assert_eq!(Arc::strong_count(&registry.inner), baseline);
        assert!(registry.inner.state.read().removal.is_empty());
        assert!(!scope.token().is_cancelled());
    }

    #[test]
    fn test_track_without_runtime_rejects() {
        let registry = ResourceRegistry::default();
        let scope = ScopedRegistry::new(registry.clone(), CancellationToken::new());

        let err = scope.track_generic("job", "a", (), None).unwrap_err();
        assert!(matches!(err, GovernError::NoRuntime(_)));
        assert!(registry.is_empty());
        assert_eq!(registry.stats().total_created, 0);
    }
}
