//! Error types shared across the governance core.

use crate::collector::CollectError;
use crate::metering::ResourceKind;

/// Boxed error returned by handle close operations and custom actions.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors surfaced by the registry, the meter, the enforcer and the manager.
#[derive(Debug, thiserror::Error)]
pub enum GovernError {
    /// Release or lookup of an identity that is not tracked.
    #[error("resource not found: {0}")]
    NotFound(String),

    /// A handle's close operation failed. The handle is no longer tracked.
    #[error("failed to close resource {id}: {source}")]
    ClosureFailure {
        id: String,
        #[source]
        source: BoxError,
    },

    /// An OS metric call failed; the update cycle was abandoned.
    #[error("failed to sample {sampler} usage: {source}")]
    Sampling {
        sampler: &'static str,
        #[source]
        source: CollectError,
    },

    /// The requested tuning call is not available on this OS.
    #[error("unsupported platform: {0}")]
    UnsupportedPlatform(String),

    /// An OS tuning call was attempted and failed.
    #[error("{op} failed: {source}")]
    Os {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// Raised by the `reject` action.
    #[error("{kind} usage over {limit_type} limit: {current} > {threshold}")]
    LimitExceeded {
        kind: ResourceKind,
        limit_type: String,
        threshold: u64,
        current: u64,
    },

    /// Raised by the `restart` action; the host decides how to restart.
    #[error("{kind} usage over limit ({current} > {threshold}), restart requested")]
    RestartRequested {
        kind: ResourceKind,
        threshold: u64,
        current: u64,
    },

    /// Raised by the `stop` action; the host decides how to stop.
    #[error("{kind} usage over limit ({current} > {threshold}), stop requested")]
    StopRequested {
        kind: ResourceKind,
        threshold: u64,
        current: u64,
    },

    /// Scoped tracking needs a tokio runtime to wait on its token.
    #[error("no tokio runtime to watch scoped resource {0}")]
    NoRuntime(String),

    /// A blocking action was interrupted by cancellation of the lifetime token.
    #[error("operation cancelled")]
    Cancelled,

    /// A custom action handler failed.
    #[error("action {action} failed: {source}")]
    Action {
        action: String,
        #[source]
        source: BoxError,
    },
}

impl GovernError {
    /// Returns true for [`GovernError::NotFound`].
    pub fn is_not_found(&self) -> bool {
        matches!(self, GovernError::NotFound(_))
    }
}

pub type Result<T, E = GovernError> = std::result::Result<T, E>;
