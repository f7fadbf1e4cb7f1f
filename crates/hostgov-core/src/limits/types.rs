//! Limit declarations and the handler types invoked on a breach.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::metering::{ResourceKind, ResourceUsage};

/// Names of the built-in actions.
pub mod actions {
    /// Accepted as an action name; never has a handler.
    pub const NONE: &str = "none";
    pub const LOG: &str = "log";
    pub const ALERT: &str = "alert";
    pub const THROTTLE: &str = "throttle";
    pub const REJECT: &str = "reject";
    pub const RESTART: &str = "restart";
    pub const STOP: &str = "stop";

    pub const BUILTIN: [&str; 6] = [LOG, ALERT, THROTTLE, REJECT, RESTART, STOP];
}

/// Classification carried with a limit. The action decides how strict
/// enforcement is; the type only selects limits for removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LimitType {
    #[default]
    Soft,
    Hard,
}

impl LimitType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LimitType::Soft => "soft",
            LimitType::Hard => "hard",
        }
    }
}

impl fmt::Display for LimitType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LimitType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "soft" => Ok(LimitType::Soft),
            "hard" => Ok(LimitType::Hard),
            other => Err(format!("unknown limit type: {}", other)),
        }
    }
}

/// A threshold on one resource kind plus the action to run when exceeded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimit {
    pub kind: ResourceKind,
    pub limit_type: LimitType,
    /// Exceeded when the current value is strictly greater.
    pub value: u64,
    pub action: String,
    /// Informational; breaches are evaluated per check.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<Duration>,
}

impl ResourceLimit {
    pub fn new(
        kind: ResourceKind,
        limit_type: LimitType,
        value: u64,
        action: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            limit_type,
            value,
            action: action.into(),
            duration: None,
        }
    }

    pub fn soft(kind: ResourceKind, value: u64, action: impl Into<String>) -> Self {
        Self::new(kind, LimitType::Soft, value, action)
    }

    pub fn hard(kind: ResourceKind, value: u64, action: impl Into<String>) -> Self {
        Self::new(kind, LimitType::Hard, value, action)
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }
}

/// What an action handler receives when a limit is exceeded.
#[derive(Debug, Clone)]
pub struct Breach {
    pub kind: ResourceKind,
    pub limit: ResourceLimit,
    /// The value compared against `limit.value`.
    pub current: u64,
    /// Snapshot the check was evaluated on.
    pub usage: ResourceUsage,
}

impl fmt::Display for Breach {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} usage over {} limit {}, current {}",
            self.kind, self.limit.limit_type, self.limit.value, self.current
        )
    }
}

pub type ActionFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// Named breach handler. Only `throttle` actually awaits.
pub type ActionHandler = Arc<dyn Fn(Breach) -> ActionFuture + Send + Sync>;

/// Receives `(kind, message)` from the `alert` action.
pub type AlertHandler = Arc<dyn Fn(ResourceKind, &str) + Send + Sync>;

/// Wraps a synchronous closure as an [`ActionHandler`].
pub fn sync_action<F>(f: F) -> ActionHandler
where
    F: Fn(&Breach) -> Result<()> + Send + Sync + 'static,
{
    Arc::new(move |breach: Breach| {
        let result = f(&breach);
        Box::pin(async move { result }) as ActionFuture
    })
}

/// Wraps an async closure as an [`ActionHandler`].
pub fn async_action<F, Fut>(f: F) -> ActionHandler
where
    F: Fn(Breach) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |breach: Breach| Box::pin(f(breach)) as ActionFuture)
}

/// Wraps a closure as an [`AlertHandler`].
pub fn alert_handler<F>(f: F) -> AlertHandler
where
    F: Fn(ResourceKind, &str) + Send + Sync + 'static,
{
    Arc::new(f)
}
