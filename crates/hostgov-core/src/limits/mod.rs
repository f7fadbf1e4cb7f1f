//! Limit enforcement engine.
//!
//! Limits are kept per resource kind. [`LimitEnforcer::check`] reads the
//! meter's latest snapshot and runs the named action of every limit whose
//! threshold is exceeded. Limits, handlers and the snapshot are copied out
//! of their locks before any handler runs, so a handler may call back into
//! the enforcer (to add a limit, say) without deadlocking.
//!
//! Built-in actions (`log`, `alert`, `throttle`, `reject`, `restart`,
//! `stop`) are registered on construction and can be replaced by
//! registering a handler under the same name. A limit whose action has no
//! handler is skipped.

pub mod throttle;
pub mod types;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{GovernError, Result};
use crate::metering::{ResourceKind, ResourceUsage, UsageMeter};

pub use throttle::TokenBucket;
pub use types::{
    ActionFuture, ActionHandler, AlertHandler, Breach, LimitType, ResourceLimit, actions,
    alert_handler, async_action, sync_action,
};

/// The value limits of `kind` are compared against.
pub fn current_value(kind: ResourceKind, usage: &ResourceUsage) -> u64 {
    usage.value_of(kind)
}

type AlertHandlers = Arc<RwLock<Vec<AlertHandler>>>;
type Throttles = Arc<Mutex<HashMap<ResourceKind, Arc<TokenBucket>>>>;

pub struct LimitEnforcer {
    meter: Arc<UsageMeter>,
    cancel: CancellationToken,
    limits: RwLock<BTreeMap<ResourceKind, Vec<ResourceLimit>>>,
    handlers: RwLock<HashMap<String, ActionHandler>>,
    alert_handlers: AlertHandlers,
    throttles: Throttles,
}

impl LimitEnforcer {
    /// Creates an enforcer reading from `meter`. `cancel` bounds the wait of
    /// the `throttle` action.
    pub fn new(meter: Arc<UsageMeter>, cancel: CancellationToken) -> Self {
        let enforcer = Self {
            meter,
            cancel,
            limits: RwLock::new(BTreeMap::new()),
            handlers: RwLock::new(HashMap::new()),
            alert_handlers: Arc::default(),
            throttles: Arc::default(),
        };
        enforcer.register_builtin_actions();
        enforcer
    }

    fn register_builtin_actions(&self) {
        self.register_action_handler(
            actions::LOG,
            sync_action(|b| {
                warn!(
                    kind = %b.kind,
                    limit_type = %b.limit.limit_type,
                    limit = b.limit.value,
                    current = b.current,
                    "resource usage over limit"
                );
                Ok(())
            }),
        );

        let alert_handlers = Arc::clone(&self.alert_handlers);
        self.register_action_handler(
            actions::ALERT,
            sync_action(move |b| {
                let message = b.to_string();
                let handlers = alert_handlers.read().clone();
                for handler in handlers {
                    handler(b.kind, &message);
                }
                Ok(())
            }),
        );

        let throttles = Arc::clone(&self.throttles);
        let cancel = self.cancel.clone();
        self.register_action_handler(
            actions::THROTTLE,
            Arc::new(move |b: Breach| {
                let bucket = Arc::clone(
                    throttles
                        .lock()
                        .entry(b.kind)
                        .or_insert_with(|| Arc::new(TokenBucket::for_breach(b.current))),
                );
                let cancel = cancel.clone();
                Box::pin(async move {
                    debug!(kind = %b.kind, rate = bucket.rate(), "throttling");
                    bucket.acquire(&cancel).await
                }) as ActionFuture
            }),
        );

        self.register_action_handler(
            actions::REJECT,
            sync_action(|b| {
                Err(GovernError::LimitExceeded {
                    kind: b.kind,
                    limit_type: b.limit.limit_type.to_string(),
                    threshold: b.limit.value,
                    current: b.current,
                })
            }),
        );

        self.register_action_handler(
            actions::RESTART,
            sync_action(|b| {
                warn!(kind = %b.kind, limit = b.limit.value, current = b.current, "resource usage over limit, restart requested");
                Err(GovernError::RestartRequested {
                    kind: b.kind,
                    threshold: b.limit.value,
                    current: b.current,
                })
            }),
        );

        self.register_action_handler(
            actions::STOP,
            sync_action(|b| {
                warn!(kind = %b.kind, limit = b.limit.value, current = b.current, "resource usage over limit, stop requested");
                Err(GovernError::StopRequested {
                    kind: b.kind,
                    threshold: b.limit.value,
                    current: b.current,
                })
            }),
        );
    }

    pub fn meter(&self) -> &Arc<UsageMeter> {
        &self.meter
    }

    /// Appends `limit` to its kind's list and updates the meter's threshold.
    pub fn add_limit(&self, limit: ResourceLimit) {
        info!(
            kind = %limit.kind,
            limit_type = %limit.limit_type,
            value = limit.value,
            action = %limit.action,
            "limit added"
        );
        let mut limits = self.limits.write();
        let kind = limit.kind;
        let list = limits.entry(kind).or_default();
        list.push(limit);
        self.sync_meter_threshold(kind, list);
    }

    /// Drops every limit of `kind` with the given type.
    pub fn remove_limit(&self, kind: ResourceKind, limit_type: LimitType) {
        let mut limits = self.limits.write();
        let Some(list) = limits.get_mut(&kind) else {
            return;
        };
        list.retain(|l| l.limit_type != limit_type);
        if list.is_empty() {
            limits.remove(&kind);
            self.meter.remove_limit(kind);
            self.throttles.lock().remove(&kind);
        } else {
            self.sync_meter_threshold(kind, list);
        }
        info!(kind = %kind, limit_type = %limit_type, "limit removed");
    }

    // The meter alerts on the tightest threshold of the kind.
    fn sync_meter_threshold(&self, kind: ResourceKind, list: &[ResourceLimit]) {
        if let Some(min) = list.iter().map(|l| l.value).min() {
            self.meter.set_limit(kind, min);
        }
    }

    pub fn limits(&self) -> BTreeMap<ResourceKind, Vec<ResourceLimit>> {
        self.limits.read().clone()
    }

    /// Registers `handler` under `name`, replacing any previous handler.
    pub fn register_action_handler(&self, name: impl Into<String>, handler: ActionHandler) {
        let name = name.into();
        if self.handlers.write().insert(name.clone(), handler).is_some() {
            debug!(action = %name, "action handler replaced");
        }
    }

    pub fn register_alert_handler(&self, handler: AlertHandler) {
        self.alert_handlers.write().push(handler);
    }

    pub fn has_action(&self, name: &str) -> bool {
        self.handlers.read().contains_key(name)
    }

    /// Registered action names, sorted.
    pub fn action_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Evaluates every limit against the latest snapshot.
    ///
    /// Kinds are visited in the order cpu, memory, disk, network, and limits
    /// of one kind in insertion order. The first handler error ends the check
    /// and is returned. Before the first successful update there is nothing
    /// to check and this returns `Ok`.
    pub async fn check(&self) -> Result<()> {
        let Some(usage) = self.meter.current() else {
            return Ok(());
        };
        let limits = self.limits();
        let handlers = self.handlers.read().clone();

        for kind in ResourceKind::ALL {
            let Some(list) = limits.get(&kind) else {
                continue;
            };
            let current = current_value(kind, &usage);
            for limit in list {
                if current <= limit.value {
                    continue;
                }
                let Some(handler) = handlers.get(&limit.action) else {
                    if limit.action != actions::NONE {
                        debug!(kind = %kind, action = %limit.action, "no handler for action, skipped");
                    }
                    continue;
                };
                handler(Breach {
                    kind,
                    limit: limit.clone(),
                    current,
                    usage: usage.clone(),
                })
                .await?;
            }
        }
        Ok(())
    }
}
