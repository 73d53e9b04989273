// Connection lifecycle fan-out
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Transport-level connection signal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecycleEvent {
    Connected,
    Closed { code: i32, reason: String },
    Error { code: i32, reason: String },
}

impl LifecycleEvent {
    pub fn name(&self) -> &'static str {
        match self {
            LifecycleEvent::Connected => "connect",
            LifecycleEvent::Closed { .. } => "close",
            LifecycleEvent::Error { .. } => "error",
        }
    }
}

pub type LifecycleListener = Arc<dyn Fn(&LifecycleEvent) + Send + Sync>;

/// Handle returned by [`LifecycleRelay::subscribe`], used to deregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Fan-out of lifecycle events to an open set of listeners.
///
/// Each transport owns one relay; every requestor and broadcaster owns another
/// one for its own listeners and forwards the transport's events into it.
#[derive(Default)]
pub struct LifecycleRelay {
    listeners: DashMap<u64, LifecycleListener>,
    next_id: AtomicU64,
}

impl LifecycleRelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&LifecycleEvent) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.insert(id, Arc::new(listener));
        ListenerId(id)
    }

    /// Returns `false` when the listener was already removed.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.listeners.remove(&id.0).is_some()
    }

    pub fn emit(&self, event: &LifecycleEvent) {
        // Snapshot first so listeners may (un)subscribe while being called.
        let listeners: Vec<LifecycleListener> =
            self.listeners.iter().map(|e| Arc::clone(e.value())).collect();
        debug!(target: "lifecycle", event = event.name(), listeners = listeners.len(), "Emitting lifecycle event");
        for listener in listeners {
            listener(event);
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }
}

/// Builds the listener a component registers on the transport relay: logs the
/// event and re-emits it into the component's own relay while that still exists.
pub(crate) fn forwarder(
    component: &'static str,
    subject: String,
    local: &Arc<LifecycleRelay>,
) -> impl Fn(&LifecycleEvent) + Send + Sync + 'static {
    let local = Arc::downgrade(local);
    move |event| {
        match event {
            LifecycleEvent::Connected => {
                info!(target: "lifecycle", component, subject = %subject, "Transport connected")
            }
            LifecycleEvent::Closed { code, reason } => {
                info!(target: "lifecycle", component, subject = %subject, code, reason = %reason, "Transport closed")
            }
            LifecycleEvent::Error { code, reason } => {
                warn!(target: "lifecycle", component, subject = %subject, code, reason = %reason, "Transport got error")
            }
        }
        if let Some(local) = local.upgrade() {
            local.emit(event);
        }
    }
}

impl std::fmt::Debug for LifecycleRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleRelay")
            .field("listeners", &self.listeners.len())
            .finish()
    }
}
