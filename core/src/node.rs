use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{info, warn};

use crate::broadcaster::{notification_listener, Broadcaster};
use crate::config::TidewireConfig;
use crate::envelope::Notification;
use crate::lifecycle::LifecycleRelay;
use crate::requestor::Requestor;
use crate::responder::{RequestHandler, Responder};
use crate::transport::{MessageHandler, SubscriptionHandle, Transport};
use crate::{Result, TidewireError};

/// Connection-level hub.
///
/// Owns the shared transport handle and the node configuration, and creates
/// the protocol endpoints on top of it. With a queue group configured, every
/// subscription made through the node is a group subscription, so request
/// handling and notification delivery are load-shared across node instances.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use serde_json::json;
/// use tidewire_core::{IncomingRequest, MemoryBus, ReplyHandle, Tidewire, TidewireConfig};
///
/// # async fn example() -> tidewire_core::Result<()> {
/// let node = Tidewire::new(Arc::new(MemoryBus::new()), TidewireConfig::default());
/// node.on_request("channel", |req: IncomingRequest, reply: ReplyHandle| {
///     if req.method == "offer" {
///         let _ = reply.accept(&json!({"sdp": "answer"}));
///     } else {
///         let _ = reply.reject(404, "Not found");
///     }
/// })
/// .await?;
/// node.on_broadcast("even1", |n, subject| println!("{subject}: {}", n.method)).await?;
/// # Ok(())
/// # }
/// ```
pub struct Tidewire {
    transport: Arc<dyn Transport>,
    config: TidewireConfig,
    // Subject -> responder subscription
    responders: DashMap<String, SubscriptionHandle>,
}

impl Tidewire {
    pub fn new(transport: Arc<dyn Transport>, config: TidewireConfig) -> Self {
        info!(
            target: "tidewire",
            queue = config.queue_group.as_deref().unwrap_or(""),
            timeout_ms = config.request_timeout_ms,
            "Node created"
        );
        Self {
            transport,
            config,
            responders: DashMap::new(),
        }
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        Arc::clone(&self.transport)
    }

    pub fn config(&self) -> &TidewireConfig {
        &self.config
    }

    pub fn queue_group(&self) -> Option<&str> {
        self.config.queue_group.as_deref()
    }

    pub fn lifecycle(&self) -> Arc<LifecycleRelay> {
        self.transport.lifecycle()
    }

    pub async fn new_requestor(&self, subject: impl Into<String>) -> Result<Requestor> {
        Requestor::new(Arc::clone(&self.transport), subject, &self.config).await
    }

    pub fn new_broadcaster(&self, subject: impl Into<String>) -> Broadcaster {
        Broadcaster::new(
            Arc::clone(&self.transport),
            subject,
            self.config.queue_group.clone(),
        )
    }

    async fn subscribe(&self, subject: &str, handler: MessageHandler) -> Result<SubscriptionHandle> {
        let handle = match &self.config.queue_group {
            Some(group) => self.transport.group_subscribe(subject, group, handler).await?,
            None => self.transport.subscribe(subject, handler).await?,
        };
        self.transport.flush().await?;
        Ok(handle)
    }

    /// Registers the single request handler of `subject`.
    ///
    /// A second registration for the same subject fails with
    /// [`TidewireError::DuplicateHandler`] until [`Tidewire::off_request`].
    pub async fn on_request<H: RequestHandler>(&self, subject: &str, handler: H) -> Result<SubscriptionHandle> {
        if self.responders.contains_key(subject) {
            return Err(TidewireError::DuplicateHandler(subject.to_string()));
        }
        let responder = Arc::new(Responder::new(
            subject,
            Arc::clone(&self.transport),
            Arc::new(handler),
        ));
        let handle = self.subscribe(subject, responder.into_message_handler()).await?;

        // Another registration may have won while we were subscribing.
        let raced = match self.responders.entry(subject.to_string()) {
            Entry::Occupied(_) => true,
            Entry::Vacant(slot) => {
                slot.insert(handle.clone());
                false
            }
        };
        if raced {
            self.transport.unsubscribe(&handle).await?;
            return Err(TidewireError::DuplicateHandler(subject.to_string()));
        }
        info!(target: "tidewire", subject, "Request handler registered");
        Ok(handle)
    }

    /// Removes the request handler of `subject`; `false` if there was none.
    pub async fn off_request(&self, subject: &str) -> Result<bool> {
        let Some((_, handle)) = self.responders.remove(subject) else {
            return Ok(false);
        };
        self.transport.unsubscribe(&handle).await?;
        Ok(true)
    }

    /// Listens for notifications on `subject`; any number of listeners allowed.
    pub async fn on_broadcast<F>(&self, subject: &str, handler: F) -> Result<SubscriptionHandle>
    where
        F: Fn(Notification, &str) + Send + Sync + 'static,
    {
        self.subscribe(subject, notification_listener(Arc::new(handler)))
            .await
    }

    pub async fn unsubscribe(&self, handle: &SubscriptionHandle) -> Result<()> {
        self.responders.remove_if(&handle.subject, |_, h| h == handle);
        self.transport.unsubscribe(handle).await
    }

    /// Drops every request handler and closes the transport, which signals
    /// `close` to every requestor and broadcaster.
    pub async fn close(&self, code: i32, reason: &str) -> Result<()> {
        let handles: Vec<SubscriptionHandle> = self.responders.iter().map(|e| e.value().clone()).collect();
        self.responders.clear();
        for handle in handles {
            if let Err(e) = self.transport.unsubscribe(&handle).await {
                warn!(target: "tidewire", subject = %handle.subject, error = %e, "Failed to drop request handler");
            }
        }
        self.transport.close(code, reason).await
    }
}
