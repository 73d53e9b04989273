use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use tracing::{debug, error};

use crate::envelope::{self, MessageKind, Notification};
use crate::lifecycle::{self, LifecycleEvent, LifecycleRelay, ListenerId};
use crate::transport::{Message, MessageHandler, Transport};
use crate::Result;

/// Callback for received notifications: `(notification, subject)`.
pub type NotificationHandler = Arc<dyn Fn(Notification, &str) + Send + Sync>;

/// Publishes notifications on one subject; no reply is expected or possible.
///
/// Every plain subscriber of the subject receives each notification; among
/// subscribers sharing a consumer group only one does. The group recorded here
/// is the node's queue group and is informational on the publishing side.
pub struct Broadcaster {
    subject: String,
    group: Option<String>,
    transport: Arc<dyn Transport>,
    events: Arc<LifecycleRelay>,
    relay_listener: Mutex<Option<ListenerId>>,
}

impl Broadcaster {
    pub fn new(transport: Arc<dyn Transport>, subject: impl Into<String>, group: Option<String>) -> Self {
        let subject = subject.into();
        let events = Arc::new(LifecycleRelay::new());
        let relay_listener = transport
            .lifecycle()
            .subscribe(lifecycle::forwarder("broadcaster", subject.clone(), &events));
        Self {
            subject,
            group,
            transport,
            events,
            relay_listener: Mutex::new(Some(relay_listener)),
        }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn group(&self) -> Option<&str> {
        self.group.as_deref()
    }

    /// Encodes and publishes a notification. Nothing is published when the
    /// payload cannot be encoded.
    pub fn say<P: Serialize + ?Sized>(&self, method: &str, payload: &P) -> Result<()> {
        let bytes = envelope::encode_notification(method, payload).map_err(|e| {
            error!(target: "broadcaster", method, error = %e, "Failed to encode notification");
            e
        })?;
        debug!(
            target: "broadcaster",
            method,
            subject = %self.subject,
            queue = self.group.as_deref().unwrap_or(""),
            "Send notification"
        );
        self.transport.publish(Message::new(self.subject.clone(), bytes))
    }

    pub fn on_event<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&LifecycleEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(listener)
    }

    pub fn off_event(&self, id: ListenerId) -> bool {
        self.events.unsubscribe(id)
    }

    /// Detaches from the transport lifecycle relay. Dropping the broadcaster
    /// does the same.
    pub fn close(&self) {
        let listener = self
            .relay_listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(id) = listener {
            self.transport.lifecycle().unsubscribe(id);
        }
    }
}

impl Drop for Broadcaster {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Broadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broadcaster")
            .field("subject", &self.subject)
            .field("group", &self.group)
            .finish()
    }
}

/// Wraps a notification callback into a transport handler that drops
/// everything except well-formed notifications.
pub fn notification_listener(handler: NotificationHandler) -> MessageHandler {
    Arc::new(move |msg: Message| {
        match envelope::classify(&msg.data) {
            Ok(MessageKind::Notification) => {}
            Ok(kind) => {
                debug!(target: "broadcaster", subject = %msg.subject, ?kind, "Ignoring non-notification message");
                return;
            }
            Err(e) => {
                error!(target: "broadcaster", subject = %msg.subject, error = %e, "Dropping malformed message");
                return;
            }
        }
        match envelope::decode_notification(&msg.data) {
            Ok(notification) => {
                debug!(target: "broadcaster", subject = %msg.subject, method = %notification.method, "Got notification");
                handler(notification, &msg.subject);
            }
            Err(e) => {
                error!(target: "broadcaster", subject = %msg.subject, error = %e, "Dropping undecodable notification");
            }
        }
    })
}
