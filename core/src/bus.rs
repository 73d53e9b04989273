// In-process transport implementation
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::lifecycle::{LifecycleEvent, LifecycleRelay};
use crate::transport::{subject_matches, Message, MessageHandler, SubscriptionHandle, Transport};
use crate::{Result, TidewireError};

/// Subscription information
#[derive(Debug, Clone)]
struct Subscription {
    id: String,
    group: Option<String>,
    sender: mpsc::UnboundedSender<Message>,
}

/// Per-subject bus statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BusStats {
    pub total_published: u64,
    pub total_delivered: u64,
    pub active_subscriptions: usize,
    pub dropped_messages: u64,
}

/// In-memory pub-sub bus implementing [`Transport`].
///
/// Every subscription owns an unbounded queue drained by its own tokio task,
/// so handlers of one subscription run in order while subscriptions run
/// concurrently. Group members share a round-robin cursor.
pub struct MemoryBus {
    // Subject pattern -> subscriber list
    subscriptions: Arc<DashMap<String, Vec<Subscription>>>,

    // Statistics keyed by published subject or subscribed pattern
    stats: Arc<DashMap<String, BusStats>>,

    lifecycle: Arc<LifecycleRelay>,
    group_cursor: AtomicUsize,
    closed: AtomicBool,
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBus {
    pub fn new() -> Self {
        Self {
            subscriptions: Arc::new(DashMap::new()),
            stats: Arc::new(DashMap::new()),
            lifecycle: Arc::new(LifecycleRelay::new()),
            group_cursor: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Marks the bus open and signals `connect` to lifecycle listeners.
    pub fn connect(&self) {
        self.closed.store(false, Ordering::SeqCst);
        info!(target: "memory_bus", "Memory bus connected");
        self.lifecycle.emit(&LifecycleEvent::Connected);
    }

    /// Signals a transport error without closing the bus.
    pub fn report_error(&self, code: i32, reason: &str) {
        warn!(target: "memory_bus", code, reason, "Transport error reported");
        self.lifecycle.emit(&LifecycleEvent::Error {
            code,
            reason: reason.to_string(),
        });
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Get stats
    pub fn get_stats(&self, subject: &str) -> Option<BusStats> {
        self.stats.get(subject).map(|s| s.clone())
    }

    fn update_stats<F>(&self, subject: &str, f: F)
    where
        F: FnOnce(&mut BusStats),
    {
        f(self
            .stats
            .entry(subject.to_string())
            .or_default()
            .value_mut());
    }

    fn register(
        &self,
        subject: &str,
        group: Option<&str>,
        handler: MessageHandler,
    ) -> Result<SubscriptionHandle> {
        if self.is_closed() {
            return Err(TidewireError::Transport("connection closed".into()));
        }
        let subscription_id = format!("sub_{}_{}", subject, uuid::Uuid::new_v4().simple());
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                handler(msg);
            }
        });

        self.subscriptions
            .entry(subject.to_string())
            .or_default()
            .push(Subscription {
                id: subscription_id.clone(),
                group: group.map(str::to_string),
                sender: tx,
            });

        self.update_stats(subject, |stats| {
            stats.active_subscriptions += 1;
        });

        info!(
            target: "memory_bus",
            subscription = %subscription_id,
            subject,
            group = group.unwrap_or(""),
            "Created subscription"
        );
        Ok(SubscriptionHandle {
            id: subscription_id,
            subject: subject.to_string(),
            group: group.map(str::to_string),
        })
    }
}

#[async_trait]
impl Transport for MemoryBus {
    fn publish(&self, message: Message) -> Result<()> {
        if self.is_closed() {
            return Err(TidewireError::Transport("connection closed".into()));
        }
        debug!(target: "memory_bus", subject = %message.subject, reply = ?message.reply, bytes = message.data.len(), "Publishing message");

        let mut targets: Vec<mpsc::UnboundedSender<Message>> = Vec::new();
        let mut groups: HashMap<String, Vec<mpsc::UnboundedSender<Message>>> = HashMap::new();
        for entry in self.subscriptions.iter() {
            if !subject_matches(entry.key(), &message.subject) {
                continue;
            }
            for sub in entry.value() {
                match &sub.group {
                    Some(group) => groups
                        .entry(group.clone())
                        .or_default()
                        .push(sub.sender.clone()),
                    None => targets.push(sub.sender.clone()),
                }
            }
        }
        for members in groups.into_values() {
            let pick = self.group_cursor.fetch_add(1, Ordering::Relaxed) % members.len();
            targets.push(members[pick].clone());
        }

        let mut delivered = 0;
        let mut dropped = 0;
        for sender in targets {
            if sender.send(message.clone()).is_ok() {
                delivered += 1;
            } else {
                dropped += 1;
            }
        }
        if delivered == 0 && dropped == 0 {
            debug!(target: "memory_bus", subject = %message.subject, "No subscriptions for subject");
        }

        self.update_stats(&message.subject, |stats| {
            stats.total_published += 1;
            stats.total_delivered += delivered;
            stats.dropped_messages += dropped;
        });
        Ok(())
    }

    async fn subscribe(&self, subject: &str, handler: MessageHandler) -> Result<SubscriptionHandle> {
        self.register(subject, None, handler)
    }

    async fn group_subscribe(
        &self,
        subject: &str,
        group: &str,
        handler: MessageHandler,
    ) -> Result<SubscriptionHandle> {
        self.register(subject, Some(group), handler)
    }

    async fn unsubscribe(&self, handle: &SubscriptionHandle) -> Result<()> {
        let mut removed = false;
        if let Some(mut subs) = self.subscriptions.get_mut(&handle.subject) {
            let before = subs.len();
            subs.retain(|sub| sub.id != handle.id);
            removed = subs.len() != before;
        }
        self.subscriptions
            .remove_if(&handle.subject, |_, subs| subs.is_empty());

        if removed {
            self.update_stats(&handle.subject, |stats| {
                stats.active_subscriptions = stats.active_subscriptions.saturating_sub(1);
            });
            info!(target: "memory_bus", subscription = %handle.id, "Unsubscribed");
        }
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        // Subscriptions are registered synchronously in `register`.
        Ok(())
    }

    async fn close(&self, code: i32, reason: &str) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!(target: "memory_bus", code, reason, "Memory bus closing");
        // Dropping the senders ends every dispatch task.
        self.subscriptions.clear();
        self.lifecycle.emit(&LifecycleEvent::Closed {
            code,
            reason: reason.to_string(),
        });
        Ok(())
    }

    fn lifecycle(&self) -> Arc<LifecycleRelay> {
        Arc::clone(&self.lifecycle)
    }
}
