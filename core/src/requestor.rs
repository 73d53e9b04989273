use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};

use crate::config::TidewireConfig;
use crate::envelope::{self, MessageKind};
use crate::future::{Outcome, ReplyFuture};
use crate::lifecycle::{self, LifecycleEvent, LifecycleRelay, ListenerId};
use crate::telemetry::{RequestorStats, StatsSnapshot};
use crate::transaction::{Transaction, TransactionTable};
use crate::transport::{Message, MessageHandler, SubscriptionHandle, Transport};
use crate::{Result, RpcError, TidewireError};

/// Timeout applied to new transactions unless configured otherwise.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Client side of the protocol, bound to one target subject.
///
/// Every requestor owns a private reply subject and a [`TransactionTable`].
/// Each request settles exactly once: with the correlated response, with a
/// timeout error when its timer fires first, or with a "closed" error when the
/// requestor is closed while the request is still pending.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use serde_json::json;
/// use tidewire_core::{MemoryBus, Tidewire, TidewireConfig};
///
/// # async fn example() -> tidewire_core::Result<()> {
/// let node = Tidewire::new(Arc::new(MemoryBus::new()), TidewireConfig::default());
/// let requestor = node.new_requestor("channel.aaa.test1").await?;
///
/// requestor.async_request("offer", &json!({"sdp": "dummy-sdp1"}))?.then(
///     |answer| println!("offer success: {answer}"),
///     |err| println!("offer reject: {} => {}", err.code, err.reason),
/// );
///
/// match requestor.async_request("offer", &json!({"sdp": "dummy-sdp2"}))?.await {
///     Ok(answer) => println!("offer success: {answer}"),
///     Err(err) => println!("offer reject: {err}"),
/// }
/// requestor.close().await;
/// # Ok(())
/// # }
/// ```
pub struct Requestor {
    subject: String,
    reply_subject: String,
    transport: Arc<dyn Transport>,
    table: Arc<TransactionTable>,
    stats: Arc<RequestorStats>,
    timeout_nanos: AtomicU64,
    events: Arc<LifecycleRelay>,
    relay_listener: Mutex<Option<ListenerId>>,
    reply_subscription: Mutex<Option<SubscriptionHandle>>,
    runtime: Handle,
    closed: AtomicBool,
}

impl Requestor {
    /// Creates a requestor and registers its reply subscription.
    ///
    /// Must run inside a tokio runtime; transaction timers are spawned on it.
    pub async fn new(
        transport: Arc<dyn Transport>,
        subject: impl Into<String>,
        config: &TidewireConfig,
    ) -> Result<Self> {
        let subject = subject.into();
        let runtime = Handle::try_current()
            .map_err(|e| TidewireError::Transport(format!("requestor needs a tokio runtime: {e}")))?;
        let reply_subject = format!("{}{}", config.reply_prefix, uuid::Uuid::new_v4().simple());

        let table = Arc::new(TransactionTable::new());
        let stats = Arc::new(RequestorStats::new());

        let handler: MessageHandler = {
            let table = Arc::clone(&table);
            let stats = Arc::clone(&stats);
            Arc::new(move |msg: Message| Self::on_reply(&table, &stats, msg))
        };
        let reply_subscription = match &config.queue_group {
            Some(group) => transport.group_subscribe(&reply_subject, group, handler).await?,
            None => transport.subscribe(&reply_subject, handler).await?,
        };
        if let Err(e) = transport.flush().await {
            if let Err(unsub) = transport.unsubscribe(&reply_subscription).await {
                warn!(target: "requestor", error = %unsub, "Failed to drop reply subscription");
            }
            return Err(e);
        }

        let events = Arc::new(LifecycleRelay::new());
        let relay_listener = transport
            .lifecycle()
            .subscribe(lifecycle::forwarder("requestor", subject.clone(), &events));

        info!(target: "requestor", subject = %subject, reply = %reply_subject, "Requestor created");
        Ok(Self {
            subject,
            reply_subject,
            transport,
            table,
            stats,
            timeout_nanos: AtomicU64::new(duration_nanos(config.request_timeout())),
            events,
            relay_listener: Mutex::new(Some(relay_listener)),
            reply_subscription: Mutex::new(Some(reply_subscription)),
            runtime,
            closed: AtomicBool::new(false),
        })
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn reply_subject(&self) -> &str {
        &self.reply_subject
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_nanos(self.timeout_nanos.load(Ordering::SeqCst))
    }

    /// Changes the timeout of transactions created from now on; pending ones
    /// keep the timer they were started with.
    pub fn set_request_timeout(&self, timeout: Duration) -> &Self {
        self.timeout_nanos
            .store(duration_nanos(timeout), Ordering::SeqCst);
        self
    }

    pub fn pending_count(&self) -> usize {
        self.table.len()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Listen to transport lifecycle events relayed to this requestor.
    pub fn on_event<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&LifecycleEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(listener)
    }

    pub fn off_event(&self, id: ListenerId) -> bool {
        self.events.unsubscribe(id)
    }

    /// Sends a request and returns its correlation id without waiting.
    ///
    /// Exactly one of `on_success` / `on_failure` will be called later, from a
    /// transport or timer task. Encoding and publish failures are returned here
    /// and neither callback is called. A request racing [`Requestor::close`]
    /// either returns [`TidewireError::Closed`] or is rejected with a closed
    /// error.
    pub fn request<P, S, F>(&self, method: &str, payload: &P, on_success: S, on_failure: F) -> Result<u32>
    where
        P: Serialize + ?Sized,
        S: FnOnce(Value) + Send + 'static,
        F: FnOnce(RpcError) + Send + 'static,
    {
        if self.is_closed() {
            return Err(TidewireError::Closed(format!("requestor for {}", self.subject)));
        }

        let id = self.table.allocate_id();
        let bytes = envelope::encode_request(id, method, payload).map_err(|e| {
            error!(target: "requestor", method, error = %e, "Failed to encode request");
            e
        })?;

        let timeout = self.request_timeout();
        let transaction = Transaction::new(id, method, Box::new(on_success), Box::new(on_failure));
        self.table.insert(transaction, |id| {
            let table = Arc::clone(&self.table);
            let stats = Arc::clone(&self.stats);
            self.runtime.spawn(async move {
                tokio::time::sleep(timeout).await;
                if let Some(transaction) = table.expire(id) {
                    debug!(target: "requestor", id, method = %transaction.method, "Request timeout");
                    stats.record_timed_out();
                    let reason = format!(
                        "Request timeout {:.3}s transaction[{}], method[{}]",
                        timeout.as_secs_f64(),
                        id,
                        transaction.method
                    );
                    transaction.fail(RpcError::timeout(reason));
                }
            })
        })?;

        debug!(target: "requestor", id, method, subject = %self.subject, "Send request");
        let message = Message::new(self.subject.clone(), bytes).with_reply(self.reply_subject.clone());
        if let Err(e) = self.transport.publish(message) {
            // Never reached the wire: withdraw silently and report to the caller.
            if self.table.take(id).is_none() {
                // A concurrent close already settled it through the callbacks.
                warn!(target: "requestor", id, method, error = %e, "Publish failed after transaction settled");
                return Ok(id);
            }
            warn!(target: "requestor", id, method, error = %e, "Failed to publish request");
            return Err(e);
        }
        self.stats.record_sent();
        Ok(id)
    }

    /// Sends a request whose outcome is delivered through a [`ReplyFuture`].
    pub fn async_request<P>(&self, method: &str, payload: &P) -> Result<ReplyFuture>
    where
        P: Serialize + ?Sized,
    {
        let future = ReplyFuture::new();
        let on_success = future.clone();
        let on_failure = future.clone();
        let method_name = method.to_string();
        self.request(
            method,
            payload,
            move |data| {
                debug!(target: "requestor", method = %method_name, "Future accept");
                on_success.resolve(data);
            },
            move |err| {
                debug!(target: "requestor", code = err.code, reason = %err.reason, "Future reject");
                on_failure.reject(err);
            },
        )?;
        Ok(future)
    }

    /// Sends a request and blocks the calling thread until it settles.
    ///
    /// Local send failures come back as an [`RpcError`] of kind
    /// [`crate::RejectKind::Local`]. Call from a plain thread or
    /// `spawn_blocking`, never from a task the runtime needs to make progress.
    pub fn sync_request<P>(&self, method: &str, payload: &P) -> Outcome
    where
        P: Serialize + ?Sized,
    {
        match self.async_request(method, payload) {
            Ok(future) => future.wait(),
            Err(e) => Err(RpcError::local(&e)),
        }
    }

    fn on_reply(table: &TransactionTable, stats: &RequestorStats, msg: Message) {
        debug!(target: "requestor", subject = %msg.subject, bytes = msg.data.len(), "Got response");
        let response = match envelope::classify(&msg.data) {
            Ok(MessageKind::Response) => match envelope::decode_response(&msg.data) {
                Ok(response) => response,
                Err(e) => {
                    error!(target: "requestor", error = %e, "Dropping undecodable response");
                    return;
                }
            },
            Ok(kind) => {
                warn!(target: "requestor", ?kind, "Dropping non-response message on reply subject");
                return;
            }
            Err(e) => {
                error!(target: "requestor", error = %e, "Dropping malformed message");
                return;
            }
        };

        let Some(transaction) = table.take(response.id) else {
            stats.record_unmatched();
            warn!(target: "requestor", error = %TidewireError::UnmatchedResponse(response.id), "Dropping response");
            return;
        };
        match response.into_result() {
            Ok(data) => {
                stats.record_resolved();
                transaction.succeed(data);
            }
            Err(err) => {
                stats.record_rejected_remote();
                transaction.fail(err);
            }
        }
    }

    /// Detaches from the transport and rejects every pending transaction with
    /// a closed error. Later calls are no-ops.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.detach() {
            if let Err(e) = self.transport.unsubscribe(&handle).await {
                warn!(target: "requestor", error = %e, "Failed to drop reply subscription");
            }
        }
        self.reject_pending();
        debug!(
            target: "requestor",
            subject = %self.subject,
            transport_listeners = self.transport.lifecycle().listener_count(),
            "Requestor closed"
        );
    }

    // Drops the relay listener and hands back the reply subscription.
    fn detach(&self) -> Option<SubscriptionHandle> {
        let listener = self
            .relay_listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(id) = listener {
            self.transport.lifecycle().unsubscribe(id);
        }
        self.reply_subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn reject_pending(&self) {
        let pending = self.table.drain();
        self.stats.record_closed(pending.len() as u64);
        for transaction in pending {
            let reason = format!(
                "Requestor closed, transaction[{}], method[{}]",
                transaction.id, transaction.method
            );
            transaction.fail(RpcError::closed(reason));
        }
    }
}

impl Drop for Requestor {
    fn drop(&mut self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(target: "requestor", subject = %self.subject, "Requestor dropped without close");
        let subscription = self.detach();
        self.reject_pending();
        if let Some(handle) = subscription {
            let transport = Arc::clone(&self.transport);
            self.runtime.spawn(async move {
                if let Err(e) = transport.unsubscribe(&handle).await {
                    warn!(target: "requestor", error = %e, "Failed to drop reply subscription");
                }
            });
        }
    }
}

impl std::fmt::Debug for Requestor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Requestor")
            .field("subject", &self.subject)
            .field("reply_subject", &self.reply_subject)
            .field("pending", &self.table.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn duration_nanos(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}
