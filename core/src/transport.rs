// Publish-subscribe transport contract consumed by the protocol layer
use std::sync::Arc;

use async_trait::async_trait;

use crate::lifecycle::LifecycleRelay;
use crate::Result;

/// One transport message: body plus optional per-message reply address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub subject: String,
    pub reply: Option<String>,
    pub data: Vec<u8>,
}

impl Message {
    pub fn new(subject: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            subject: subject.into(),
            reply: None,
            data,
        }
    }

    pub fn with_reply(mut self, reply: impl Into<String>) -> Self {
        self.reply = Some(reply.into());
        self
    }
}

/// Callback invoked by the transport for each delivered message.
pub type MessageHandler = Arc<dyn Fn(Message) + Send + Sync>;

/// Returned by subscribe calls; pass back to [`Transport::unsubscribe`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    pub id: String,
    pub subject: String,
    pub group: Option<String>,
}

/// Pub-sub transport.
///
/// `publish` only hands the message over and never waits for delivery.
/// Handlers of one subscription are called sequentially; different
/// subscriptions are served concurrently.
#[async_trait]
pub trait Transport: Send + Sync {
    fn publish(&self, message: Message) -> Result<()>;

    async fn subscribe(&self, subject: &str, handler: MessageHandler) -> Result<SubscriptionHandle>;

    /// Each message is delivered to exactly one member of `group`.
    async fn group_subscribe(
        &self,
        subject: &str,
        group: &str,
        handler: MessageHandler,
    ) -> Result<SubscriptionHandle>;

    async fn unsubscribe(&self, handle: &SubscriptionHandle) -> Result<()>;

    /// Returns once every previous subscription is registered.
    async fn flush(&self) -> Result<()>;

    async fn close(&self, code: i32, reason: &str) -> Result<()>;

    fn lifecycle(&self) -> Arc<LifecycleRelay>;
}

/// NATS-style subject matching: `*` matches one token, a trailing `>` matches
/// one or more tokens.
///
/// # Examples
///
/// ```
/// use tidewire_core::transport::subject_matches;
///
/// assert!(subject_matches("channel.*.test1", "channel.aaa.test1"));
/// assert!(subject_matches("channel.>", "channel.aaa.test1"));
/// assert!(!subject_matches("channel", "channel.aaa"));
/// assert!(!subject_matches("channel.>", "channel"));
/// ```
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut subject_tokens = subject.split('.');
    for token in pattern.split('.') {
        match token {
            ">" => return subject_tokens.next().is_some(),
            "*" => {
                if subject_tokens.next().is_none() {
                    return false;
                }
            }
            literal => {
                if subject_tokens.next() != Some(literal) {
                    return false;
                }
            }
        }
    }
    subject_tokens.next().is_none()
}
