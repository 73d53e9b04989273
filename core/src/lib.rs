// Tidewire Core Library
// Request/response/notification RPC over publish-subscribe transports

pub mod broadcaster;
pub mod bus;
pub mod config;
pub mod envelope;
pub mod future;
pub mod lifecycle;
pub mod node;
pub mod requestor;
pub mod responder;
pub mod telemetry;
pub mod transaction;
pub mod transport;

// Export core types
pub use broadcaster::{Broadcaster, NotificationHandler};
pub use bus::{BusStats, MemoryBus};
pub use config::TidewireConfig;
pub use envelope::{Inbound, MessageKind, Notification, Request, Response};
pub use future::ReplyFuture;
pub use lifecycle::{LifecycleEvent, LifecycleRelay, ListenerId};
pub use node::Tidewire;
pub use requestor::{Requestor, DEFAULT_REQUEST_TIMEOUT};
pub use responder::{IncomingRequest, ReplyHandle, RequestHandler};
pub use telemetry::{RequestorStats, StatsSnapshot};
pub use transport::{Message, MessageHandler, SubscriptionHandle, Transport};

// Error types
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TidewireError {
    #[error("Encoding error: {0}")]
    Encoding(#[source] serde_json::Error),

    #[error("Decoding error: {0}")]
    Decoding(String),

    #[error("Received response does not match any sent request [id:{0}]")]
    UnmatchedResponse(u32),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Closed: {0}")]
    Closed(String),

    #[error("Handler already registered for subject: {0}")]
    DuplicateHandler(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
pub type Result<T> = std::result::Result<T, TidewireError>;

/// Error code carried by timeout rejections.
pub const TIMEOUT_CODE: i32 = 480;
/// Error code carried by rejections caused by closing the requestor.
pub const CLOSED_CODE: i32 = 499;
/// Error code used when a request fails locally before reaching the wire.
pub const LOCAL_FAILURE_CODE: i32 = 500;

/// Where a request failure came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum RejectKind {
    /// The remote handler answered with `ok=false`
    Remote,
    /// No response arrived before the transaction timer fired
    Timeout,
    /// The owning requestor was closed while the request was pending
    Closed,
    /// Encoding or publishing failed before the request left this process
    Local,
}

/// Uniform `(code, reason)` failure delivered to callbacks and futures.
#[derive(Error, Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[error("[{code}] {reason}")]
pub struct RpcError {
    pub code: i32,
    pub reason: String,
    pub kind: RejectKind,
}

impl RpcError {
    pub fn remote(code: i32, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
            kind: RejectKind::Remote,
        }
    }

    pub fn timeout(reason: impl Into<String>) -> Self {
        Self {
            code: TIMEOUT_CODE,
            reason: reason.into(),
            kind: RejectKind::Timeout,
        }
    }

    pub fn closed(reason: impl Into<String>) -> Self {
        Self {
            code: CLOSED_CODE,
            reason: reason.into(),
            kind: RejectKind::Closed,
        }
    }

    pub fn local(err: &TidewireError) -> Self {
        Self {
            code: LOCAL_FAILURE_CODE,
            reason: err.to_string(),
            kind: RejectKind::Local,
        }
    }

    pub fn is_timeout(&self) -> bool {
        self.kind == RejectKind::Timeout
    }
}
