// Server side: inbound request dispatch and answer publishing
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::envelope::{self, MessageKind};
use crate::transport::{Message, MessageHandler, Transport};
use crate::{Result, TidewireError};

/// A decoded request as seen by a handler.
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingRequest {
    pub id: u32,
    pub method: String,
    pub data: Value,
    /// Subject the request arrived on
    pub subject: String,
}

impl IncomingRequest {
    /// Deserializes the payload into a concrete type.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.data.clone()).map_err(|e| TidewireError::Decoding(e.to_string()))
    }
}

/// Answers one request. Clones share the answered flag.
///
/// Only the first `accept`/`reject` is published; later calls are logged and
/// ignored. Dropping every clone without answering lets the requester time out.
#[derive(Clone)]
pub struct ReplyHandle {
    id: u32,
    method: String,
    reply_to: Option<String>,
    transport: Arc<dyn Transport>,
    answered: Arc<AtomicBool>,
}

impl ReplyHandle {
    fn new(id: u32, method: String, reply_to: Option<String>, transport: Arc<dyn Transport>) -> Self {
        Self {
            id,
            method,
            reply_to,
            transport,
            answered: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn is_answered(&self) -> bool {
        self.answered.load(Ordering::SeqCst)
    }

    /// Publishes a success response.
    ///
    /// An unserializable payload is returned as an error and does not count as
    /// an answer, so the handler can still `reject`.
    pub fn accept<P: Serialize + ?Sized>(&self, payload: &P) -> Result<()> {
        let bytes = envelope::encode_response_ok(self.id, payload)?;
        self.send(bytes, "accept")
    }

    /// Publishes an error response.
    pub fn reject(&self, code: i32, reason: &str) -> Result<()> {
        let bytes = envelope::encode_response_err(self.id, code, reason)?;
        self.send(bytes, "reject")
    }

    fn send(&self, bytes: Vec<u8>, outcome: &'static str) -> Result<()> {
        if self.answered.swap(true, Ordering::SeqCst) {
            warn!(target: "responder", id = self.id, method = %self.method, outcome, "Request already answered; ignoring");
            return Ok(());
        }
        let Some(reply_to) = &self.reply_to else {
            warn!(target: "responder", id = self.id, method = %self.method, outcome, "Request carries no reply address; dropping answer");
            return Ok(());
        };
        debug!(target: "responder", id = self.id, method = %self.method, outcome, reply = %reply_to, "Send response");
        self.transport.publish(Message::new(reply_to.clone(), bytes))
    }
}

impl std::fmt::Debug for ReplyHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplyHandle")
            .field("id", &self.id)
            .field("method", &self.method)
            .field("reply_to", &self.reply_to)
            .field("answered", &self.is_answered())
            .finish()
    }
}

/// Pluggable request handler; any `Fn(IncomingRequest, ReplyHandle)` qualifies.
///
/// Runs on the transport's delivery task for its subject: long work should be
/// moved to a spawned task carrying the `ReplyHandle`.
pub trait RequestHandler: Send + Sync + 'static {
    fn handle(&self, request: IncomingRequest, reply: ReplyHandle);
}

impl<F> RequestHandler for F
where
    F: Fn(IncomingRequest, ReplyHandle) + Send + Sync + 'static,
{
    fn handle(&self, request: IncomingRequest, reply: ReplyHandle) {
        self(request, reply)
    }
}

/// Decodes inbound requests on one subject and dispatches them to a handler.
pub struct Responder {
    subject: String,
    transport: Arc<dyn Transport>,
    handler: Arc<dyn RequestHandler>,
}

impl Responder {
    pub fn new(subject: impl Into<String>, transport: Arc<dyn Transport>, handler: Arc<dyn RequestHandler>) -> Self {
        Self {
            subject: subject.into(),
            transport,
            handler,
        }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn handle_message(&self, msg: Message) {
        match envelope::classify(&msg.data) {
            Ok(MessageKind::Request) => {}
            Ok(kind) => {
                debug!(target: "responder", subject = %msg.subject, ?kind, "Ignoring non-request message");
                return;
            }
            Err(e) => {
                error!(target: "responder", subject = %msg.subject, error = %e, "Dropping malformed message");
                return;
            }
        }
        let request = match envelope::decode_request(&msg.data) {
            Ok(request) => request,
            Err(e) => {
                error!(target: "responder", subject = %msg.subject, error = %e, "Dropping undecodable request");
                return;
            }
        };
        debug!(target: "responder", id = request.id, method = %request.method, subject = %msg.subject, "Got request");

        let reply = ReplyHandle::new(
            request.id,
            request.method.clone(),
            msg.reply,
            Arc::clone(&self.transport),
        );
        self.handler.handle(
            IncomingRequest {
                id: request.id,
                method: request.method,
                data: request.data,
                subject: msg.subject,
            },
            reply,
        );
    }

    pub fn into_message_handler(self: Arc<Self>) -> MessageHandler {
        Arc::new(move |msg| self.handle_message(msg))
    }
}
