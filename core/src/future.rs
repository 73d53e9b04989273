// Single-resolution result container shared by async and blocking callers
use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Notify;

use crate::RpcError;

/// Final outcome of a request.
pub type Outcome = std::result::Result<Value, RpcError>;

type OnSuccess = Box<dyn FnOnce(Value) + Send>;
type OnFailure = Box<dyn FnOnce(RpcError) + Send>;

struct Continuation {
    on_success: OnSuccess,
    on_failure: OnFailure,
}

impl Continuation {
    fn run(self, outcome: Outcome) {
        match outcome {
            Ok(value) => (self.on_success)(value),
            Err(err) => (self.on_failure)(err),
        }
    }
}

enum State {
    Pending(Vec<Continuation>),
    Settled(Outcome),
}

struct Inner {
    state: Mutex<State>,
    settled: Condvar,
    notify: Notify,
}

/// Deferred result of an asynchronous request.
///
/// Settles exactly once, either resolved with the response payload or rejected
/// with an [`RpcError`]. Any later `resolve`/`reject` is ignored. Clones share
/// the same state, so the outcome can be consumed by several parties:
///
/// - [`ReplyFuture::wait`] blocks the current thread,
/// - `.await` suspends the current task,
/// - [`ReplyFuture::then`] registers continuations.
///
/// # Examples
///
/// ```
/// use serde_json::json;
/// use tidewire_core::{ReplyFuture, RpcError};
///
/// let future = ReplyFuture::new();
/// assert!(future.resolve(json!({"sdp": "answer"})));
/// assert!(!future.reject(RpcError::remote(500, "late")));
/// assert_eq!(future.wait(), Ok(json!({"sdp": "answer"})));
/// ```
#[derive(Clone)]
pub struct ReplyFuture {
    inner: Arc<Inner>,
}

impl Default for ReplyFuture {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplyFuture {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::Pending(Vec::new())),
                settled: Condvar::new(),
                notify: Notify::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns `true` if this call settled the future.
    pub fn resolve(&self, value: Value) -> bool {
        self.settle(Ok(value))
    }

    /// Returns `true` if this call settled the future.
    pub fn reject(&self, error: RpcError) -> bool {
        self.settle(Err(error))
    }

    fn settle(&self, outcome: Outcome) -> bool {
        let queued = {
            let mut state = self.lock();
            match &mut *state {
                State::Settled(_) => return false,
                State::Pending(queued) => {
                    let queued = std::mem::take(queued);
                    *state = State::Settled(outcome.clone());
                    queued
                }
            }
        };
        self.inner.settled.notify_all();
        self.inner.notify.notify_waiters();
        for continuation in queued {
            continuation.run(outcome.clone());
        }
        true
    }

    /// Registers continuations and returns the future for call-site chaining.
    ///
    /// Continuations registered before settlement run in registration order on
    /// the settling thread; registered afterwards they run immediately.
    pub fn then<S, F>(&self, on_success: S, on_failure: F) -> &Self
    where
        S: FnOnce(Value) + Send + 'static,
        F: FnOnce(RpcError) + Send + 'static,
    {
        let continuation = Continuation {
            on_success: Box::new(on_success),
            on_failure: Box::new(on_failure),
        };
        let outcome = {
            let mut state = self.lock();
            match &mut *state {
                State::Pending(queued) => {
                    queued.push(continuation);
                    return self;
                }
                State::Settled(outcome) => outcome.clone(),
            }
        };
        continuation.run(outcome);
        self
    }

    pub fn try_outcome(&self) -> Option<Outcome> {
        match &*self.lock() {
            State::Pending(_) => None,
            State::Settled(outcome) => Some(outcome.clone()),
        }
    }

    pub fn is_settled(&self) -> bool {
        self.try_outcome().is_some()
    }

    /// Blocks the calling thread until the future settles.
    ///
    /// Must not be called from inside an async task of a current-thread
    /// runtime that is also responsible for settling it.
    pub fn wait(&self) -> Outcome {
        let mut state = self.lock();
        loop {
            if let State::Settled(outcome) = &*state {
                return outcome.clone();
            }
            state = self
                .inner
                .settled
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Like [`ReplyFuture::wait`], giving up after `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Outcome> {
        let state = self.lock();
        let (state, _) = self
            .inner
            .settled
            .wait_timeout_while(state, timeout, |s| matches!(s, State::Pending(_)))
            .unwrap_or_else(PoisonError::into_inner);
        match &*state {
            State::Pending(_) => None,
            State::Settled(outcome) => Some(outcome.clone()),
        }
    }

    /// Suspends the current task until the future settles.
    pub async fn settled(&self) -> Outcome {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a concurrent settle cannot be missed.
            notified.as_mut().enable();
            if let Some(outcome) = self.try_outcome() {
                return outcome;
            }
            notified.await;
        }
    }
}

impl IntoFuture for ReplyFuture {
    type Output = Outcome;
    type IntoFuture = Pin<Box<dyn Future<Output = Outcome> + Send>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(async move { self.settled().await })
    }
}

impl std::fmt::Debug for ReplyFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match &*self.lock() {
            State::Pending(queued) => format!("pending({} continuations)", queued.len()),
            State::Settled(Ok(_)) => "resolved".to_string(),
            State::Settled(Err(err)) => format!("rejected({err})"),
        };
        f.debug_struct("ReplyFuture").field("state", &state).finish()
    }
}
