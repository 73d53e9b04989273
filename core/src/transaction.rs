// Pending transaction bookkeeping for one requestor
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tokio::task::JoinHandle;

use crate::{Result, RpcError, TidewireError};

pub type SuccessFn = Box<dyn FnOnce(Value) + Send>;
pub type FailureFn = Box<dyn FnOnce(RpcError) + Send>;

/// One outstanding request.
///
/// Consumed by exactly one of [`Transaction::succeed`] or [`Transaction::fail`].
pub struct Transaction {
    pub id: u32,
    pub method: String,
    on_success: SuccessFn,
    on_failure: FailureFn,
    timer: Option<JoinHandle<()>>,
}

impl Transaction {
    pub fn new(id: u32, method: impl Into<String>, on_success: SuccessFn, on_failure: FailureFn) -> Self {
        Self {
            id,
            method: method.into(),
            on_success,
            on_failure,
            timer: None,
        }
    }

    pub fn succeed(self, value: Value) {
        (self.on_success)(value)
    }

    pub fn fail(self, error: RpcError) {
        (self.on_failure)(error)
    }

    fn stop_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("method", &self.method)
            .field("armed", &self.timer.is_some())
            .finish()
    }
}

// Pending transactions plus the closed flag, guarded together.
#[derive(Default)]
struct Slots {
    pending: HashMap<u32, Transaction>,
    closed: bool,
}

/// Correlation id -> pending transaction.
///
/// A single mutex guards every path (insert, response, timeout, close). A
/// transaction leaves the table exactly once, and the timer is stopped in the
/// same critical section, so the callbacks can never run twice. Callbacks are
/// invoked by the caller after the lock is released.
///
/// Once [`TransactionTable::drain`] has run the table is closed and every
/// later insert is refused.
#[derive(Default)]
pub struct TransactionTable {
    slots: Mutex<Slots>,
    next_id: AtomicU32,
}

impl TransactionTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocates a correlation id not used by any pending transaction.
    pub fn allocate_id(&self) -> u32 {
        let slots = self.lock();
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            if !slots.pending.contains_key(&id) {
                return id;
            }
        }
    }

    /// Inserts `transaction` and arms its timer in one critical section.
    ///
    /// `arm` receives the id and returns the timer task. The timer must call
    /// [`TransactionTable::expire`], which blocks until this insert is done.
    /// A closed table refuses the transaction without arming anything.
    pub fn insert<A>(&self, mut transaction: Transaction, arm: A) -> Result<()>
    where
        A: FnOnce(u32) -> JoinHandle<()>,
    {
        let mut slots = self.lock();
        if slots.closed {
            return Err(TidewireError::Closed(format!(
                "transaction[{}], method[{}]",
                transaction.id, transaction.method
            )));
        }
        transaction.timer = Some(arm(transaction.id));
        if let Some(mut replaced) = slots.pending.insert(transaction.id, transaction) {
            // allocate_id never hands out a pending id; keep the old timer from leaking.
            replaced.stop_timer();
        }
        Ok(())
    }

    /// Removes the transaction and stops its timer (response path).
    pub fn take(&self, id: u32) -> Option<Transaction> {
        let mut slots = self.lock();
        let mut transaction = slots.pending.remove(&id)?;
        transaction.stop_timer();
        Some(transaction)
    }

    /// Removes the transaction from inside its own timer (timeout path).
    pub fn expire(&self, id: u32) -> Option<Transaction> {
        let mut transaction = self.lock().pending.remove(&id)?;
        // Dropping our own handle detaches rather than cancels.
        transaction.timer = None;
        Some(transaction)
    }

    /// Closes the table, then removes every pending transaction and stops
    /// their timers (close path).
    pub fn drain(&self) -> Vec<Transaction> {
        let mut slots = self.lock();
        slots.closed = true;
        slots
            .pending
            .drain()
            .map(|(_, mut transaction)| {
                transaction.stop_timer();
                transaction
            })
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: u32) -> bool {
        self.lock().pending.contains_key(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn counting(hits: &Arc<AtomicUsize>, id: u32) -> Transaction {
        let ok = Arc::clone(hits);
        let err = Arc::clone(hits);
        Transaction::new(
            id,
            "offer",
            Box::new(move |_| {
                ok.fetch_add(1, Ordering::SeqCst);
            }),
            Box::new(move |_| {
                err.fetch_add(1, Ordering::SeqCst);
            }),
        )
    }

    #[tokio::test]
    async fn test_take_is_exactly_once() {
        let table = TransactionTable::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let id = table.allocate_id();
        table.insert(counting(&hits, id), |_| tokio::spawn(async {})).unwrap();

        let first = table.take(id);
        assert!(first.is_some());
        assert!(table.take(id).is_none());
        assert!(table.expire(id).is_none());
        first.unwrap().succeed(Value::Null);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_allocate_skips_pending_ids() {
        let table = TransactionTable::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let mut seen = std::collections::HashSet::new();
        for _ in 0..100 {
            let id = table.allocate_id();
            assert!(seen.insert(id));
            table.insert(counting(&hits, id), |_| tokio::spawn(async {})).unwrap();
        }
        assert_eq!(table.len(), 100);
        assert_eq!(table.drain().len(), 100);
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_take_aborts_timer() {
        let table = TransactionTable::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let fired = Arc::new(AtomicUsize::new(0));
        let id = table.allocate_id();
        let f = Arc::clone(&fired);
        table.insert(counting(&hits, id), move |_| {
            tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                f.fetch_add(1, Ordering::SeqCst);
            })
        })
        .unwrap();
        let _ = table.take(id);
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_drain_closes_table() {
        let table = TransactionTable::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let id = table.allocate_id();
        table.insert(counting(&hits, id), |_| tokio::spawn(async {})).unwrap();
        assert_eq!(table.drain().len(), 1);
        assert!(table.is_closed());

        let armed = Arc::new(AtomicUsize::new(0));
        let a = Arc::clone(&armed);
        let late = table.allocate_id();
        let result = table.insert(counting(&hits, late), move |_| {
            a.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async {})
        });
        assert!(matches!(result, Err(TidewireError::Closed(_))));
        assert_eq!(armed.load(Ordering::SeqCst), 0);
        assert!(table.is_empty());
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }
}
