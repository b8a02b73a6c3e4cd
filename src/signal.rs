//! Completion signals
//!
//! A signal is a counting synchronization primitive shared between the host
//! and the agent: the host creates it with an initial value (one per
//! dispatch, typically 1), the agent decrements it when the dispatch
//! retires, and the host blocks until the counter reaches a target value
//! (typically 0) or a deadline passes.
//!
//! Dispatch packets carry signals as plain `u64` handles; a process-wide
//! handle table maps them back to the shared counter so the packet stays
//! pure data. Dropping a [`Signal`] removes its table entry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::time::{Duration, Instant};

use crate::error::{DespacharError, Result};

static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

fn table() -> &'static Mutex<HashMap<u64, Arc<SignalInner>>> {
    static TABLE: OnceLock<Mutex<HashMap<u64, Arc<SignalInner>>>> = OnceLock::new();
    TABLE.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Shared state behind a signal handle
#[derive(Debug)]
pub(crate) struct SignalInner {
    value: Mutex<i64>,
    cond: Condvar,
}

impl SignalInner {
    fn new(initial: i64) -> Self {
        Self {
            value: Mutex::new(initial),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn subtract(&self, amount: i64) {
        let mut value = self.value.lock().expect("signal lock poisoned");
        *value -= amount;
        self.cond.notify_all();
    }

    fn load(&self) -> i64 {
        *self.value.lock().expect("signal lock poisoned")
    }
}

/// Resolve a signal handle from the process-wide table.
///
/// Used by the packet processor; returns `None` for handle 0 (no signal)
/// or a handle whose signal was already released.
pub(crate) fn lookup(handle: u64) -> Option<Arc<SignalInner>> {
    if handle == 0 {
        return None;
    }
    table()
        .lock()
        .expect("signal table poisoned")
        .get(&handle)
        .cloned()
}

/// A host/agent-visible counting signal.
///
/// Each dispatch uses a dedicated signal unless the caller explicitly shares
/// one. The handle is released when the `Signal` is dropped; the agent side
/// keeps the counter alive through its own reference, so a late completion
/// after the host gave up never touches freed memory.
#[derive(Debug)]
pub struct Signal {
    handle: u64,
    inner: Arc<SignalInner>,
}

impl Signal {
    /// Create a signal with the given initial value and publish its handle
    #[must_use]
    pub fn new(initial: i64) -> Self {
        let handle = NEXT_HANDLE.fetch_add(1, Ordering::Relaxed);
        let inner = Arc::new(SignalInner::new(initial));
        table()
            .lock()
            .expect("signal table poisoned")
            .insert(handle, inner.clone());
        Self { handle, inner }
    }

    /// The handle dispatch packets carry for this signal
    #[must_use]
    pub fn handle(&self) -> u64 {
        self.handle
    }

    /// Current counter value
    #[must_use]
    pub fn value(&self) -> i64 {
        self.inner.load()
    }

    /// Decrement the counter and wake all waiters
    pub fn subtract(&self, amount: i64) {
        self.inner.subtract(amount);
    }

    /// Block until the counter reaches `target` (value <= target).
    ///
    /// Returns immediately if the signal is already satisfied; waiting twice
    /// on a satisfied signal is a no-op.
    pub fn wait(&self, target: i64) {
        let mut value = self.inner.value.lock().expect("signal lock poisoned");
        while *value > target {
            value = self
                .inner
                .cond
                .wait(value)
                .expect("signal lock poisoned");
        }
    }

    /// Block until the counter reaches `target` or `timeout` elapses.
    ///
    /// On expiry returns [`DespacharError::DispatchTimeout`]; the underlying
    /// device work is not guaranteed to have stopped.
    pub fn wait_timeout(&self, target: i64, timeout: Duration) -> Result<i64> {
        let deadline = Instant::now() + timeout;
        let mut value = self.inner.value.lock().expect("signal lock poisoned");
        while *value > target {
            let now = Instant::now();
            if now >= deadline {
                return Err(DespacharError::DispatchTimeout {
                    waited_ms: timeout.as_millis() as u64,
                });
            }
            let (guard, result) = self
                .inner
                .cond
                .wait_timeout(value, deadline - now)
                .expect("signal lock poisoned");
            value = guard;
            if result.timed_out() && *value > target {
                return Err(DespacharError::DispatchTimeout {
                    waited_ms: timeout.as_millis() as u64,
                });
            }
        }
        Ok(*value)
    }

    /// Release the signal handle explicitly (equivalent to dropping)
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for Signal {
    fn drop(&mut self) {
        table()
            .lock()
            .expect("signal table poisoned")
            .remove(&self.handle);
    }
}
