//! Invocation correlation.
//!
//! Every call that expects a completion gets a decimal id from a per-client
//! counter and a one-shot slot keyed by that id. The read loop resolves slots
//! as completions arrive; connection teardown cancels whatever is left so no
//! caller waits forever.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll};

use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::{HubError, Result};

type Slot = oneshot::Sender<Result<Value>>;
type Slots = Mutex<HashMap<String, Slot>>;

fn lock_slots(slots: &Slots) -> MutexGuard<'_, HashMap<String, Slot>> {
    slots.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Issues invocation ids and tracks their pending completions.
#[derive(Debug)]
pub struct InvocationTracker {
    /// Monotonically increasing id counter; never reset.
    next_id: AtomicU64,
    pending: Arc<Slots>,
}

impl Default for InvocationTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl InvocationTracker {
    /// Create a tracker whose first id is `"1"`.
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        lock_slots(&self.pending)
    }

    /// Allocate a fresh id and its pending slot.
    pub fn begin(&self) -> (String, PendingInvocation) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed).to_string();
        let (tx, rx) = oneshot::channel();
        self.slots().insert(id.clone(), tx);
        let pending = PendingInvocation {
            id: id.clone(),
            rx,
            slots: Arc::downgrade(&self.pending),
        };
        (id, pending)
    }

    /// Deliver `outcome` to the slot for `id`.
    ///
    /// Returns `false` when `id` is unknown or already resolved; such late
    /// or duplicate completions are dropped.
    pub fn resolve(&self, id: &str, outcome: Result<Value>) -> bool {
        let Some(slot) = self.slots().remove(id) else {
            log::debug!("[Hub] Completion for unknown invocation {id} dropped");
            return false;
        };
        // The caller may have stopped waiting; that is not an error here.
        slot.send(outcome).is_ok()
    }

    /// Forget `id` without resolving it (its send never left the client).
    pub fn discard(&self, id: &str) {
        self.slots().remove(id);
    }

    /// Fail every pending slot with `reason`. Returns how many were pending.
    pub fn cancel_all(&self, reason: &HubError) -> usize {
        let drained: Vec<Slot> = self.slots().drain().map(|(_, slot)| slot).collect();
        let count = drained.len();
        for slot in drained {
            let _ = slot.send(Err(reason.clone()));
        }
        if count > 0 {
            log::debug!("[Hub] Cancelled {count} pending invocation(s): {reason}");
        }
        count
    }

    /// Number of invocations still awaiting a completion.
    pub fn pending_count(&self) -> usize {
        self.slots().len()
    }
}

/// Awaitable completion of one invocation.
///
/// Resolves with the completion's result (`Value::Null` when the server sent
/// none), the server-reported error, or [`HubError::Disconnected`] if the
/// slot is dropped without an answer.
///
/// Dropping it before the completion arrives gives up on the call and frees
/// its slot; a late completion for it is then dropped as unknown.
#[derive(Debug)]
#[must_use = "a pending invocation does nothing unless awaited"]
pub struct PendingInvocation {
    id: String,
    rx: oneshot::Receiver<Result<Value>>,
    slots: Weak<Slots>,
}

impl PendingInvocation {
    /// The invocation id carried on the wire.
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Future for PendingInvocation {
    type Output = Result<Value>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(HubError::Disconnected)))
    }
}

impl Drop for PendingInvocation {
    fn drop(&mut self) {
        if let Some(slots) = self.slots.upgrade() {
            lock_slots(&slots).remove(&self.id);
        }
    }
}
