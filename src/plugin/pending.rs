//! Pending request table
//!
//! Every outstanding bridge request owns one entry keyed by its [`RequestId`].
//! Ids come from a monotonically increasing counter and are never reused for
//! the lifetime of the table, so a late response can never complete a newer
//! request.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::oneshot;
use tracing::debug;

use super::protocol::{RequestId, RuntimeMessage};

type Waiters = HashMap<RequestId, oneshot::Sender<RuntimeMessage>>;

#[derive(Clone, Default)]
pub struct PendingCalls {
    waiters: Arc<Mutex<Waiters>>,
    next_id: Arc<AtomicU64>,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint a fresh id and register a waiter for it
    pub fn register(&self) -> (RequestId, oneshot::Receiver<RuntimeMessage>) {
        let id = RequestId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let (tx, rx) = oneshot::channel();
        self.lock().insert(id, tx);
        (id, rx)
    }

    /// Hand a response to its waiter; false when nobody is waiting anymore
    pub fn complete(&self, id: RequestId, message: RuntimeMessage) -> bool {
        let Some(waiter) = self.lock().remove(&id) else {
            debug!(%id, "Dropping response for unknown or settled request");
            return false;
        };
        waiter.send(message).is_ok()
    }

    pub fn remove(&self, id: RequestId) -> bool {
        self.lock().remove(&id).is_some()
    }

    pub fn contains(&self, id: RequestId) -> bool {
        self.lock().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reject every outstanding request with a lifecycle failure
    pub fn fail_all(&self, reason: &str) -> usize {
        let waiters: Vec<_> = self.lock().drain().collect();
        let count = waiters.len();
        for (_, waiter) in waiters {
            let _ = waiter.send(RuntimeMessage::fatal(reason.to_string()));
        }
        count
    }

    /// Entry that is removed again when the guard drops
    pub fn guard(&self, id: RequestId) -> PendingGuard {
        PendingGuard {
            calls: self.clone(),
            id,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Waiters> {
        self.waiters.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Removes its request from the table on drop, whether it settled or not
pub struct PendingGuard {
    calls: PendingCalls,
    id: RequestId,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.calls.remove(self.id);
    }
}
