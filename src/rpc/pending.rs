//! In-flight request table.
//!
//! Each request id maps to a single-slot completion channel. A value is
//! delivered by removing the entry first, so an id can be completed at most
//! once no matter how many responses or failures race for it.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::oneshot;

use super::wire::Notification;
use crate::error::{Error, Result};

/// Callback invoked (in emission order) for notifications that reference a
/// pending request's id.
pub type NotificationHandler = Arc<dyn Fn(&Notification) + Send + Sync>;

struct PendingRequest {
    tx: oneshot::Sender<Result<Value>>,
    on_notification: Option<NotificationHandler>,
}

#[derive(Default)]
struct State {
    entries: HashMap<u64, PendingRequest>,
    /// Set once the reader has gone away; nothing can be delivered after that.
    closed: bool,
}

pub(crate) struct PendingTable {
    next_id: AtomicU64,
    state: Mutex<State>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            state: Mutex::new(State::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Allocate an id that is not tracked in the table (fire-and-forget
    /// messages such as `cancel`).
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Allocate an id and register a waiter for it.
    pub fn register(
        &self,
        on_notification: Option<NotificationHandler>,
    ) -> Result<(u64, oneshot::Receiver<Result<Value>>)> {
        let (tx, rx) = oneshot::channel();
        let mut state = self.lock();
        if state.closed {
            return Err(Error::ConnectionClosed);
        }
        let id = self.next_id();
        state.entries.insert(
            id,
            PendingRequest {
                tx,
                on_notification,
            },
        );
        Ok((id, rx))
    }

    /// Deliver the outcome for `id`. Returns false when nobody is waiting
    /// (unknown id, already completed, or abandoned by the caller).
    pub fn complete(&self, id: u64, outcome: Result<Value>) -> bool {
        let entry = self.lock().entries.remove(&id);
        match entry {
            // The receiver may have been dropped between removal and send;
            // the entry is gone either way.
            Some(pending) => pending.tx.send(outcome).is_ok(),
            None => false,
        }
    }

    /// Forget `id` without delivering anything. Returns true if it was
    /// still pending.
    pub fn remove(&self, id: u64) -> bool {
        self.lock().entries.remove(&id).is_some()
    }

    pub fn notification_handler(&self, id: u64) -> Option<NotificationHandler> {
        self.lock()
            .entries
            .get(&id)
            .and_then(|p| p.on_notification.clone())
    }

    /// Fail every pending request with [`Error::ConnectionClosed`] and refuse
    /// new registrations. Returns how many waiters were failed.
    pub fn fail_all(&self) -> usize {
        let drained: Vec<PendingRequest> = {
            let mut state = self.lock();
            state.closed = true;
            state.entries.drain().map(|(_, p)| p).collect()
        };
        let count = drained.len();
        for pending in drained {
            let _ = pending.tx.send(Err(Error::ConnectionClosed));
        }
        count
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }
}
