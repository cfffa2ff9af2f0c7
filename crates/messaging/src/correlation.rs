//! Correlation of asynchronous replies with outstanding calls.
//!
//! Each registered call owns a correlation id, a caller-side deadline and a
//! piece of per-call state. A call is settled exactly once: either a reply
//! settles it through the registry, or its deadline passes and the waiter
//! reclaims the state. Removal from the map and delivery of the outcome
//! happen under one lock, so a reply racing the deadline is either fully
//! delivered or fully rejected.

use std::collections::HashMap;
use std::fmt::{self, Debug};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Error, Result};

struct Entry<S, O> {
    state: S,
    settle: oneshot::Sender<O>,
}

type PendingMap<S, O> = Arc<Mutex<HashMap<String, Entry<S, O>>>>;

/// Why a pending call ended without an outcome.
#[derive(Debug)]
pub enum Expired<S> {
    /// The deadline passed; carries the call's final state.
    TimedOut(S),
    /// The registry was cleared while the call was pending.
    Dropped,
}

/// Registry of pending calls for one client instance.
pub struct CorrelationRegistry<S, O> {
    name: String,
    limit: usize,
    default_timeout: Duration,
    pending: PendingMap<S, O>,
}

impl<S, O> Clone for CorrelationRegistry<S, O> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            limit: self.limit,
            default_timeout: self.default_timeout,
            pending: self.pending.clone(),
        }
    }
}

impl<S, O> Debug for CorrelationRegistry<S, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CorrelationRegistry")
            .field("name", &self.name)
            .field("limit", &self.limit)
            .field("pending", &self.pending.lock().len())
            .finish()
    }
}

impl<S, O> CorrelationRegistry<S, O>
where
    S: Send + 'static,
    O: Send + 'static,
{
    /// Creates a registry allowing at most `limit` pending calls.
    #[must_use]
    pub fn new(name: impl Into<String>, limit: usize, default_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            limit,
            default_timeout,
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Number of pending calls.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Whether no call is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fails if another call would exceed the pending-call limit.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CapacityExceeded`] when the limit is reached.
    pub fn ensure_capacity(&self) -> Result<()> {
        self.check(self.pending.lock().len())
    }

    fn check(&self, pending: usize) -> Result<()> {
        if pending >= self.limit {
            return Err(Error::CapacityExceeded {
                name: self.name.clone(),
                limit: self.limit,
            });
        }
        Ok(())
    }

    /// Registers a call under a fresh correlation id.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CapacityExceeded`] without registering anything when
    /// the limit is reached.
    pub fn register(&self, timeout: Option<Duration>, state: S) -> Result<PendingCall<S, O>> {
        let (settle, outcome) = oneshot::channel();
        let mut pending = self.pending.lock();
        self.check(pending.len())?;

        let mut id = Uuid::new_v4().to_string();
        while pending.contains_key(&id) {
            id = Uuid::new_v4().to_string();
        }
        pending.insert(id.clone(), Entry { state, settle });
        drop(pending);

        Ok(PendingCall {
            id,
            timeout: timeout.unwrap_or(self.default_timeout),
            outcome,
            pending: self.pending.clone(),
        })
    }

    /// Settles call `id` with `outcome`.
    ///
    /// Returns `false` (and logs) if no such call is pending.
    pub fn settle(&self, id: &str, outcome: O) -> bool {
        self.update(id, move |_| Some(outcome))
    }

    /// Updates the state of call `id`; settles it if `apply` returns an
    /// outcome.
    ///
    /// Returns `false` (and logs) if no such call is pending.
    pub fn update(&self, id: &str, apply: impl FnOnce(&mut S) -> Option<O>) -> bool {
        let mut pending = self.pending.lock();
        let Some(entry) = pending.get_mut(id) else {
            warn!(name = %self.name, correlation_id = id, "unknown or late reply discarded");
            return false;
        };

        if let Some(outcome) = apply(&mut entry.state) {
            if let Some(entry) = pending.remove(id) {
                // The waiter may have been dropped; nobody is left to tell.
                let _ = entry.settle.send(outcome);
            }
            debug!(name = %self.name, correlation_id = id, "call settled");
        }
        true
    }

    /// Drops every pending call; their waiters see [`Expired::Dropped`].
    pub fn clear(&self) {
        let drained = std::mem::take(&mut *self.pending.lock());
        if !drained.is_empty() {
            debug!(name = %self.name, count = drained.len(), "pending calls released");
        }
    }
}

/// A registered call awaiting settlement.
///
/// Dropping it unregisters the call.
pub struct PendingCall<S, O> {
    id: String,
    timeout: Duration,
    outcome: oneshot::Receiver<O>,
    pending: PendingMap<S, O>,
}

impl<S, O> Debug for PendingCall<S, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingCall")
            .field("id", &self.id)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl<S, O> PendingCall<S, O> {
    /// The correlation id to put on the outgoing message.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The deadline of this call.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Waits for the call to be settled or its deadline to pass.
    ///
    /// # Errors
    ///
    /// Returns [`Expired::TimedOut`] with the final call state when the
    /// deadline passes first, [`Expired::Dropped`] when the registry is
    /// cleared.
    pub async fn wait(mut self) -> std::result::Result<O, Expired<S>> {
        match tokio::time::timeout(self.timeout, &mut self.outcome).await {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(_)) => Err(Expired::Dropped),
            Err(_) => {
                let entry = self.pending.lock().remove(&self.id);
                match entry {
                    Some(entry) => Err(Expired::TimedOut(entry.state)),
                    // Settled between the timer firing and taking the lock.
                    None => self.outcome.try_recv().map_err(|_| Expired::Dropped),
                }
            }
        }
    }
}

impl<S, O> Drop for PendingCall<S, O> {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.id);
    }
}
