//! A lazily initialized value whose in-flight initialization is shared.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;

use crate::error::ConnectionError;

type Attempt<T> = Shared<BoxFuture<'static, Result<T, ConnectionError>>>;

enum Slot<T> {
    Empty,
    Pending { generation: u64, attempt: Attempt<T> },
    Ready(T),
}

/// Observable phase of a [`Memo`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemoState {
    /// Nothing cached and nothing in flight.
    Empty,
    /// An initialization is in flight.
    Pending,
    /// A value is cached.
    Ready,
}

/// Memoizes a fallible async initialization.
///
/// Concurrent callers share one attempt. A failed attempt leaves the memo
/// empty so the next caller starts over. Emptying the memo while an attempt
/// is in flight cancels it: a value it still produces is handed to the
/// attempt's `discard` hook and every waiter sees [`ConnectionError::Closed`].
pub struct Memo<T> {
    slot: Arc<Mutex<Slot<T>>>,
    generation: AtomicU64,
}

impl<T> Default for Memo<T> {
    fn default() -> Self {
        Self {
            slot: Arc::new(Mutex::new(Slot::Empty)),
            generation: AtomicU64::new(0),
        }
    }
}

/// Runs one attempt and stores its outcome, unless the attempt was cancelled
/// while it ran.
async fn settle<T, Fut, D, R>(
    slot: Weak<Mutex<Slot<T>>>,
    generation: u64,
    init: Fut,
    discard: D,
) -> Result<T, ConnectionError>
where
    T: Clone,
    Fut: Future<Output = Result<T, ConnectionError>>,
    D: FnOnce(T) -> R,
    R: Future<Output = ()>,
{
    let result = init.await;

    let current = slot.upgrade().is_some_and(|slot| {
        let mut slot = slot.lock();
        let current =
            matches!(&*slot, Slot::Pending { generation: pending, .. } if *pending == generation);
        if current {
            *slot = match &result {
                Ok(value) => Slot::Ready(value.clone()),
                Err(_) => Slot::Empty,
            };
        }
        current
    });

    match result {
        Ok(value) if !current => {
            discard(value).await;
            Err(ConnectionError::Closed)
        }
        result => result,
    }
}

impl<T> Memo<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Returns the cached value, joins the attempt in flight, or starts a new
    /// one with `init`. `discard` releases the value of a cancelled attempt.
    ///
    /// # Errors
    ///
    /// Returns the attempt's error, or [`ConnectionError::Closed`] when the
    /// attempt was cancelled.
    pub async fn get_or_try_init<F, Fut, D, R>(
        &self,
        init: F,
        discard: D,
    ) -> Result<T, ConnectionError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ConnectionError>> + Send + 'static,
        D: FnOnce(T) -> R + Send + 'static,
        R: Future<Output = ()> + Send + 'static,
    {
        let attempt = {
            let mut slot = self.slot.lock();
            match &*slot {
                Slot::Ready(value) => return Ok(value.clone()),
                Slot::Pending { attempt, .. } => attempt.clone(),
                Slot::Empty => {
                    let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
                    let attempt = settle(Arc::downgrade(&self.slot), generation, init(), discard)
                        .boxed()
                        .shared();
                    *slot = Slot::Pending {
                        generation,
                        attempt: attempt.clone(),
                    };
                    attempt
                }
            }
        };

        attempt.await
    }

    /// The cached value, if any.
    pub fn peek(&self) -> Option<T> {
        match &*self.slot.lock() {
            Slot::Ready(value) => Some(value.clone()),
            _ => None,
        }
    }

    /// Empties the memo, returning the value it held. An attempt in flight is
    /// cancelled.
    pub fn take(&self) -> Option<T> {
        match std::mem::replace(&mut *self.slot.lock(), Slot::Empty) {
            Slot::Ready(value) => Some(value),
            _ => None,
        }
    }

    /// Empties the memo if it holds a value matching `predicate`.
    pub fn reset_if(&self, predicate: impl FnOnce(&T) -> bool) -> bool {
        let mut slot = self.slot.lock();
        if matches!(&*slot, Slot::Ready(value) if predicate(value)) {
            *slot = Slot::Empty;
            true
        } else {
            false
        }
    }

    /// Current phase.
    pub fn state(&self) -> MemoState {
        match &*self.slot.lock() {
            Slot::Empty => MemoState::Empty,
            Slot::Pending { .. } => MemoState::Pending,
            Slot::Ready(_) => MemoState::Ready,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use courier_transport::TransportError;

    use super::*;

    async fn keep(_: u32) {}

    #[tokio::test]
    async fn concurrent_callers_share_one_attempt() {
        let memo = Arc::new(Memo::<u32>::default());
        let calls = Arc::new(AtomicUsize::new(0));

        let attempt = |calls: Arc<AtomicUsize>| async move {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::task::yield_now().await;
            Ok(7)
        };

        let (a, b) = tokio::join!(
            memo.get_or_try_init(|| attempt(calls.clone()), keep),
            memo.get_or_try_init(|| attempt(calls.clone()), keep),
        );

        assert_eq!(a.unwrap(), 7);
        assert_eq!(b.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(memo.state(), MemoState::Ready);
    }

    #[tokio::test]
    async fn failure_empties_the_memo() {
        let memo = Memo::<u32>::default();

        let err = memo
            .get_or_try_init(
                || async { Err(ConnectionError::Transport(TransportError::Closed)) },
                keep,
            )
            .await;
        assert!(err.is_err());
        assert_eq!(memo.state(), MemoState::Empty);

        let ok = memo.get_or_try_init(|| async { Ok(3) }, keep).await;
        assert_eq!(ok.unwrap(), 3);
    }

    #[tokio::test]
    async fn take_during_attempt_cancels_it() {
        let memo = Arc::new(Memo::<u32>::default());
        let (release, gate) = tokio::sync::oneshot::channel::<()>();
        let (discarded_tx, discarded) = tokio::sync::oneshot::channel::<u32>();

        let waiter = {
            let memo = memo.clone();
            tokio::spawn(async move {
                memo.get_or_try_init(
                    || async move {
                        let _ = gate.await;
                        Ok(1)
                    },
                    move |value| async move {
                        let _ = discarded_tx.send(value);
                    },
                )
                .await
            })
        };
        tokio::task::yield_now().await;
        assert_eq!(memo.state(), MemoState::Pending);

        assert!(memo.take().is_none());
        release.send(()).unwrap();

        assert!(matches!(
            waiter.await.unwrap(),
            Err(ConnectionError::Closed)
        ));
        assert_eq!(discarded.await.unwrap(), 1);
        assert_eq!(memo.state(), MemoState::Empty);

        let fresh = memo.get_or_try_init(|| async { Ok(2) }, keep).await;
        assert_eq!(fresh.unwrap(), 2);
        assert_eq!(memo.peek(), Some(2));
    }

    #[test]
    fn reset_if_only_matches_the_predicate() {
        let memo = Memo::<u32>::default();
        *memo.slot.lock() = Slot::Ready(5);

        assert!(!memo.reset_if(|value| *value == 4));
        assert_eq!(memo.state(), MemoState::Ready);
        assert!(memo.reset_if(|value| *value == 5));
        assert_eq!(memo.state(), MemoState::Empty);
    }
}
