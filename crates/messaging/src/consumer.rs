//! The retry/ack state machine shared by queue servers and subscribers.
//!
//! Deliveries are at-least-once. A handler failure or an expired deadline
//! requeues the message; the broker marks the next delivery as redelivered
//! and the consumer counts it. Once a session has seen more redeliveries
//! than `max_retry`, the next redelivered message is acknowledged and
//! dropped. A success forgives earlier failures.

use std::sync::Arc;
use std::time::Duration;

use courier_transport::{Delivery, DeliveryStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, warn};

use crate::ack::AckGuard;
use crate::dispatch::{Deadline, run_detached, spawn_consumer};
use crate::envelope::Envelope;
use crate::handler::{ActionTable, ConsumerHandler, Request};
use crate::retry::RetryTracker;

/// Why a message was dropped without being handled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum DropReason {
    /// The content was not an `ok` envelope. Never retried.
    Malformed,
    /// The message was redelivered more often than allowed.
    RetriesExhausted,
    /// Neither an action handler nor a catch-all handler was registered.
    NoHandler,
}

/// What happened to one delivery.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Disposition {
    /// Handled and acknowledged.
    Acked,
    /// Failed or timed out; returned to the queue.
    Requeued,
    /// Acknowledged without being handled.
    Dropped(DropReason),
}

#[derive(Debug)]
pub(crate) struct ConsumerCore {
    name: String,
    timeout: Duration,
    max_retry: u32,
    pub(crate) actions: ActionTable<dyn ConsumerHandler>,
    retries: RetryTracker,
    pub(crate) shutdown_token: CancellationToken,
    task_tracker: TaskTracker,
}

impl ConsumerCore {
    pub(crate) fn new(name: impl Into<String>, timeout: Duration, max_retry: u32) -> Self {
        let name = name.into();
        Self {
            actions: ActionTable::new(name.clone()),
            name,
            timeout,
            max_retry,
            retries: RetryTracker::default(),
            shutdown_token: CancellationToken::new(),
            task_tracker: TaskTracker::new(),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    /// Processes every delivery of `deliveries` on its own task.
    pub(crate) fn run(self: &Arc<Self>, deliveries: DeliveryStream) {
        let core = Arc::clone(self);
        spawn_consumer(
            &self.task_tracker,
            self.shutdown_token.clone(),
            self.name.clone(),
            deliveries,
            move |delivery| {
                let core = core.clone();
                async move {
                    core.process(delivery).await;
                }
            },
        );
    }

    pub(crate) async fn close(&self) {
        self.shutdown_token.cancel();
        self.task_tracker.close();
        self.task_tracker.wait().await;
        debug!(name = %self.name, "consumer closed");
    }

    pub(crate) async fn process(&self, delivery: Delivery) -> Disposition {
        let guard = AckGuard::new(delivery);
        let delivery = guard.delivery();
        let consumer_tag = delivery.consumer_tag.as_str();

        let envelope = match Envelope::decode(&delivery.content) {
            Ok(envelope) if envelope.is_ok() => envelope,
            Ok(_) => {
                error!(name = %self.name, "message with error status dropped");
                guard.ack().await;
                return Disposition::Dropped(DropReason::Malformed);
            }
            Err(e) => {
                error!(name = %self.name, error = %e, "malformed message dropped");
                guard.ack().await;
                return Disposition::Dropped(DropReason::Malformed);
            }
        };

        if delivery.redelivered {
            let retry = self.retries.record_redelivery(consumer_tag);
            if retry > self.max_retry {
                error!(
                    name = %self.name,
                    retry,
                    max_retry = self.max_retry,
                    "retries exhausted; message dropped"
                );
                self.retries.clear(consumer_tag);
                guard.ack().await;
                return Disposition::Dropped(DropReason::RetriesExhausted);
            }
            debug!(name = %self.name, retry, "processing redelivered message");
        }

        let request = Request::new(envelope, delivery);
        let Some(handler) = self.actions.resolve(request.action()) else {
            error!(
                name = %self.name,
                action = request.action().unwrap_or_default(),
                "no handler for message; dropped"
            );
            guard.ack().await;
            return Disposition::Dropped(DropReason::NoHandler);
        };

        let deadline = request.timeout().unwrap_or(self.timeout);
        let outcome = run_detached(&self.task_tracker, &self.name, deadline, async move {
            handler.handle(request).await
        })
        .await;

        match outcome {
            Deadline::Finished(Ok(())) => {
                guard.ack().await;
                self.retries.clear(consumer_tag);
                Disposition::Acked
            }
            Deadline::Finished(Err(e)) => {
                warn!(
                    name = %self.name,
                    error = %e,
                    retries = self.retries.get(consumer_tag),
                    "handler failed; message requeued"
                );
                guard.nack(true).await;
                Disposition::Requeued
            }
            Deadline::Expired => {
                warn!(name = %self.name, ?deadline, "handler exceeded its deadline; message requeued");
                guard.nack(true).await;
                Disposition::Requeued
            }
        }
    }
}
