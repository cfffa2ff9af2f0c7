//! Task plumbing shared by consumers: the delivery loop and deadline-bound
//! handler execution.

use std::future::Future;
use std::time::Duration;

use courier_transport::{Delivery, DeliveryStream};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, error, warn};

use crate::handler::HandlerError;

/// How a deadline-bound handler run ended.
#[derive(Debug)]
pub enum Deadline<T> {
    /// The handler finished in time.
    Finished(Result<T, HandlerError>),
    /// The deadline passed first. The handler keeps running detached.
    Expired,
}

/// Runs `work` as its own task and waits at most `deadline` for it.
///
/// On expiry the task is not cancelled; its eventual outcome is only logged.
/// A panic in `work` surfaces as [`HandlerError::Panicked`].
pub async fn run_detached<T, F>(
    tracker: &TaskTracker,
    name: &str,
    deadline: Duration,
    work: F,
) -> Deadline<T>
where
    T: Send + 'static,
    F: Future<Output = Result<T, HandlerError>> + Send + 'static,
{
    let mut handle = tracker.spawn(work.in_current_span());
    match tokio::time::timeout(deadline, &mut handle).await {
        Ok(Ok(outcome)) => Deadline::Finished(outcome),
        Ok(Err(e)) => Deadline::Finished(Err(HandlerError::Panicked(e.to_string()))),
        Err(_) => {
            let name = name.to_string();
            let report = async move {
                match handle.await {
                    Ok(Ok(_)) => debug!(name = %name, "handler completed after its deadline"),
                    Ok(Err(e)) => warn!(name = %name, error = %e, "handler failed after its deadline"),
                    Err(e) => warn!(name = %name, error = %e, "handler panicked after its deadline"),
                }
            };
            tracker.spawn(report.in_current_span());
            Deadline::Expired
        }
    }
}

/// Consumes `deliveries` until `token` is cancelled or the broker ends the
/// stream. Each delivery is processed on its own task, so a slow handler
/// does not hold back the ones behind it.
pub fn spawn_consumer<F, Fut>(
    tracker: &TaskTracker,
    token: CancellationToken,
    name: String,
    deliveries: DeliveryStream,
    process: F,
) where
    F: Fn(Delivery) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    spawn_consumer_with_end(tracker, token, name, deliveries, process, || {});
}

/// Like [`spawn_consumer`]; `ended` runs if the broker ends the stream, but
/// not when `token` stops the consumer.
pub fn spawn_consumer_with_end<F, Fut, E>(
    tracker: &TaskTracker,
    token: CancellationToken,
    name: String,
    mut deliveries: DeliveryStream,
    process: F,
    ended: E,
) where
    F: Fn(Delivery) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
    E: FnOnce() + Send + 'static,
{
    let tasks = tracker.clone();
    let consume = async move {
        let broker_ended = loop {
            tokio::select! {
                biased;
                () = token.cancelled() => {
                    debug!(name = %name, "consumer stopped");
                    break false;
                }
                next = deliveries.next() => match next {
                    Some(Ok(delivery)) => {
                        tasks.spawn(process(delivery).in_current_span());
                    }
                    Some(Err(e)) => error!(name = %name, error = %e, "delivery failed"),
                    None => {
                        warn!(name = %name, "consumer cancelled by the broker");
                        break true;
                    }
                },
            }
        };
        // Cancel the consumer before reacting to its end.
        drop(deliveries);
        if broker_ended {
            ended();
        }
    };
    tracker.spawn(consume.in_current_span());
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use bytes::Bytes;
    use courier_transport::{MessageProperties, NoopAcker, TransportError};
    use tracing_test::traced_test;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn finished_work_is_returned() {
        let tracker = TaskTracker::new();
        let outcome = run_detached(&tracker, "t", Duration::from_secs(1), async { Ok(3) }).await;
        assert!(matches!(outcome, Deadline::Finished(Ok(3))));
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn expired_work_keeps_running_and_is_logged() {
        let tracker = TaskTracker::new();
        let done = Arc::new(AtomicUsize::new(0));

        let outcome = {
            let done = done.clone();
            run_detached(&tracker, "t", Duration::from_millis(10), async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                done.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(HandlerError::failed("too late"))
            })
            .await
        };
        assert!(matches!(outcome, Deadline::Expired));
        assert_eq!(done.load(Ordering::SeqCst), 0);

        tracker.close();
        tracker.wait().await;
        assert_eq!(done.load(Ordering::SeqCst), 1);
        assert!(logs_contain("handler failed after its deadline"));
    }

    async fn explode() -> Result<(), HandlerError> {
        panic!("boom")
    }

    #[tokio::test]
    async fn panics_become_handler_errors() {
        let tracker = TaskTracker::new();
        let outcome = run_detached(&tracker, "t", Duration::from_secs(1), explode()).await;
        assert!(matches!(
            outcome,
            Deadline::Finished(Err(HandlerError::Panicked(_)))
        ));
    }

    #[tokio::test]
    async fn loop_processes_until_the_stream_ends() {
        let deliveries = futures::stream::iter((0..3).map(|_| {
            Ok::<_, TransportError>(Delivery::new(
                Bytes::new(),
                MessageProperties::default(),
                false,
                "ctag",
                "queue",
                Arc::new(NoopAcker),
            ))
        }))
        .boxed();
        let seen = Arc::new(AtomicUsize::new(0));
        let tracker = TaskTracker::new();

        let counter = seen.clone();
        spawn_consumer(
            &tracker,
            CancellationToken::new(),
            "t".to_string(),
            deliveries,
            move |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            },
        );

        tracker.close();
        tracker.wait().await;
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn end_hook_runs_only_when_the_broker_ends_the_stream() {
        let ended = Arc::new(AtomicUsize::new(0));
        let tracker = TaskTracker::new();

        let counter = ended.clone();
        spawn_consumer_with_end(
            &tracker,
            CancellationToken::new(),
            "finite".to_string(),
            futures::stream::empty().boxed(),
            |_| async {},
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
            },
        );

        let token = CancellationToken::new();
        let counter = ended.clone();
        spawn_consumer_with_end(
            &tracker,
            token.clone(),
            "stopped".to_string(),
            futures::stream::pending().boxed(),
            |_| async {},
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
            },
        );
        token.cancel();

        tracker.close();
        tracker.wait().await;
        assert_eq!(ended.load(Ordering::SeqCst), 1);
    }
}
