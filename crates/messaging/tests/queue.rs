use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use courier_messaging::config::{
    ConnectionOptions, ConsumerOptions, PublisherOptions, QueueClientOptions, SubscriberOptions,
};
use courier_messaging::{
    ActionRegistrar, ConnectionManager, Error, HandlerError, Initializable, Publisher,
    QueueClient, QueueServer, Request, SendOptions, Subscriber,
};
use courier_transport_memory::MemoryTransport;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tracing_test::traced_test;

fn manager(transport: &MemoryTransport) -> ConnectionManager {
    ConnectionManager::new(Arc::new(transport.clone()), ConnectionOptions::default())
}

/// Records every payload it sees and fails the first `failures` of them.
#[derive(Clone, Default)]
struct Recorder {
    seen: Arc<Mutex<Vec<Value>>>,
    failures: Arc<AtomicUsize>,
}

impl Recorder {
    fn failing(failures: usize) -> Self {
        Self {
            failures: Arc::new(AtomicUsize::new(failures)),
            ..Self::default()
        }
    }

    fn handler(&self) -> Arc<dyn courier_messaging::ConsumerHandler> {
        let recorder = self.clone();
        Arc::new(move |request: Request| {
            let recorder = recorder.clone();
            async move {
                recorder.seen.lock().push(request.data().clone());
                let remaining = recorder.failures.load(Ordering::SeqCst);
                if remaining > 0 {
                    recorder.failures.store(remaining - 1, Ordering::SeqCst);
                    return Err(HandlerError::failed("not yet"));
                }
                Ok(())
            }
        })
    }

    fn count(&self) -> usize {
        self.seen.lock().len()
    }
}

fn queue_server(manager: &ConnectionManager, max_retry: u32) -> QueueServer {
    QueueServer::new(
        "jobs",
        manager.clone(),
        ConsumerOptions {
            max_retry,
            ..ConsumerOptions::default()
        },
    )
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}

#[tokio::test(start_paused = true)]
async fn delivered_messages_are_handled_and_acked() {
    let transport = MemoryTransport::new();
    let manager = manager(&transport);
    let recorder = Recorder::default();
    let server = queue_server(&manager, 5);
    server.consume(recorder.handler());
    server.initialize().await.unwrap();

    let client = QueueClient::new("jobs", manager.clone(), QueueClientOptions::default());
    client.send(&json!({"id": 1})).await.unwrap();
    settle().await;

    assert_eq!(*recorder.seen.lock(), vec![json!({"id": 1})]);
    let info = transport.broker().queue_info("jobs").unwrap();
    assert_eq!(info.message_count, 0);
}

#[tokio::test(start_paused = true)]
#[traced_test]
async fn always_failing_handler_runs_max_retry_plus_one_times() {
    let transport = MemoryTransport::new();
    let manager = manager(&transport);
    let recorder = Recorder::failing(usize::MAX);
    let server = queue_server(&manager, 3);
    server.consume(recorder.handler());
    server.initialize().await.unwrap();

    QueueClient::new("jobs", manager.clone(), QueueClientOptions::default())
        .send(&json!("poison"))
        .await
        .unwrap();
    settle().await;

    assert_eq!(recorder.count(), 4);
    assert_eq!(
        transport.broker().queue_info("jobs").unwrap().message_count,
        0
    );
    assert!(logs_contain("retries exhausted; message dropped"));
}

#[tokio::test(start_paused = true)]
async fn transient_failures_are_retried_until_success() {
    let transport = MemoryTransport::new();
    let manager = manager(&transport);
    let recorder = Recorder::failing(2);
    let server = queue_server(&manager, 5);
    server.consume(recorder.handler());
    server.initialize().await.unwrap();

    QueueClient::new("jobs", manager.clone(), QueueClientOptions::default())
        .send(&json!("flaky"))
        .await
        .unwrap();
    settle().await;

    assert_eq!(recorder.count(), 3);
    assert_eq!(
        transport.broker().queue_info("jobs").unwrap().message_count,
        0
    );
}

#[tokio::test(start_paused = true)]
async fn actions_route_to_their_handlers() {
    let transport = MemoryTransport::new();
    let manager = manager(&transport);
    let resize = Recorder::default();
    let fallback = Recorder::default();
    let server = queue_server(&manager, 5);
    server.register_action("resize", resize.handler());
    server.consume(fallback.handler());
    server.initialize().await.unwrap();

    let client = QueueClient::new("jobs", manager.clone(), QueueClientOptions::default());
    client
        .send_with(
            json!("image.png"),
            SendOptions {
                action: Some("resize".to_string()),
                ..SendOptions::default()
            },
        )
        .await
        .unwrap();
    client.send(&json!("other")).await.unwrap();
    settle().await;

    assert_eq!(*resize.seen.lock(), vec![json!("image.png")]);
    assert_eq!(*fallback.seen.lock(), vec![json!("other")]);
}

#[tokio::test]
async fn unserializable_payload_fails_before_any_io() {
    let transport = MemoryTransport::new();
    let manager = manager(&transport);
    let client = QueueClient::new("jobs", manager, QueueClientOptions::default());

    let payload: HashMap<(u8, u8), u8> = HashMap::from([((1, 1), 1)]);
    let error = client.send(&payload).await.unwrap_err();

    assert!(matches!(error, Error::Codec(_)));
    assert!(transport.dial_attempts().is_empty());
}

#[tokio::test(start_paused = true)]
async fn every_subscriber_receives_each_publication() {
    let transport = MemoryTransport::new();
    let manager = manager(&transport);

    let first = Recorder::default();
    let second = Recorder::default();
    let mut subscribers = Vec::new();
    for recorder in [&first, &second] {
        let subscriber = Subscriber::new("events", manager.clone(), SubscriberOptions::default());
        subscriber.consume(recorder.handler());
        subscriber.initialize().await.unwrap();
        assert!(subscriber.queue().is_some());
        subscribers.push(subscriber);
    }

    Publisher::new("events", manager.clone(), PublisherOptions::default())
        .publish(&json!({"kind": "created"}))
        .await
        .unwrap();
    settle().await;

    assert_eq!(*first.seen.lock(), vec![json!({"kind": "created"})]);
    assert_eq!(*second.seen.lock(), vec![json!({"kind": "created"})]);

    for subscriber in subscribers {
        subscriber.close().await;
    }
}

#[tokio::test(start_paused = true)]
async fn named_subscription_queue_is_shared() {
    let transport = MemoryTransport::new();
    let manager = manager(&transport);
    let options = SubscriberOptions {
        queue_name: Some("audit".to_string()),
        ..SubscriberOptions::default()
    };

    let a = Recorder::default();
    let b = Recorder::default();
    for recorder in [&a, &b] {
        let subscriber = Subscriber::new("events", manager.clone(), options.clone());
        subscriber.consume(recorder.handler());
        subscriber.initialize().await.unwrap();
        assert_eq!(subscriber.queue(), Some("audit"));
    }

    let publisher = Publisher::new("events", manager.clone(), PublisherOptions::default());
    publisher.publish(&1).await.unwrap();
    publisher.publish(&2).await.unwrap();
    settle().await;

    assert_eq!(a.count() + b.count(), 2);
    assert_eq!(a.count(), 1);
}
