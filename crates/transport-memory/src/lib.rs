//! In-memory transport implementation for testing
//!
//! This transport routes messages between connections within the same
//! process. It models the parts of an AMQP broker the messaging layer relies
//! on: default, direct, fanout and topic routing, server-named and exclusive
//! queues, consumer counts, prefetch, and nack-with-requeue redelivery.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod broker;

use std::fmt::{self, Debug};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use courier_transport::{
    Acker, Channel, Connection, ConsumeOptions, Delivery, DeliveryStream, EVENT_CAPACITY,
    ExchangeKind, ExchangeOptions, MessageProperties, QueueInfo, QueueOptions, TlsMaterial,
    Transport, TransportError, TransportEvent,
};
use dashmap::DashSet;
use futures::Stream;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info};
use uuid::Uuid;

pub use broker::{MemoryBroker, topic_matches};
use broker::StoredMessage;

/// AMQP reply code for an unroutable mandatory message.
const NO_ROUTE: u16 = 312;

struct TransportInner {
    broker: MemoryBroker,
    refused: DashSet<String>,
    dials: Mutex<Vec<String>>,
    connections: Mutex<Vec<Weak<ConnectionShared>>>,
    next_connection: AtomicU64,
}

/// Memory transport implementation.
///
/// Every connection dialed through the same transport (or its clones) shares
/// one [`MemoryBroker`].
#[derive(Clone)]
pub struct MemoryTransport {
    inner: Arc<TransportInner>,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for MemoryTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryTransport")
            .field("broker", &self.inner.broker)
            .field("refused", &self.inner.refused.len())
            .finish_non_exhaustive()
    }
}

impl MemoryTransport {
    /// Create a new memory transport with an empty broker.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TransportInner {
                broker: MemoryBroker::default(),
                refused: DashSet::new(),
                dials: Mutex::new(Vec::new()),
                connections: Mutex::new(Vec::new()),
                next_connection: AtomicU64::new(1),
            }),
        }
    }

    /// The broker shared by every connection of this transport.
    #[must_use]
    pub fn broker(&self) -> &MemoryBroker {
        &self.inner.broker
    }

    /// Makes dials to `url` fail as if the host were unreachable.
    pub fn refuse(&self, url: impl Into<String>) {
        self.inner.refused.insert(url.into());
    }

    /// Makes `url` reachable again.
    pub fn accept(&self, url: &str) {
        self.inner.refused.remove(url);
    }

    /// Every url dialed so far, in order.
    #[must_use]
    pub fn dial_attempts(&self) -> Vec<String> {
        self.inner.dials.lock().clone()
    }

    fn live_connections(&self) -> Vec<Arc<ConnectionShared>> {
        let mut connections = self.inner.connections.lock();
        connections.retain(|weak| weak.strong_count() > 0);
        connections.iter().filter_map(Weak::upgrade).collect()
    }

    /// Number of connections that have not been closed.
    #[must_use]
    pub fn open_connections(&self) -> usize {
        self.live_connections()
            .iter()
            .filter(|connection| !connection.closed.load(Ordering::SeqCst))
            .count()
    }

    /// Emits a lifecycle event on every open connection.
    pub fn emit(&self, event: &TransportEvent) {
        for connection in self.live_connections() {
            let _ = connection.events.send(event.clone());
        }
    }

    /// Emits a lifecycle event on every open channel.
    pub fn emit_on_channels(&self, event: &TransportEvent) {
        for connection in self.live_connections() {
            for channel in connection.channels.lock().iter() {
                let _ = channel.send(event.clone());
            }
        }
    }

    /// Closes every open connection from the broker side, the way a broker
    /// restart would.
    pub fn sever(&self) {
        for connection in self.live_connections() {
            connection.shutdown(&self.inner.broker, Some("connection forced"));
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(
        &self,
        url: &str,
        tls: Option<&TlsMaterial>,
    ) -> Result<Arc<dyn Connection>, TransportError> {
        tokio::task::yield_now().await;
        self.inner.dials.lock().push(url.to_string());

        if self.inner.refused.contains(url) {
            debug!(url, "memory dial refused");
            return Err(TransportError::Connect {
                url: url.to_string(),
                reason: "connection refused".to_string(),
            });
        }

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let shared = Arc::new(ConnectionShared {
            id: self.inner.next_connection.fetch_add(1, Ordering::Relaxed),
            closed: AtomicBool::new(false),
            events,
            channels: Mutex::new(Vec::new()),
        });
        self.inner.connections.lock().push(Arc::downgrade(&shared));

        info!(url, id = shared.id, tls = tls.is_some(), "memory connection established");

        Ok(Arc::new(MemoryConnection {
            shared,
            broker: self.inner.broker.clone(),
        }))
    }
}

struct ConnectionShared {
    id: u64,
    closed: AtomicBool,
    events: broadcast::Sender<TransportEvent>,
    channels: Mutex<Vec<broadcast::Sender<TransportEvent>>>,
}

impl ConnectionShared {
    fn shutdown(&self, broker: &MemoryBroker, error: Option<&str>) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }

        broker.disconnect(self.id);

        if let Some(reason) = error {
            let _ = self.events.send(TransportEvent::Error(reason.to_string()));
        }
        for channel in self.channels.lock().drain(..) {
            let _ = channel.send(TransportEvent::Close);
        }
        let _ = self.events.send(TransportEvent::Close);
        debug!(id = self.id, "memory connection closed");
        true
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }
}

/// Memory connection implementation
struct MemoryConnection {
    shared: Arc<ConnectionShared>,
    broker: MemoryBroker,
}

impl Debug for MemoryConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryConnection")
            .field("id", &self.shared.id)
            .field("closed", &self.shared.closed)
            .finish()
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn create_channel(&self) -> Result<Arc<dyn Channel>, TransportError> {
        self.shared.ensure_open()?;

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        self.shared.channels.lock().push(events.clone());

        Ok(Arc::new(MemoryChannel {
            connection: self.shared.clone(),
            broker: self.broker.clone(),
            prefetch: AtomicU16::new(0),
            events,
        }))
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.shared.shutdown(&self.broker, None) {
            Ok(())
        } else {
            Err(TransportError::AlreadyClosed)
        }
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.shared.events.subscribe()
    }
}

/// Memory channel implementation
struct MemoryChannel {
    connection: Arc<ConnectionShared>,
    broker: MemoryBroker,
    prefetch: AtomicU16,
    events: broadcast::Sender<TransportEvent>,
}

impl Debug for MemoryChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryChannel")
            .field("connection", &self.connection.id)
            .field("prefetch", &self.prefetch)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        _options: &ExchangeOptions,
    ) -> Result<(), TransportError> {
        self.connection.ensure_open()?;
        self.broker.declare_exchange(name, kind)
    }

    async fn declare_queue(
        &self,
        name: &str,
        options: &QueueOptions,
    ) -> Result<QueueInfo, TransportError> {
        self.connection.ensure_open()?;
        self.broker.declare_queue(name, options, self.connection.id)
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), TransportError> {
        self.connection.ensure_open()?;
        self.broker.bind_queue(queue, exchange, routing_key)
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        content: Bytes,
        properties: MessageProperties,
    ) -> Result<(), TransportError> {
        self.connection.ensure_open()?;
        tokio::task::yield_now().await;

        let mandatory = properties.mandatory;
        let routed = self
            .broker
            .publish(exchange, routing_key, content, properties)?;
        if routed == 0 {
            debug!(exchange, routing_key, mandatory, "message was not routed to any queue");
            if mandatory {
                let _ = self.events.send(TransportEvent::Return {
                    exchange: exchange.to_string(),
                    routing_key: routing_key.to_string(),
                    reply_code: NO_ROUTE,
                    reply_text: "NO_ROUTE".to_string(),
                });
            }
        }
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        options: ConsumeOptions,
    ) -> Result<DeliveryStream, TransportError> {
        self.connection.ensure_open()?;

        let tag = options
            .consumer_tag
            .unwrap_or_else(|| format!("amq.ctag-{}", Uuid::new_v4().simple()));
        let (tx, rx) = mpsc::unbounded_channel();

        self.broker.consume(
            queue,
            &tag,
            self.connection.id,
            options.no_ack,
            options.exclusive,
            self.prefetch.load(Ordering::Relaxed),
            tx,
        )?;
        debug!(queue, tag = %tag, "memory consumer started");

        Ok(Box::pin(ConsumerStream {
            inner: UnboundedReceiverStream::new(rx),
            _guard: ConsumerGuard {
                broker: self.broker.clone(),
                queue: queue.to_string(),
                tag,
            },
        }))
    }

    async fn prefetch(&self, count: u16) -> Result<(), TransportError> {
        self.connection.ensure_open()?;
        self.prefetch.store(count, Ordering::Relaxed);
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }
}

/// Cancels the consumer when its stream is dropped.
struct ConsumerGuard {
    broker: MemoryBroker,
    queue: String,
    tag: String,
}

impl Drop for ConsumerGuard {
    fn drop(&mut self) {
        self.broker.cancel(&self.queue, &self.tag);
    }
}

struct ConsumerStream {
    inner: UnboundedReceiverStream<Result<Delivery, TransportError>>,
    _guard: ConsumerGuard,
}

impl Stream for ConsumerStream {
    type Item = Result<Delivery, TransportError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

/// Settles a delivery against the memory broker, at most once.
pub(crate) struct MemoryAcker {
    broker: MemoryBroker,
    queue: String,
    tag: String,
    message: Mutex<Option<StoredMessage>>,
}

impl MemoryAcker {
    pub(crate) fn new(
        broker: MemoryBroker,
        queue: String,
        tag: String,
        message: StoredMessage,
    ) -> Self {
        Self {
            broker,
            queue,
            tag,
            message: Mutex::new(Some(message)),
        }
    }

    fn take(&self) -> Result<StoredMessage, TransportError> {
        self.message
            .lock()
            .take()
            .ok_or_else(|| TransportError::Ack("delivery already settled".to_string()))
    }
}

impl Debug for MemoryAcker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryAcker")
            .field("queue", &self.queue)
            .field("tag", &self.tag)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn ack(&self) -> Result<(), TransportError> {
        self.take()?;
        self.broker.settle(&self.queue, &self.tag, None);
        Ok(())
    }

    async fn nack(&self, _multiple: bool, requeue: bool) -> Result<(), TransportError> {
        let message = self.take()?;
        self.broker
            .settle(&self.queue, &self.tag, requeue.then_some(message));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use futures::StreamExt;

    async fn channel(transport: &MemoryTransport) -> (Arc<dyn Connection>, Arc<dyn Channel>) {
        let connection = transport.connect("amqp://localhost", None).await.unwrap();
        let channel = connection.create_channel().await.unwrap();
        (connection, channel)
    }

    fn body(text: &'static str) -> Bytes {
        Bytes::from_static(text.as_bytes())
    }

    #[tokio::test]
    async fn unroutable_mandatory_publish_is_returned() {
        let transport = MemoryTransport::new();
        let (_connection, channel) = channel(&transport).await;
        let mut events = channel.events();

        channel
            .send_to_queue("nobody", body("lost"), MessageProperties::default())
            .await
            .unwrap();
        channel
            .send_to_queue("gone", body("reply"), MessageProperties::reply("c-1"))
            .await
            .unwrap();

        assert_eq!(
            events.recv().await.unwrap(),
            TransportEvent::Return {
                exchange: String::new(),
                routing_key: "gone".to_string(),
                reply_code: 312,
                reply_text: "NO_ROUTE".to_string(),
            }
        );
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_send_to_queue_and_consume() {
        let _ = tracing_subscriber::fmt::try_init();

        let transport = MemoryTransport::new();
        let (_connection, channel) = channel(&transport).await;

        channel
            .declare_queue("jobs", &QueueOptions::default())
            .await
            .unwrap();
        channel
            .send_to_queue("jobs", body("hello"), MessageProperties::reply("c-1"))
            .await
            .unwrap();

        let mut deliveries = channel
            .consume("jobs", ConsumeOptions::default())
            .await
            .unwrap();
        let delivery = deliveries.next().await.unwrap().unwrap();

        assert_eq!(delivery.content, body("hello"));
        assert_eq!(delivery.properties.correlation_id.as_deref(), Some("c-1"));
        assert!(!delivery.properties.mandatory);
        assert!(!delivery.redelivered);
        delivery.ack().await.unwrap();

        assert_eq!(transport.broker().queue_info("jobs").unwrap().message_count, 0);
    }

    #[tokio::test]
    async fn test_nack_requeue_marks_redelivered() {
        let _ = tracing_subscriber::fmt::try_init();

        let transport = MemoryTransport::new();
        let (_connection, channel) = channel(&transport).await;
        channel
            .declare_queue("jobs", &QueueOptions::default())
            .await
            .unwrap();

        let mut deliveries = channel
            .consume("jobs", ConsumeOptions::default())
            .await
            .unwrap();
        channel
            .send_to_queue("jobs", body("retry me"), MessageProperties::default())
            .await
            .unwrap();

        let first = deliveries.next().await.unwrap().unwrap();
        first.nack(true).await.unwrap();

        let second = deliveries.next().await.unwrap().unwrap();
        assert!(second.redelivered);
        assert_eq!(second.consumer_tag, first.consumer_tag);
        second.nack(false).await.unwrap();

        assert_eq!(transport.broker().queue_info("jobs").unwrap().message_count, 0);
    }

    #[tokio::test]
    async fn test_double_settle_is_rejected() {
        let transport = MemoryTransport::new();
        let (_connection, channel) = channel(&transport).await;
        channel
            .declare_queue("jobs", &QueueOptions::default())
            .await
            .unwrap();
        channel
            .send_to_queue("jobs", body("once"), MessageProperties::default())
            .await
            .unwrap();

        let mut deliveries = channel
            .consume("jobs", ConsumeOptions::default())
            .await
            .unwrap();
        let delivery = deliveries.next().await.unwrap().unwrap();

        delivery.ack().await.unwrap();
        assert!(matches!(delivery.ack().await, Err(TransportError::Ack(_))));
    }

    #[tokio::test]
    async fn test_fanout_reaches_every_bound_queue() {
        let transport = MemoryTransport::new();
        let (_connection, channel) = channel(&transport).await;

        channel
            .declare_exchange("news", ExchangeKind::Fanout, &ExchangeOptions::default())
            .await
            .unwrap();
        let a = channel
            .declare_queue("", &QueueOptions::exclusive())
            .await
            .unwrap();
        let b = channel
            .declare_queue("", &QueueOptions::exclusive())
            .await
            .unwrap();
        channel.bind_queue(&a.name, "news", "").await.unwrap();
        channel.bind_queue(&b.name, "news", "").await.unwrap();

        channel
            .publish("news", "ignored", body("extra"), MessageProperties::default())
            .await
            .unwrap();

        assert_eq!(transport.broker().queue_info(&a.name).unwrap().message_count, 1);
        assert_eq!(transport.broker().queue_info(&b.name).unwrap().message_count, 1);
    }

    #[tokio::test]
    async fn test_consumer_count_and_auto_delete() {
        let transport = MemoryTransport::new();
        let (_connection, channel) = channel(&transport).await;

        let options = QueueOptions {
            auto_delete: true,
            ..QueueOptions::default()
        };
        channel.declare_queue("status", &options).await.unwrap();

        let first = channel
            .consume("status", ConsumeOptions::default())
            .await
            .unwrap();
        let second = channel
            .consume("status", ConsumeOptions::default())
            .await
            .unwrap();

        let info = channel.declare_queue("status", &options).await.unwrap();
        assert_eq!(info.consumer_count, 2);

        drop(first);
        assert_eq!(
            transport.broker().queue_info("status").unwrap().consumer_count,
            1
        );

        drop(second);
        assert!(transport.broker().queue_info("status").is_none());
    }

    #[tokio::test]
    async fn test_prefetch_limits_unacked_deliveries() {
        let transport = MemoryTransport::new();
        let (_connection, channel) = channel(&transport).await;
        channel
            .declare_queue("jobs", &QueueOptions::default())
            .await
            .unwrap();
        channel.prefetch(1).await.unwrap();

        let mut deliveries = channel
            .consume("jobs", ConsumeOptions::default())
            .await
            .unwrap();
        for text in ["one", "two"] {
            channel
                .send_to_queue("jobs", body(text), MessageProperties::default())
                .await
                .unwrap();
        }

        let first = deliveries.next().await.unwrap().unwrap();
        assert_eq!(transport.broker().queue_info("jobs").unwrap().message_count, 1);

        first.ack().await.unwrap();
        let second = deliveries.next().await.unwrap().unwrap();
        assert_eq!(second.content, body("two"));
    }

    #[tokio::test]
    async fn test_refused_urls_and_dial_accounting() {
        let transport = MemoryTransport::new();
        transport.refuse("amqp://down");

        let err = transport.connect("amqp://down", None).await.unwrap_err();
        assert!(matches!(err, TransportError::Connect { .. }));
        assert!(transport.connect("amqp://up", None).await.is_ok());

        assert_eq!(
            transport.dial_attempts(),
            vec!["amqp://down".to_string(), "amqp://up".to_string()]
        );
    }

    #[tokio::test]
    async fn test_close_twice_reports_already_closed() {
        let transport = MemoryTransport::new();
        let (connection, channel) = channel(&transport).await;
        let mut events = connection.events();

        connection.close().await.unwrap();
        assert_eq!(events.recv().await.unwrap(), TransportEvent::Close);
        assert_eq!(
            connection.close().await.unwrap_err(),
            TransportError::AlreadyClosed
        );
        assert_eq!(
            channel
                .declare_queue("late", &QueueOptions::default())
                .await
                .unwrap_err(),
            TransportError::Closed
        );
    }

    #[tokio::test]
    async fn test_sever_emits_error_then_close() {
        let transport = MemoryTransport::new();
        let (connection, _channel) = channel(&transport).await;
        let mut events = connection.events();

        transport.sever();

        assert!(matches!(events.recv().await.unwrap(), TransportEvent::Error(_)));
        assert_eq!(events.recv().await.unwrap(), TransportEvent::Close);
    }
}
