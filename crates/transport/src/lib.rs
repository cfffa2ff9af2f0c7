//! Broker transport contract.
//!
//! This crate defines the connection, channel and delivery primitives the
//! messaging layer is built on. Backends (in-process memory, AMQP) live in
//! separate crates and implement these traits.
//!
//! A transport dials a broker and yields a [`Connection`]. A connection hands
//! out multiplexed [`Channel`]s which declare topology, publish and consume.
//! Both scopes broadcast [`TransportEvent`]s describing their lifecycle.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod error;
mod message;
mod options;

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::broadcast;

pub use error::TransportError;
pub use message::{
    Acker, Delivery, DeliveryStream, KIND_REPLY, KIND_STATUS, MessageProperties, NoopAcker,
};
pub use options::{
    ArgumentValue, Arguments, ConsumeOptions, ExchangeKind, ExchangeOptions, QueueInfo,
    QueueOptions,
};

/// Capacity of lifecycle event broadcast channels.
pub const EVENT_CAPACITY: usize = 64;

/// Lifecycle events emitted at connection and channel scope.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    /// The connection or channel failed.
    Error(String),
    /// The connection or channel closed.
    Close,
    /// The broker stopped accepting publishes.
    Blocked(String),
    /// The broker resumed accepting publishes.
    Unblocked,
    /// Buffered publishes were flushed.
    Drain,
    /// A mandatory message could not be routed and was returned.
    Return {
        /// Exchange the message was published to.
        exchange: String,
        /// Routing key it was published with.
        routing_key: String,
        /// Broker reply code.
        reply_code: u16,
        /// Broker reply text.
        reply_text: String,
    },
}

/// TLS material already read from disk.
#[derive(Clone, Default)]
pub struct TlsMaterial {
    /// Client certificate (PKCS#12 bundle or PEM, backend dependent).
    pub cert: Option<Bytes>,
    /// Client private key.
    pub key: Option<Bytes>,
    /// Certificate authority chain.
    pub ca: Option<Bytes>,
    /// Passphrase protecting the key material.
    pub passphrase: Option<String>,
}

impl Debug for TlsMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsMaterial")
            .field("cert", &self.cert.as_ref().map(Bytes::len))
            .field("key", &self.key.as_ref().map(|_| "<redacted>"))
            .field("ca", &self.ca.as_ref().map(Bytes::len))
            .field("passphrase", &self.passphrase.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Dials brokers.
#[async_trait]
pub trait Transport: Debug + Send + Sync + 'static {
    /// Opens a connection to `url`, using `tls` when provided.
    async fn connect(
        &self,
        url: &str,
        tls: Option<&TlsMaterial>,
    ) -> Result<Arc<dyn Connection>, TransportError>;
}

/// An open broker connection.
#[async_trait]
pub trait Connection: Debug + Send + Sync + 'static {
    /// Opens a new multiplexed channel.
    async fn create_channel(&self) -> Result<Arc<dyn Channel>, TransportError>;

    /// Closes the connection.
    ///
    /// Returns [`TransportError::AlreadyClosed`] if it was closed before.
    async fn close(&self) -> Result<(), TransportError>;

    /// Subscribes to connection lifecycle events.
    fn events(&self) -> broadcast::Receiver<TransportEvent>;
}

/// A multiplexed channel on a connection.
#[async_trait]
pub trait Channel: Debug + Send + Sync + 'static {
    /// Declares an exchange if it does not exist.
    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: &ExchangeOptions,
    ) -> Result<(), TransportError>;

    /// Declares a queue if it does not exist. An empty name asks the broker to
    /// generate one.
    async fn declare_queue(
        &self,
        name: &str,
        options: &QueueOptions,
    ) -> Result<QueueInfo, TransportError>;

    /// Binds `queue` to `exchange` under `routing_key`.
    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), TransportError>;

    /// Publishes to an exchange. Resolves once the broker accepted the
    /// message, which is how publish backpressure surfaces.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        content: Bytes,
        properties: MessageProperties,
    ) -> Result<(), TransportError>;

    /// Publishes directly to a queue through the default exchange.
    async fn send_to_queue(
        &self,
        queue: &str,
        content: Bytes,
        properties: MessageProperties,
    ) -> Result<(), TransportError> {
        self.publish("", queue, content, properties).await
    }

    /// Starts consuming `queue`.
    async fn consume(
        &self,
        queue: &str,
        options: ConsumeOptions,
    ) -> Result<DeliveryStream, TransportError>;

    /// Limits the number of unacknowledged deliveries held by this channel.
    async fn prefetch(&self, count: u16) -> Result<(), TransportError>;

    /// Subscribes to channel lifecycle events.
    fn events(&self) -> broadcast::Receiver<TransportEvent>;
}
