use std::fmt::{self, Debug};
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;

use crate::error::TransportError;

/// Message type marking a gathering status message.
pub const KIND_STATUS: &str = "status";

/// Message type marking a gathering reply message.
pub const KIND_REPLY: &str = "reply";

/// Wire-level properties attached to a published message.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MessageProperties {
    /// Pairs a request with its reply.
    pub correlation_id: Option<String>,
    /// Queue the reply should be routed to.
    pub reply_to: Option<String>,
    /// Message type (`status` or `reply` for gathering replies).
    pub kind: Option<String>,
    /// Ask the broker to persist the message.
    pub persistent: bool,
    /// Publish flag: an unroutable message is returned to the publisher as
    /// [`TransportEvent::Return`](crate::TransportEvent::Return) instead of
    /// being dropped. Never set on received messages.
    pub mandatory: bool,
}

impl MessageProperties {
    /// Properties for a request expecting a reply on `reply_to`.
    #[must_use]
    pub fn request(correlation_id: impl Into<String>, reply_to: impl Into<String>) -> Self {
        Self {
            correlation_id: Some(correlation_id.into()),
            reply_to: Some(reply_to.into()),
            ..Self::default()
        }
    }

    /// Properties for a reply to `correlation_id`. Replies are mandatory so
    /// a vanished reply queue surfaces as a returned message.
    #[must_use]
    pub fn reply(correlation_id: impl Into<String>) -> Self {
        Self {
            correlation_id: Some(correlation_id.into()),
            mandatory: true,
            ..Self::default()
        }
    }

    /// Sets the message type.
    #[must_use]
    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }
}

/// Settles a delivery with the broker.
#[async_trait]
pub trait Acker: Debug + Send + Sync + 'static {
    /// Positively acknowledges the delivery.
    async fn ack(&self) -> Result<(), TransportError>;

    /// Negatively acknowledges the delivery, optionally requeueing it.
    async fn nack(&self, multiple: bool, requeue: bool) -> Result<(), TransportError>;
}

/// Acker for deliveries consumed with `no_ack`.
#[derive(Debug, Default)]
pub struct NoopAcker;

#[async_trait]
impl Acker for NoopAcker {
    async fn ack(&self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn nack(&self, _multiple: bool, _requeue: bool) -> Result<(), TransportError> {
        Ok(())
    }
}

/// A message handed to a consumer.
#[derive(Clone)]
pub struct Delivery {
    /// Encoded message body.
    pub content: Bytes,
    /// Wire properties.
    pub properties: MessageProperties,
    /// The broker already delivered this message once before.
    pub redelivered: bool,
    /// Identifies the consumer stream this delivery belongs to.
    pub consumer_tag: String,
    /// Routing key the message was published with.
    pub routing_key: String,
    acker: Arc<dyn Acker>,
}

impl Delivery {
    /// Creates a delivery settled through `acker`.
    #[must_use]
    pub fn new(
        content: Bytes,
        properties: MessageProperties,
        redelivered: bool,
        consumer_tag: impl Into<String>,
        routing_key: impl Into<String>,
        acker: Arc<dyn Acker>,
    ) -> Self {
        Self {
            content,
            properties,
            redelivered,
            consumer_tag: consumer_tag.into(),
            routing_key: routing_key.into(),
            acker,
        }
    }

    /// Positively acknowledges the delivery.
    ///
    /// # Errors
    ///
    /// Returns an error if the broker rejects the acknowledgement.
    pub async fn ack(&self) -> Result<(), TransportError> {
        self.acker.ack().await
    }

    /// Negatively acknowledges the delivery.
    ///
    /// # Errors
    ///
    /// Returns an error if the broker rejects the acknowledgement.
    pub async fn nack(&self, requeue: bool) -> Result<(), TransportError> {
        self.acker.nack(false, requeue).await
    }
}

impl Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("len", &self.content.len())
            .field("properties", &self.properties)
            .field("redelivered", &self.redelivered)
            .field("consumer_tag", &self.consumer_tag)
            .field("routing_key", &self.routing_key)
            .finish_non_exhaustive()
    }
}

/// Stream of deliveries produced by a consumer.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<Delivery, TransportError>> + Send>>;
