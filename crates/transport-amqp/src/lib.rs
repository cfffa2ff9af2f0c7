//! AMQP 0-9-1 transport backed by `lapin`.
//!
//! Connections are dialed with [`lapin::Connection::connect`] (or
//! `connect_with_config` when TLS material is supplied). Connection and
//! channel errors are forwarded as [`TransportEvent::Error`] followed by
//! [`TransportEvent::Close`] at their own scope. Channels run in publisher
//! confirm mode, so a publish resolves once the broker acked it, and a
//! returned mandatory publish surfaces as [`TransportEvent::Return`] on the
//! channel. Dropping a delivery stream cancels its consumer.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod convert;

use std::fmt::{self, Debug};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use courier_transport::{
    Acker, Channel, Connection, ConsumeOptions, Delivery, DeliveryStream, EVENT_CAPACITY,
    ExchangeKind, ExchangeOptions, MessageProperties, NoopAcker, QueueInfo, QueueOptions,
    TlsMaterial, Transport, TransportError, TransportEvent,
};
use futures::{Stream, StreamExt};
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
    BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions,
    QueueBindOptions, QueueDeclareOptions,
};
use lapin::tcp::{OwnedIdentity, OwnedTLSConfig};
use lapin::types::FieldTable;
use lapin::ConnectionProperties;
use tokio::sync::broadcast;
use tracing::{Instrument, debug, info, warn};
use uuid::Uuid;

use convert::{exchange_kind, field_table, from_basic_properties, to_basic_properties};

/// Dials AMQP brokers with `lapin`.
#[derive(Clone, Debug, Default)]
pub struct AmqpTransport;

impl AmqpTransport {
    /// Creates a new AMQP transport.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

fn tls_config(tls: &TlsMaterial) -> Result<OwnedTLSConfig, TransportError> {
    let identity = match (&tls.cert, &tls.key) {
        // lapin takes a PKCS#12 bundle; the key must be inside the certificate bundle.
        (Some(cert), _) => Some(OwnedIdentity {
            der: cert.to_vec(),
            password: tls.passphrase.clone().unwrap_or_default(),
        }),
        (None, Some(_)) => {
            return Err(TransportError::Tls(
                "a client key requires a client certificate bundle".to_string(),
            ));
        }
        (None, None) => None,
    };

    let cert_chain = tls
        .ca
        .as_ref()
        .map(|ca| {
            String::from_utf8(ca.to_vec())
                .map_err(|e| TransportError::Tls(format!("ca bundle is not PEM text: {e}")))
        })
        .transpose()?;

    Ok(OwnedTLSConfig {
        identity,
        cert_chain,
    })
}

#[async_trait]
impl Transport for AmqpTransport {
    async fn connect(
        &self,
        url: &str,
        tls: Option<&TlsMaterial>,
    ) -> Result<Arc<dyn Connection>, TransportError> {
        let properties = ConnectionProperties::default();

        let result = match tls {
            Some(tls) => {
                let config = tls_config(tls)?;
                lapin::Connection::connect_with_config(url, properties, config).await
            }
            None => lapin::Connection::connect(url, properties).await,
        };
        let connection = result.map_err(|e| TransportError::Connect {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let forward = events.clone();
        connection.on_error(move |error| {
            let _ = forward.send(TransportEvent::Error(error.to_string()));
            let _ = forward.send(TransportEvent::Close);
        });

        info!(tls = tls.is_some(), "AMQP connection established");

        Ok(Arc::new(AmqpConnection {
            inner: connection,
            events,
        }))
    }
}

struct AmqpConnection {
    inner: lapin::Connection,
    events: broadcast::Sender<TransportEvent>,
}

impl Debug for AmqpConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AmqpConnection")
            .field("connected", &self.inner.status().connected())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Connection for AmqpConnection {
    async fn create_channel(&self) -> Result<Arc<dyn Channel>, TransportError> {
        let channel = self
            .inner
            .create_channel()
            .await
            .map_err(|e| TransportError::Channel(e.to_string()))?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| TransportError::Channel(e.to_string()))?;

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let forward = events.clone();
        let id = channel.id();
        channel.on_error(move |error| {
            warn!(id, %error, "AMQP channel failed");
            let _ = forward.send(TransportEvent::Error(error.to_string()));
            let _ = forward.send(TransportEvent::Close);
        });

        debug!(id, "AMQP channel opened");
        Ok(Arc::new(AmqpChannel {
            inner: channel,
            events,
        }))
    }

    async fn close(&self) -> Result<(), TransportError> {
        if !self.inner.status().connected() {
            return Err(TransportError::AlreadyClosed);
        }

        self.inner
            .close(200, "closed by client")
            .await
            .map_err(|e| match e {
                lapin::Error::InvalidConnectionState(_) => TransportError::AlreadyClosed,
                other => TransportError::Channel(other.to_string()),
            })?;
        let _ = self.events.send(TransportEvent::Close);
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }
}

struct AmqpChannel {
    inner: lapin::Channel,
    events: broadcast::Sender<TransportEvent>,
}

impl Debug for AmqpChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AmqpChannel")
            .field("id", &self.inner.id())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Channel for AmqpChannel {
    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: &ExchangeOptions,
    ) -> Result<(), TransportError> {
        self.inner
            .exchange_declare(
                name,
                exchange_kind(kind),
                ExchangeDeclareOptions {
                    durable: options.durable,
                    auto_delete: options.auto_delete,
                    internal: options.internal,
                    ..ExchangeDeclareOptions::default()
                },
                field_table(&options.arguments),
            )
            .await
            .map_err(|e| TransportError::Declare {
                resource: name.to_string(),
                reason: e.to_string(),
            })
    }

    async fn declare_queue(
        &self,
        name: &str,
        options: &QueueOptions,
    ) -> Result<QueueInfo, TransportError> {
        let queue = self
            .inner
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: options.durable,
                    exclusive: options.exclusive,
                    auto_delete: options.auto_delete,
                    ..QueueDeclareOptions::default()
                },
                field_table(&options.arguments),
            )
            .await
            .map_err(|e| TransportError::Declare {
                resource: name.to_string(),
                reason: e.to_string(),
            })?;

        Ok(QueueInfo {
            name: queue.name().as_str().to_string(),
            message_count: queue.message_count(),
            consumer_count: queue.consumer_count(),
        })
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), TransportError> {
        self.inner
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| TransportError::Declare {
                resource: format!("binding {queue} -> {exchange}"),
                reason: e.to_string(),
            })
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        content: Bytes,
        properties: MessageProperties,
    ) -> Result<(), TransportError> {
        let confirm = self
            .inner
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    mandatory: properties.mandatory,
                    ..BasicPublishOptions::default()
                },
                &content,
                to_basic_properties(&properties),
            )
            .await
            .map_err(|e| TransportError::Publish(e.to_string()))?;

        let confirmation = confirm
            .await
            .map_err(|e| TransportError::Publish(e.to_string()))?;

        if confirmation.is_nack() {
            return Err(TransportError::Publish(format!(
                "broker rejected message for {exchange}/{routing_key}"
            )));
        }
        if let Some(returned) = confirmation.take_message() {
            warn!(exchange, routing_key, "AMQP message returned as unroutable");
            let _ = self.events.send(TransportEvent::Return {
                exchange: returned.delivery.exchange.as_str().to_string(),
                routing_key: returned.delivery.routing_key.as_str().to_string(),
                reply_code: returned.reply_code,
                reply_text: returned.reply_text.as_str().to_string(),
            });
        }
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        options: ConsumeOptions,
    ) -> Result<DeliveryStream, TransportError> {
        let tag = options
            .consumer_tag
            .unwrap_or_else(|| format!("courier-{}", Uuid::new_v4().simple()));
        let no_ack = options.no_ack;

        let consumer = self
            .inner
            .basic_consume(
                queue,
                &tag,
                BasicConsumeOptions {
                    no_ack,
                    exclusive: options.exclusive,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| TransportError::Consume(e.to_string()))?;

        info!(queue, tag = %tag, "AMQP consumer started");

        let cancel = CancelOnDrop {
            channel: self.inner.clone(),
            tag: tag.clone(),
        };
        let deliveries = consumer.map(move |item| {
            let delivery = item.map_err(|e| TransportError::Consume(e.to_string()))?;
            let acker: Arc<dyn Acker> = if no_ack {
                Arc::new(NoopAcker)
            } else {
                Arc::new(LapinAcker(delivery.acker.clone()))
            };
            Ok(Delivery::new(
                Bytes::from(delivery.data),
                from_basic_properties(&delivery.properties),
                delivery.redelivered,
                tag.clone(),
                delivery.routing_key.as_str().to_string(),
                acker,
            ))
        });
        Ok(Box::pin(ConsumerStream {
            inner: Box::pin(deliveries),
            _cancel: cancel,
        }))
    }

    async fn prefetch(&self, count: u16) -> Result<(), TransportError> {
        self.inner
            .basic_qos(count, BasicQosOptions::default())
            .await
            .map_err(|e| TransportError::Channel(e.to_string()))
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }
}

/// Cancels the consumer with the broker when its stream is dropped.
struct CancelOnDrop {
    channel: lapin::Channel,
    tag: String,
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if !self.channel.status().connected() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(tag = %self.tag, "no runtime to cancel AMQP consumer");
            return;
        };

        let channel = self.channel.clone();
        let tag = std::mem::take(&mut self.tag);
        let cancel = async move {
            match channel
                .basic_cancel(&tag, BasicCancelOptions::default())
                .await
            {
                Ok(()) => debug!(tag = %tag, "AMQP consumer cancelled"),
                Err(error) => debug!(tag = %tag, %error, "AMQP consumer cancel failed"),
            }
        };
        runtime.spawn(cancel.in_current_span());
    }
}

struct ConsumerStream {
    inner: DeliveryStream,
    _cancel: CancelOnDrop,
}

impl Stream for ConsumerStream {
    type Item = Result<Delivery, TransportError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

struct LapinAcker(lapin::acker::Acker);

impl Debug for LapinAcker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LapinAcker").finish_non_exhaustive()
    }
}

#[async_trait]
impl Acker for LapinAcker {
    async fn ack(&self) -> Result<(), TransportError> {
        self.0
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| TransportError::Ack(e.to_string()))
    }

    async fn nack(&self, multiple: bool, requeue: bool) -> Result<(), TransportError> {
        self.0
            .nack(BasicNackOptions { multiple, requeue })
            .await
            .map_err(|e| TransportError::Ack(e.to_string()))
    }
}
