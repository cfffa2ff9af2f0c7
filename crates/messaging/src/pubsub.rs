//! Broadcast over a fanout exchange.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use courier_transport::{ConsumeOptions, ExchangeKind, MessageProperties, QueueOptions};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::config::{PublisherOptions, SubscriberOptions};
use crate::connection::ConnectionManager;
use crate::consumer::ConsumerCore;
use crate::envelope::CodecError;
use crate::error::{Error, Result};
use crate::handler::{ActionRegistrar, ConsumerHandler, Initializable};
use crate::queue::SendOptions;

/// Publishes to the fanout exchange `name`.
#[derive(Clone, Debug)]
pub struct Publisher {
    name: String,
    manager: ConnectionManager,
    options: PublisherOptions,
    declared: Arc<OnceCell<()>>,
}

impl Publisher {
    /// Creates a publisher. The exchange is declared on first publish.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        manager: ConnectionManager,
        options: PublisherOptions,
    ) -> Self {
        Self {
            name: name.into(),
            manager,
            options,
            declared: Arc::new(OnceCell::new()),
        }
    }

    /// The exchange name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Publishes a typed payload.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::Codec`] before any I/O when the payload cannot be
    /// serialized, and with connection or transport errors otherwise.
    pub async fn publish<T: Serialize + ?Sized + Sync>(&self, payload: &T) -> Result<()> {
        let data = serde_json::to_value(payload).map_err(|e| CodecError::Encode(e.to_string()))?;
        self.publish_with(data, SendOptions::default()).await
    }

    /// Publishes `data` with per-message options.
    ///
    /// # Errors
    ///
    /// Fails with connection or transport errors.
    pub async fn publish_with(&self, data: Value, options: SendOptions) -> Result<()> {
        let content = options.into_envelope(data).encode()?;
        self.initialize().await?;

        let channel = self.manager.channel().await?;
        let properties = MessageProperties {
            persistent: self.options.persistent,
            ..MessageProperties::default()
        };
        channel.publish(&self.name, "", content, properties).await?;
        debug!(name = %self.name, "message published");
        Ok(())
    }
}

#[async_trait]
impl Initializable for Publisher {
    async fn initialize(&self) -> Result<()> {
        self.declared
            .get_or_try_init(|| async {
                let channel = self.manager.channel().await?;
                channel
                    .declare_exchange(
                        &self.name,
                        ExchangeKind::Fanout,
                        &self.options.assert_exchange_options,
                    )
                    .await?;
                Ok::<_, Error>(())
            })
            .await
            .map(|_| ())
    }
}

/// Receives everything published to the fanout exchange `name`.
#[derive(Clone, Debug)]
pub struct Subscriber {
    manager: ConnectionManager,
    options: SubscriberOptions,
    core: Arc<ConsumerCore>,
    started: Arc<OnceCell<String>>,
}

impl Subscriber {
    /// Creates a subscriber. Nothing is consumed until
    /// [`initialize`](Initializable::initialize).
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        manager: ConnectionManager,
        options: SubscriberOptions,
    ) -> Self {
        let core = ConsumerCore::new(
            name,
            Duration::from_millis(options.timeout_ms),
            options.max_retry,
        );
        Self {
            manager,
            options,
            core: Arc::new(core),
            started: Arc::new(OnceCell::new()),
        }
    }

    /// The exchange name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.core.name()
    }

    /// The queue bound to the exchange, once initialized.
    #[must_use]
    pub fn queue(&self) -> Option<&str> {
        self.started.get().map(String::as_str)
    }

    /// Stops consuming and waits for in-flight messages.
    pub async fn close(&self) {
        self.core.close().await;
    }

    async fn start(&self) -> Result<String> {
        let name = self.core.name();
        let channel = self.manager.channel().await?;
        channel.prefetch(self.options.prefetch_count).await?;
        channel
            .declare_exchange(
                name,
                ExchangeKind::Fanout,
                &self.options.assert_exchange_options,
            )
            .await?;

        let (queue, exclusive) = match &self.options.queue_name {
            Some(queue) => (
                channel
                    .declare_queue(queue, &self.options.assert_queue_options)
                    .await?,
                false,
            ),
            None => (
                channel.declare_queue("", &QueueOptions::exclusive()).await?,
                true,
            ),
        };
        let queue = queue.name;
        channel.bind_queue(&queue, name, "").await?;

        let deliveries = channel
            .consume(
                &queue,
                ConsumeOptions {
                    exclusive,
                    ..ConsumeOptions::default()
                },
            )
            .await?;
        self.core.run(deliveries);

        info!(name, queue = %queue, "subscriber consuming");
        Ok(queue)
    }
}

#[async_trait]
impl Initializable for Subscriber {
    async fn initialize(&self) -> Result<()> {
        if self.core.shutdown_token.is_cancelled() {
            return Err(Error::Closed(self.core.name().to_string()));
        }
        self.started
            .get_or_try_init(|| self.start())
            .await
            .map(|_| ())
    }
}

impl ActionRegistrar for Subscriber {
    type Handler = dyn ConsumerHandler;

    fn register_action(&self, name: &str, handler: Arc<dyn ConsumerHandler>) -> bool {
        self.core.actions.register(name, handler)
    }

    fn consume(&self, handler: Arc<dyn ConsumerHandler>) {
        self.core.actions.set_fallback(handler);
    }
}
