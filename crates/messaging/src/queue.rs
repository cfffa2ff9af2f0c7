//! Point-to-point work queues.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use courier_transport::{ConsumeOptions, MessageProperties};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::config::{ConsumerOptions, QueueClientOptions};
use crate::connection::ConnectionManager;
use crate::consumer::ConsumerCore;
use crate::envelope::{CodecError, Envelope};
use crate::error::{Error, Result};
use crate::handler::{ActionRegistrar, ConsumerHandler, Initializable};

/// Options for one fire-and-forget message.
#[derive(Clone, Debug, Default)]
pub struct SendOptions {
    /// Processing deadline, overriding the consumer default.
    pub timeout: Option<Duration>,
    /// Action the consumer should dispatch to.
    pub action: Option<String>,
    /// Binaries sent with the message.
    pub attachments: BTreeMap<String, Bytes>,
}

impl SendOptions {
    pub(crate) fn into_envelope(self, data: Value) -> Envelope {
        let mut envelope = Envelope::ok(data).with_attachments(self.attachments);
        if let Some(action) = self.action {
            envelope = envelope.with_action(action);
        }
        if let Some(timeout) = self.timeout {
            envelope = envelope.with_timeout(timeout);
        }
        envelope
    }
}

/// Sends messages to the queue `name`.
#[derive(Clone, Debug)]
pub struct QueueClient {
    name: String,
    manager: ConnectionManager,
    options: QueueClientOptions,
    declared: Arc<OnceCell<()>>,
}

impl QueueClient {
    /// Creates a client. The queue is declared on first send.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        manager: ConnectionManager,
        options: QueueClientOptions,
    ) -> Self {
        Self {
            name: name.into(),
            manager,
            options,
            declared: Arc::new(OnceCell::new()),
        }
    }

    /// The queue name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sends a typed payload.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::Codec`] before any I/O when the payload cannot be
    /// serialized, and with connection or transport errors otherwise.
    pub async fn send<T: Serialize + ?Sized + Sync>(&self, payload: &T) -> Result<()> {
        let data = serde_json::to_value(payload).map_err(|e| CodecError::Encode(e.to_string()))?;
        self.send_with(data, SendOptions::default()).await
    }

    /// Sends `data` with per-message options.
    ///
    /// # Errors
    ///
    /// Fails with connection or transport errors.
    pub async fn send_with(&self, data: Value, options: SendOptions) -> Result<()> {
        let content = options.into_envelope(data).encode()?;
        self.initialize().await?;

        let channel = self.manager.channel().await?;
        let properties = MessageProperties {
            persistent: self.options.persistent,
            ..MessageProperties::default()
        };
        channel.send_to_queue(&self.name, content, properties).await?;
        debug!(name = %self.name, "message sent");
        Ok(())
    }
}

#[async_trait]
impl Initializable for QueueClient {
    async fn initialize(&self) -> Result<()> {
        self.declared
            .get_or_try_init(|| async {
                let channel = self.manager.channel().await?;
                channel
                    .declare_queue(&self.name, &self.options.assert_queue_options)
                    .await?;
                Ok::<_, Error>(())
            })
            .await
            .map(|_| ())
    }
}

/// Consumes the queue `name` with bounded retries.
#[derive(Clone, Debug)]
pub struct QueueServer {
    manager: ConnectionManager,
    options: ConsumerOptions,
    core: Arc<ConsumerCore>,
    started: Arc<OnceCell<()>>,
}

impl QueueServer {
    /// Creates a server. Nothing is consumed until
    /// [`initialize`](Initializable::initialize).
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        manager: ConnectionManager,
        options: ConsumerOptions,
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

    /// The queue name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.core.name()
    }

    /// Stops consuming and waits for in-flight messages.
    pub async fn close(&self) {
        self.core.close().await;
    }

    async fn start(&self) -> Result<()> {
        let name = self.core.name();
        let channel = self.manager.channel().await?;
        channel.prefetch(self.options.prefetch_count).await?;
        channel
            .declare_queue(name, &self.options.assert_queue_options)
            .await?;
        let deliveries = channel.consume(name, ConsumeOptions::default()).await?;
        self.core.run(deliveries);

        info!(name, "queue server consuming");
        Ok(())
    }
}

#[async_trait]
impl Initializable for QueueServer {
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

impl ActionRegistrar for QueueServer {
    type Handler = dyn ConsumerHandler;

    fn register_action(&self, name: &str, handler: Arc<dyn ConsumerHandler>) -> bool {
        self.core.actions.register(name, handler)
    }

    fn consume(&self, handler: Arc<dyn ConsumerHandler>) {
        self.core.actions.set_fallback(handler);
    }
}
