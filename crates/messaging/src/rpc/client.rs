use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use courier_transport::{
    ConsumeOptions, Delivery, ExchangeKind, ExchangeOptions, MessageProperties, QueueOptions,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument, warn};

use crate::config::RpcClientOptions;
use crate::connection::ConnectionManager;
use crate::correlation::{CorrelationRegistry, Expired};
use crate::dispatch::spawn_consumer_with_end;
use crate::envelope::{CodecError, Envelope};
use crate::error::{Error, Result};
use crate::handler::{CallOptions, Callable, Initializable, Reply};

#[derive(Debug)]
struct PendingRpc {
    full_response: bool,
}

type Registry = CorrelationRegistry<PendingRpc, Result<Reply>>;

#[derive(Debug)]
struct Inner {
    name: String,
    manager: ConnectionManager,
    options: RpcClientOptions,
    registry: Registry,
    reply_queue: Mutex<Arc<OnceCell<String>>>,
    shutdown_token: CancellationToken,
    task_tracker: TaskTracker,
}

/// Calls the RPC server consuming the queue `name`.
#[derive(Clone, Debug)]
pub struct RpcClient {
    inner: Arc<Inner>,
}

impl RpcClient {
    /// Creates a client. Topology is declared on first use.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        manager: ConnectionManager,
        options: RpcClientOptions,
    ) -> Self {
        let name = name.into();
        let registry = CorrelationRegistry::new(
            name.clone(),
            options.queue_max_size,
            Duration::from_millis(options.timeout_ms),
        );

        Self {
            inner: Arc::new(Inner {
                name,
                manager,
                options,
                registry,
                reply_queue: Mutex::new(Arc::new(OnceCell::new())),
                shutdown_token: CancellationToken::new(),
                task_tracker: TaskTracker::new(),
            }),
        }
    }

    /// The RPC name, which is also the request queue.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Number of calls awaiting a reply.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.inner.registry.len()
    }

    /// Calls with a typed payload and decodes the reply data into `R`.
    ///
    /// The payload is serialized before anything is sent, so a payload that
    /// cannot be represented fails without touching the broker.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::Codec`] for unserializable payloads or replies of
    /// the wrong shape, and as [`call_with`](Callable::call_with) otherwise.
    pub async fn call<T, R>(&self, payload: &T) -> Result<R>
    where
        T: Serialize + ?Sized + Sync,
        R: DeserializeOwned,
    {
        let data = serde_json::to_value(payload).map_err(|e| CodecError::Encode(e.to_string()))?;
        let reply = self.call_with(data, CallOptions::default()).await?;
        reply.payload().map_err(Error::from)
    }

    /// Stops consuming replies and fails every pending call with
    /// [`Error::Closed`].
    pub async fn close(&self) {
        self.inner.shutdown_token.cancel();
        self.inner.registry.clear();
        self.inner.task_tracker.close();
        self.inner.task_tracker.wait().await;
        debug!(name = %self.inner.name, "rpc client closed");
    }
}

impl Inner {
    fn ensure_open(&self) -> Result<()> {
        if self.shutdown_token.is_cancelled() {
            return Err(Error::Closed(self.name.clone()));
        }
        Ok(())
    }

    async fn reply_queue(self: &Arc<Self>) -> Result<String> {
        let cell = self.reply_queue.lock().clone();
        cell.get_or_try_init(|| self.setup(&cell)).await.cloned()
    }

    /// The reply consumer is gone: replies to pending calls cannot arrive,
    /// and the next call declares a fresh reply queue.
    fn replies_lost(&self, cell: &Arc<OnceCell<String>>) {
        {
            let mut current = self.reply_queue.lock();
            if Arc::ptr_eq(&current, cell) {
                *current = Arc::new(OnceCell::new());
            }
        }
        warn!(
            name = %self.name,
            pending = self.registry.len(),
            "reply queue lost; failing pending calls"
        );
        self.registry.clear();
    }

    async fn setup(self: &Arc<Self>, cell: &Arc<OnceCell<String>>) -> Result<String> {
        let channel = self.manager.channel().await?;
        channel
            .declare_queue(&self.name, &self.options.assert_queue_options)
            .await?;

        let (reply_queue, exclusive) = match &self.options.reply_queue_name {
            Some(name) => (
                channel.declare_queue(name, &QueueOptions::default()).await?,
                false,
            ),
            None => (
                channel.declare_queue("", &QueueOptions::exclusive()).await?,
                true,
            ),
        };
        let reply_queue = reply_queue.name;

        if let Some(exchange) = &self.options.bind_direct_exchange_name {
            channel
                .declare_exchange(exchange, ExchangeKind::Direct, &ExchangeOptions::default())
                .await?;
            channel.bind_queue(&reply_queue, exchange, &reply_queue).await?;
        }

        let replies = channel
            .consume(
                &reply_queue,
                ConsumeOptions {
                    no_ack: true,
                    exclusive,
                    consumer_tag: None,
                },
            )
            .await?;

        let registry = self.registry.clone();
        let name = self.name.clone();
        let client: Weak<Self> = Arc::downgrade(self);
        let cell = cell.clone();
        spawn_consumer_with_end(
            &self.task_tracker,
            self.shutdown_token.clone(),
            self.name.clone(),
            replies,
            move |delivery| {
                settle_reply(&registry, &name, &delivery);
                async {}
            },
            move || {
                if let Some(client) = client.upgrade() {
                    client.replies_lost(&cell);
                }
            },
        );

        info!(name = %self.name, reply_queue = %reply_queue, "rpc client ready");
        Ok(reply_queue)
    }
}

fn settle_reply(registry: &Registry, name: &str, delivery: &Delivery) {
    let Some(id) = delivery.properties.correlation_id.as_deref() else {
        warn!(name, "reply without correlation id discarded");
        return;
    };

    let decoded = Envelope::decode(&delivery.content);
    registry.update(id, |call| {
        Some(match decoded {
            Ok(envelope) if envelope.is_ok() => Ok(Reply::new(envelope, call.full_response)),
            Ok(envelope) => Err(Error::Remote {
                name: name.to_string(),
                reason: envelope.data,
            }),
            Err(e) => Err(Error::Codec(e)),
        })
    });
}

#[async_trait]
impl Initializable for RpcClient {
    async fn initialize(&self) -> Result<()> {
        self.inner.ensure_open()?;
        self.inner.reply_queue().await.map(drop)
    }
}

#[async_trait]
impl Callable for RpcClient {
    type Output = Reply;

    #[instrument(skip_all, fields(name = %self.inner.name))]
    async fn call_with(&self, data: Value, options: CallOptions) -> Result<Reply> {
        let inner = &self.inner;
        inner.ensure_open()?;
        inner.registry.ensure_capacity()?;

        let reply_to = inner.reply_queue().await?;
        let channel = inner.manager.channel().await?;

        let mut envelope = Envelope::ok(data).with_attachments(options.attachments);
        if let Some(action) = options.action {
            envelope = envelope.with_action(action);
        }
        if let Some(timeout) = options.timeout {
            envelope = envelope.with_timeout(timeout);
        }
        let timeout = options
            .timeout
            .unwrap_or_else(|| Duration::from_millis(inner.options.timeout_ms));
        let content = envelope.encode()?;

        let call = inner.registry.register(
            Some(timeout),
            PendingRpc {
                full_response: options.full_response,
            },
        )?;
        let id = call.id().to_string();
        debug!(correlation_id = %id, "sending request");

        channel
            .send_to_queue(&inner.name, content, MessageProperties::request(&id, reply_to))
            .await?;

        match call.wait().await {
            Ok(outcome) => outcome,
            Err(Expired::TimedOut(_)) => Err(Error::RpcTimeout {
                name: inner.name.clone(),
                id,
                timeout,
            }),
            Err(Expired::Dropped) => Err(Error::Closed(inner.name.clone())),
        }
    }
}
