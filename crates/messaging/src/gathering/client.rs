use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use courier_transport::{
    ConsumeOptions, Delivery, ExchangeKind, KIND_STATUS, MessageProperties, QueueOptions,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument, warn};

use super::status_queue;
use crate::config::GatheringClientOptions;
use crate::connection::ConnectionManager;
use crate::correlation::{CorrelationRegistry, Expired};
use crate::dispatch::spawn_consumer_with_end;
use crate::envelope::{CodecError, Envelope};
use crate::error::{Error, Result};
use crate::handler::{CallOptions, Callable, Initializable, Reply};

#[derive(Debug)]
struct PendingGather {
    full_response: bool,
    accept_not_found: bool,
    expected: u32,
    received: u32,
}

impl PendingGather {
    fn not_found(&self, name: &str) -> Result<Option<Reply>> {
        if self.accept_not_found {
            Ok(None)
        } else {
            Err(Error::NotFound {
                name: name.to_string(),
                received: self.received,
                expected: self.expected,
            })
        }
    }
}

type Registry = CorrelationRegistry<PendingGather, Result<Option<Reply>>>;

#[derive(Debug)]
struct Inner {
    name: String,
    status_queue: String,
    manager: ConnectionManager,
    options: GatheringClientOptions,
    registry: Registry,
    reply_queue: Mutex<Arc<OnceCell<String>>>,
    shutdown_token: CancellationToken,
    task_tracker: TaskTracker,
}

/// Broadcasts requests to every server of the gathering `name`.
#[derive(Clone, Debug)]
pub struct GatheringClient {
    inner: Arc<Inner>,
}

impl GatheringClient {
    /// Creates a client. Topology is declared on first use.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        manager: ConnectionManager,
        options: GatheringClientOptions,
    ) -> Self {
        let name = name.into();
        let registry = CorrelationRegistry::new(
            name.clone(),
            options.queue_max_size,
            Duration::from_millis(options.timeout_ms),
        );

        Self {
            inner: Arc::new(Inner {
                status_queue: status_queue(&name),
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

    /// The gathering name, which is also the fanout exchange.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Number of requests awaiting an answer.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.inner.registry.len()
    }

    /// Broadcasts `data` and waits for the first answer.
    ///
    /// Resolves to `Ok(None)` when every responder reported not found and
    /// `accept_not_found` is set.
    ///
    /// # Errors
    ///
    /// - [`Error::CapacityExceeded`] when too many requests are pending.
    /// - [`Error::NotFound`] when every responder reported not found and
    ///   `accept_not_found` is unset.
    /// - [`Error::Remote`] when a responder reported an error.
    /// - [`Error::GatheringTimeout`] with the status tally when the deadline
    ///   passes first.
    #[instrument(skip_all, fields(name = %self.inner.name))]
    pub async fn request(
        &self,
        data: Value,
        options: CallOptions,
        accept_not_found: bool,
    ) -> Result<Option<Reply>> {
        let inner = &self.inner;
        inner.ensure_open()?;
        inner.registry.ensure_capacity()?;

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

        let reply_to = inner.reply_queue().await?;
        let channel = inner.manager.channel().await?;
        let expected = channel
            .declare_queue(&inner.status_queue, &inner.options.assert_queue_options)
            .await?
            .consumer_count;

        let state = PendingGather {
            full_response: options.full_response,
            accept_not_found,
            expected,
            received: 0,
        };
        if expected == 0 {
            debug!("no responders listening");
            return state.not_found(&inner.name);
        }

        let call = inner.registry.register(Some(timeout), state)?;
        let id = call.id().to_string();
        debug!(correlation_id = %id, expected, "broadcasting request");

        channel
            .publish(&inner.name, "", content, MessageProperties::request(&id, reply_to))
            .await?;

        match call.wait().await {
            Ok(outcome) => outcome,
            Err(Expired::TimedOut(state)) => Err(Error::GatheringTimeout {
                name: inner.name.clone(),
                id,
                timeout,
                received: state.received,
                expected: state.expected,
            }),
            Err(Expired::Dropped) => Err(Error::Closed(inner.name.clone())),
        }
    }

    /// Broadcasts a typed payload; decodes the answer into `R`.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::Codec`] for unserializable payloads or answers of
    /// the wrong shape, and as [`request`](Self::request) otherwise.
    pub async fn gather<T, R>(&self, payload: &T) -> Result<Option<R>>
    where
        T: Serialize + ?Sized + Sync,
        R: DeserializeOwned,
    {
        let data = serde_json::to_value(payload).map_err(|e| CodecError::Encode(e.to_string()))?;
        match self.request(data, CallOptions::default(), true).await? {
            Some(reply) => Ok(Some(reply.payload()?)),
            None => Ok(None),
        }
    }

    /// Stops consuming answers and fails every pending request with
    /// [`Error::Closed`].
    pub async fn close(&self) {
        self.inner.shutdown_token.cancel();
        self.inner.registry.clear();
        self.inner.task_tracker.close();
        self.inner.task_tracker.wait().await;
        debug!(name = %self.inner.name, "gathering client closed");
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

    /// The answer consumer is gone: pending requests cannot be settled, and
    /// the next request declares a fresh reply queue.
    fn answers_lost(&self, cell: &Arc<OnceCell<String>>) {
        {
            let mut current = self.reply_queue.lock();
            if Arc::ptr_eq(&current, cell) {
                *current = Arc::new(OnceCell::new());
            }
        }
        warn!(
            name = %self.name,
            pending = self.registry.len(),
            "reply queue lost; failing pending requests"
        );
        self.registry.clear();
    }

    async fn setup(self: &Arc<Self>, cell: &Arc<OnceCell<String>>) -> Result<String> {
        let channel = self.manager.channel().await?;
        channel
            .declare_exchange(
                &self.name,
                ExchangeKind::Fanout,
                &self.options.assert_exchange_options,
            )
            .await?;

        let reply_queue = channel
            .declare_queue("", &QueueOptions::exclusive())
            .await?
            .name;
        let answers = channel
            .consume(
                &reply_queue,
                ConsumeOptions {
                    no_ack: true,
                    exclusive: true,
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
            answers,
            move |delivery| {
                settle_answer(&registry, &name, &delivery);
                async {}
            },
            move || {
                if let Some(client) = client.upgrade() {
                    client.answers_lost(&cell);
                }
            },
        );

        info!(name = %self.name, reply_queue = %reply_queue, "gathering client ready");
        Ok(reply_queue)
    }
}

fn settle_answer(registry: &Registry, name: &str, delivery: &Delivery) {
    let Some(id) = delivery.properties.correlation_id.as_deref() else {
        warn!(name, "answer without correlation id discarded");
        return;
    };

    let is_status = delivery.properties.kind.as_deref() == Some(KIND_STATUS);
    let decoded = Envelope::decode(&delivery.content);
    registry.update(id, |call| match decoded {
        Err(e) => Some(Err(Error::Codec(e))),
        Ok(envelope) if !envelope.is_ok() => Some(Err(Error::Remote {
            name: name.to_string(),
            reason: envelope.data,
        })),
        Ok(_) if is_status => {
            call.received += 1;
            debug!(
                name,
                correlation_id = id,
                received = call.received,
                expected = call.expected,
                "status received"
            );
            (call.received >= call.expected).then(|| call.not_found(name))
        }
        Ok(envelope) => Some(Ok(Some(Reply::new(envelope, call.full_response)))),
    });
}

#[async_trait]
impl Initializable for GatheringClient {
    async fn initialize(&self) -> Result<()> {
        self.inner.ensure_open()?;
        self.inner.reply_queue().await.map(drop)
    }
}

#[async_trait]
impl Callable for GatheringClient {
    type Output = Option<Reply>;

    async fn call_with(&self, data: Value, options: CallOptions) -> Result<Option<Reply>> {
        self.request(data, options, true).await
    }
}
