use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use courier_transport::{
    Channel, ConsumeOptions, Delivery, ExchangeKind, ExchangeOptions, MessageProperties,
};
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::ack::AckGuard;
use crate::config::RpcServerOptions;
use crate::connection::ConnectionManager;
use crate::dispatch::{Deadline, run_detached, spawn_consumer};
use crate::envelope::Envelope;
use crate::error::{Error, Result};
use crate::handler::{ActionRegistrar, ActionTable, Initializable, Request, RpcHandler};

#[derive(Debug)]
struct Inner {
    name: String,
    manager: ConnectionManager,
    options: RpcServerOptions,
    actions: ActionTable<dyn RpcHandler>,
    started: OnceCell<()>,
    shutdown_token: CancellationToken,
    task_tracker: TaskTracker,
}

/// Serves requests sent to the queue `name`.
#[derive(Clone, Debug)]
pub struct RpcServer {
    inner: Arc<Inner>,
}

impl RpcServer {
    /// Creates a server. Nothing is consumed until
    /// [`initialize`](Initializable::initialize).
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        manager: ConnectionManager,
        options: RpcServerOptions,
    ) -> Self {
        let name = name.into();
        Self {
            inner: Arc::new(Inner {
                actions: ActionTable::new(name.clone()),
                name,
                manager,
                options,
                started: OnceCell::new(),
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

    /// Stops consuming and waits for in-flight requests, including handlers
    /// that already outlived their deadline.
    pub async fn close(&self) {
        self.inner.shutdown_token.cancel();
        self.inner.task_tracker.close();
        self.inner.task_tracker.wait().await;
        debug!(name = %self.inner.name, "rpc server closed");
    }
}

impl Inner {
    async fn start(self: &Arc<Self>) -> Result<()> {
        let channel = self.manager.channel().await?;
        channel.prefetch(self.options.prefetch_count).await?;
        channel
            .declare_queue(&self.name, &self.options.assert_queue_options)
            .await?;
        if let Some(exchange) = &self.options.bind_direct_exchange_name {
            channel
                .declare_exchange(exchange, ExchangeKind::Direct, &ExchangeOptions::default())
                .await?;
        }

        let requests = channel.consume(&self.name, ConsumeOptions::default()).await?;

        let server = Arc::clone(self);
        spawn_consumer(
            &self.task_tracker,
            self.shutdown_token.clone(),
            self.name.clone(),
            requests,
            move |delivery| {
                let server = server.clone();
                let channel = channel.clone();
                async move { server.process(channel.as_ref(), delivery).await }
            },
        );

        info!(name = %self.name, "rpc server consuming");
        Ok(())
    }

    async fn process(&self, channel: &dyn Channel, delivery: Delivery) {
        let guard = AckGuard::new(delivery);
        let delivery = guard.delivery();

        let envelope = match Envelope::decode(&delivery.content) {
            Ok(envelope) if envelope.is_ok() => envelope,
            Ok(_) => {
                error!(name = %self.name, "request with error status rejected");
                self.reply(channel, delivery, Envelope::error("cannot decode parameters"))
                    .await;
                guard.ack().await;
                return;
            }
            Err(e) => {
                error!(name = %self.name, error = %e, "malformed request rejected");
                self.reply(channel, delivery, Envelope::error("cannot decode parameters"))
                    .await;
                guard.ack().await;
                return;
            }
        };

        let request = Request::new(envelope, delivery);
        let Some(handler) = self.actions.resolve(request.action()) else {
            let action = request.action().unwrap_or_default().to_string();
            error!(name = %self.name, action = %action, "no handler for request");
            self.reply(
                channel,
                delivery,
                Envelope::error(format!("no handler for action '{action}'")),
            )
            .await;
            guard.ack().await;
            return;
        };

        let deadline = request
            .timeout()
            .unwrap_or_else(|| Duration::from_millis(self.options.timeout_ms));
        let outcome = run_detached(&self.task_tracker, &self.name, deadline, async move {
            handler.handle(request).await
        })
        .await;

        let reply = match outcome {
            Deadline::Finished(Ok(response)) => response.into_envelope().unwrap_or_else(|e| {
                error!(name = %self.name, error = %e, "cannot build reply");
                Envelope::error(e.to_string())
            }),
            Deadline::Finished(Err(e)) => {
                error!(name = %self.name, error = %e, "handler failed");
                Envelope::error(e.to_string())
            }
            Deadline::Expired => {
                warn!(name = %self.name, ?deadline, "handler exceeded its deadline");
                Envelope::error("response timed out")
            }
        };

        self.reply(channel, delivery, reply).await;
        guard.ack().await;
    }

    async fn reply(&self, channel: &dyn Channel, request: &Delivery, envelope: Envelope) {
        let (Some(correlation_id), Some(reply_to)) = (
            request.properties.correlation_id.as_deref(),
            request.properties.reply_to.as_deref(),
        ) else {
            error!(name = %self.name, "request without correlation id or reply queue; no reply sent");
            return;
        };

        let content = match envelope.encode() {
            Ok(content) => content,
            Err(e) => {
                error!(name = %self.name, correlation_id, error = %e, "cannot encode reply");
                return;
            }
        };

        let properties = MessageProperties::reply(correlation_id);
        let sent = match &self.options.bind_direct_exchange_name {
            Some(exchange) => channel.publish(exchange, reply_to, content, properties).await,
            None => channel.send_to_queue(reply_to, content, properties).await,
        };
        match sent {
            Ok(()) => debug!(name = %self.name, correlation_id, "reply sent"),
            Err(e) => error!(name = %self.name, correlation_id, error = %e, "cannot send reply"),
        }
    }
}

#[async_trait]
impl Initializable for RpcServer {
    async fn initialize(&self) -> Result<()> {
        if self.inner.shutdown_token.is_cancelled() {
            return Err(Error::Closed(self.inner.name.clone()));
        }
        self.inner
            .started
            .get_or_try_init(|| self.inner.start())
            .await
            .map(|_| ())
    }
}

impl ActionRegistrar for RpcServer {
    type Handler = dyn RpcHandler;

    fn register_action(&self, name: &str, handler: Arc<dyn RpcHandler>) -> bool {
        self.inner.actions.register(name, handler)
    }

    fn consume(&self, handler: Arc<dyn RpcHandler>) {
        self.inner.actions.set_fallback(handler);
    }
}
