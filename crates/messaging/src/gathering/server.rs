use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use courier_transport::{
    Channel, ConsumeOptions, Delivery, ExchangeKind, KIND_REPLY, KIND_STATUS, MessageProperties,
    QueueOptions,
};
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::status_queue;
use crate::ack::AckGuard;
use crate::config::GatheringServerOptions;
use crate::connection::ConnectionManager;
use crate::dispatch::{Deadline, run_detached, spawn_consumer};
use crate::envelope::Envelope;
use crate::error::{Error, Result};
use crate::handler::{
    ActionRegistrar, ActionTable, GatherOutcome, GatheringHandler, Initializable, Request,
};

#[derive(Debug)]
struct Inner {
    name: String,
    status_queue: String,
    manager: ConnectionManager,
    options: GatheringServerOptions,
    actions: ActionTable<dyn GatheringHandler>,
    started: OnceCell<()>,
    shutdown_token: CancellationToken,
    task_tracker: TaskTracker,
}

/// One responder of the gathering `name`.
#[derive(Clone, Debug)]
pub struct GatheringServer {
    inner: Arc<Inner>,
}

/// Where the answer to one announcement goes.
struct ReplyRoute<'a> {
    correlation_id: &'a str,
    reply_to: &'a str,
}

impl GatheringServer {
    /// Creates a responder. Nothing is consumed until
    /// [`initialize`](Initializable::initialize).
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        manager: ConnectionManager,
        options: GatheringServerOptions,
    ) -> Self {
        let name = name.into();
        Self {
            inner: Arc::new(Inner {
                actions: ActionTable::new(name.clone()),
                status_queue: status_queue(&name),
                name,
                manager,
                options,
                started: OnceCell::new(),
                shutdown_token: CancellationToken::new(),
                task_tracker: TaskTracker::new(),
            }),
        }
    }

    /// The gathering name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Stops responding. Leaving the status queue removes this responder
    /// from the count clients wait for.
    pub async fn close(&self) {
        self.inner.shutdown_token.cancel();
        self.inner.task_tracker.close();
        self.inner.task_tracker.wait().await;
        debug!(name = %self.inner.name, "gathering server closed");
    }
}

impl Inner {
    async fn start(self: &Arc<Self>) -> Result<()> {
        let channel = self.manager.channel().await?;
        channel.prefetch(self.options.prefetch_count).await?;
        channel
            .declare_exchange(
                &self.name,
                ExchangeKind::Fanout,
                &self.options.assert_exchange_options,
            )
            .await?;

        let queue = channel
            .declare_queue("", &QueueOptions::exclusive())
            .await?
            .name;
        channel.bind_queue(&queue, &self.name, "").await?;

        channel
            .declare_queue(&self.status_queue, &self.options.assert_queue_options)
            .await?;
        let presence = channel
            .consume(
                &self.status_queue,
                ConsumeOptions {
                    no_ack: true,
                    ..ConsumeOptions::default()
                },
            )
            .await?;
        spawn_consumer(
            &self.task_tracker,
            self.shutdown_token.clone(),
            self.status_queue.clone(),
            presence,
            |_| async {},
        );

        let announcements = channel
            .consume(
                &queue,
                ConsumeOptions {
                    exclusive: true,
                    ..ConsumeOptions::default()
                },
            )
            .await?;
        let server = Arc::clone(self);
        spawn_consumer(
            &self.task_tracker,
            self.shutdown_token.clone(),
            self.name.clone(),
            announcements,
            move |delivery| {
                let server = server.clone();
                let channel = channel.clone();
                async move { server.process(channel.as_ref(), delivery).await }
            },
        );

        info!(name = %self.name, queue = %queue, "gathering server listening");
        Ok(())
    }

    async fn process(&self, channel: &dyn Channel, delivery: Delivery) {
        let guard = AckGuard::new(delivery);
        let delivery = guard.delivery();

        let (Some(correlation_id), Some(reply_to)) = (
            delivery.properties.correlation_id.as_deref(),
            delivery.properties.reply_to.as_deref(),
        ) else {
            error!(name = %self.name, "announcement without correlation id or reply queue rejected");
            guard.nack(false).await;
            return;
        };
        let route = ReplyRoute {
            correlation_id,
            reply_to,
        };

        let envelope = match Envelope::decode(&delivery.content) {
            Ok(envelope) if envelope.is_ok() => envelope,
            Ok(_) => {
                error!(name = %self.name, correlation_id, "announcement with error status rejected");
                self.status(channel, &route, Envelope::error("cannot decode parameters"))
                    .await;
                guard.nack(false).await;
                return;
            }
            Err(e) => {
                error!(name = %self.name, correlation_id, error = %e, "malformed announcement rejected");
                self.status(channel, &route, Envelope::error("cannot decode parameters"))
                    .await;
                guard.nack(false).await;
                return;
            }
        };

        let request = Request::new(envelope, delivery);
        let Some(handler) = self.actions.resolve(request.action()) else {
            let action = request.action().unwrap_or_default().to_string();
            error!(name = %self.name, action = %action, "no handler for announcement");
            self.status(
                channel,
                &route,
                Envelope::error(format!("no handler for action '{action}'")),
            )
            .await;
            guard.nack(false).await;
            return;
        };

        let deadline = request
            .timeout()
            .unwrap_or_else(|| Duration::from_millis(self.options.timeout_ms));
        let outcome = run_detached(&self.task_tracker, &self.name, deadline, async move {
            handler.handle(request).await
        })
        .await;

        match outcome {
            Deadline::Expired => {
                warn!(name = %self.name, correlation_id, ?deadline, "handler exceeded its deadline");
                self.status(channel, &route, Envelope::ok("response timed out".into()))
                    .await;
                guard.nack(false).await;
            }
            Deadline::Finished(Ok(GatherOutcome::NotFound)) => {
                debug!(name = %self.name, correlation_id, "not found");
                self.status(channel, &route, Envelope::ok("not found".into()))
                    .await;
                guard.nack(false).await;
            }
            Deadline::Finished(Ok(GatherOutcome::Error(reason))) => {
                warn!(name = %self.name, correlation_id, reason = %reason, "responder reported an error");
                self.answer(channel, &route, Envelope::error(reason)).await;
                guard.ack().await;
            }
            Deadline::Finished(Ok(GatherOutcome::Found(response))) => {
                match response.into_envelope() {
                    Ok(envelope) => {
                        self.answer(channel, &route, envelope).await;
                        guard.ack().await;
                    }
                    Err(e) => {
                        error!(name = %self.name, correlation_id, error = %e, "cannot build reply");
                        self.status(channel, &route, Envelope::error(e.to_string()))
                            .await;
                        guard.nack(false).await;
                    }
                }
            }
            Deadline::Finished(Err(e)) => {
                error!(name = %self.name, correlation_id, error = %e, "handler failed");
                self.status(channel, &route, Envelope::error(e.to_string()))
                    .await;
                guard.nack(false).await;
            }
        }
    }

    async fn status(&self, channel: &dyn Channel, route: &ReplyRoute<'_>, envelope: Envelope) {
        self.send(channel, route, KIND_STATUS, envelope).await;
    }

    async fn answer(&self, channel: &dyn Channel, route: &ReplyRoute<'_>, envelope: Envelope) {
        self.send(channel, route, KIND_REPLY, envelope).await;
    }

    async fn send(
        &self,
        channel: &dyn Channel,
        route: &ReplyRoute<'_>,
        kind: &str,
        envelope: Envelope,
    ) {
        let correlation_id = route.correlation_id;
        let content = match envelope.encode() {
            Ok(content) => content,
            Err(e) => {
                error!(name = %self.name, correlation_id, error = %e, "cannot encode {kind}");
                return;
            }
        };

        let properties = MessageProperties::reply(correlation_id).with_kind(kind);
        match channel.send_to_queue(route.reply_to, content, properties).await {
            Ok(()) => debug!(name = %self.name, correlation_id, kind, "sent"),
            Err(e) => error!(name = %self.name, correlation_id, error = %e, "cannot send {kind}"),
        }
    }
}

#[async_trait]
impl Initializable for GatheringServer {
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

impl ActionRegistrar for GatheringServer {
    type Handler = dyn GatheringHandler;

    fn register_action(&self, name: &str, handler: Arc<dyn GatheringHandler>) -> bool {
        self.inner.actions.register(name, handler)
    }

    fn consume(&self, handler: Arc<dyn GatheringHandler>) {
        self.inner.actions.set_fallback(handler);
    }
}
