//! Connection and channel lifecycle.
//!
//! [`ConnectionManager`] hands out one shared connection and one shared
//! channel. Both are dialed lazily on first use, and concurrent callers wait
//! on the same attempt. When a broker lists several endpoints they are tried
//! in order (optionally shuffled) until one accepts.
//!
//! Transport lifecycle events are re-emitted to subscribers as
//! [`ConnectionEvent`]s. A close event drops the cached connection (or
//! channel) so the next caller reconnects from scratch.

mod endpoint;
mod memo;

use std::fmt::{self, Debug};
use std::path::Path;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use courier_transport::{Channel, Connection, TlsMaterial, Transport, TransportError, TransportEvent};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{Instrument, debug, info, warn};

use crate::config::{ConnectionOptions, TlsOptions};
use crate::error::{ConnectionError, EndpointFailure};

pub use endpoint::{ActiveEndpoint, Endpoint};
use memo::{Memo, MemoState};

const EVENT_CAPACITY: usize = 64;

/// Where a lifecycle event originated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventScope {
    /// The broker connection.
    Connection,
    /// The shared channel.
    Channel,
}

/// Lifecycle events published by a [`ConnectionManager`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// A connection was established through this endpoint.
    Connected(ActiveEndpoint),
    /// A transport event forwarded from the connection or channel.
    Transport {
        /// Origin of the event.
        scope: EventScope,
        /// The event itself.
        event: TransportEvent,
    },
}

/// Connection phase of a [`ConnectionManager`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection and no attempt in flight.
    Disconnected,
    /// A connection attempt is in flight.
    Connecting,
    /// A connection is cached.
    Connected,
}

enum Target {
    Connection(Weak<dyn Connection>),
    Channel(Weak<dyn Channel>),
}

/// An established connection and the endpoint it went through.
#[derive(Clone)]
struct Link {
    connection: Arc<dyn Connection>,
    endpoint: ActiveEndpoint,
}

struct Inner {
    transport: Arc<dyn Transport>,
    options: ConnectionOptions,
    connection: Memo<Link>,
    channel: Memo<Arc<dyn Channel>>,
    events: broadcast::Sender<ConnectionEvent>,
}

/// Single point of access to a ready-to-use channel.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("transport", &self.inner.transport)
            .field("state", &self.state())
            .field("active", &self.active_endpoint())
            .finish_non_exhaustive()
    }
}

async fn read_tls_file(path: &Path) -> Result<Bytes, ConnectionError> {
    tokio::fs::read(path)
        .await
        .map(Bytes::from)
        .map_err(|e| ConnectionError::Tls {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
}

async fn load_tls(options: &TlsOptions) -> Result<TlsMaterial, ConnectionError> {
    let mut material = TlsMaterial {
        passphrase: options.passphrase.clone(),
        ..TlsMaterial::default()
    };
    if let Some(path) = &options.cert_file {
        material.cert = Some(read_tls_file(path).await?);
    }
    if let Some(path) = &options.key_file {
        material.key = Some(read_tls_file(path).await?);
    }
    if let Some(path) = &options.ca_file {
        material.ca = Some(read_tls_file(path).await?);
    }
    Ok(material)
}

impl ConnectionManager {
    /// Creates a manager that dials through `transport`. Nothing is dialed
    /// until [`connect`](Self::connect) or [`channel`](Self::channel).
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, options: ConnectionOptions) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                transport,
                options,
                connection: Memo::default(),
                channel: Memo::default(),
                events,
            }),
        }
    }

    /// Returns the shared connection, dialing it if needed.
    ///
    /// # Errors
    ///
    /// Fails if TLS material cannot be read or no endpoint accepts the
    /// connection. Every caller waiting on the same attempt sees the error.
    /// If the manager is closed while dialing, the new connection is closed
    /// again and callers get [`ConnectionError::Closed`].
    pub async fn connect(&self) -> Result<Arc<dyn Connection>, ConnectionError> {
        let inner = self.inner.clone();
        let link = self
            .inner
            .connection
            .get_or_try_init(move || async move { inner.dial().await }, discard_link)
            .await?;
        Ok(link.connection)
    }

    /// Returns the shared channel, opening it (and the connection) if needed.
    ///
    /// # Errors
    ///
    /// Fails if connecting fails or the channel cannot be opened.
    pub async fn channel(&self) -> Result<Arc<dyn Channel>, ConnectionError> {
        let manager = self.clone();
        self.inner
            .channel
            .get_or_try_init(
                move || async move {
                    let connection = manager.connect().await?;
                    let channel = connection.create_channel().await?;
                    manager.inner.forward(
                        EventScope::Channel,
                        channel.events(),
                        Target::Channel(Arc::downgrade(&channel)),
                    );
                    debug!("channel opened");
                    Ok(channel)
                },
                // The channel goes down with the connection close() shuts.
                |_| async {},
            )
            .await
    }

    /// Closes the connection if one is open and clears every cache.
    ///
    /// Closing an already closed connection is not an error.
    ///
    /// # Errors
    ///
    /// Returns the transport error if the broker refuses the close.
    pub async fn close(&self) -> Result<(), ConnectionError> {
        self.inner.channel.take();
        let link = self.inner.connection.take();

        if let Some(link) = link {
            match link.connection.close().await {
                Ok(()) => info!("connection closed"),
                Err(TransportError::AlreadyClosed) => debug!("connection was already closed"),
                Err(error) => return Err(error.into()),
            }
        }
        Ok(())
    }

    /// Subscribes to lifecycle events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    /// Current connection phase.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        match self.inner.connection.state() {
            MemoState::Empty => ConnectionState::Disconnected,
            MemoState::Pending => ConnectionState::Connecting,
            MemoState::Ready => ConnectionState::Connected,
        }
    }

    /// The endpoint the current connection was established through.
    #[must_use]
    pub fn active_endpoint(&self) -> Option<ActiveEndpoint> {
        self.inner.connection.peek().map(|link| link.endpoint)
    }
}

async fn discard_link(link: Link) {
    match link.connection.close().await {
        Ok(()) | Err(TransportError::AlreadyClosed) => {
            info!(host = %link.endpoint.host, "connection closed; manager closed while connecting");
        }
        Err(error) => warn!(%error, "failed to close connection opened during close"),
    }
}

impl Inner {
    async fn dial(self: Arc<Self>) -> Result<Link, ConnectionError> {
        let tls = match &self.options.tls {
            Some(options) => Some(load_tls(options).await?),
            None => None,
        };

        let mut endpoints = endpoint::expand(&self.options.url)?;
        if self.options.shuffle_urls {
            endpoint::shuffle(&mut endpoints);
        }

        let mut failures = Vec::new();
        for endpoint in endpoints {
            match self.transport.connect(endpoint.url(), tls.as_ref()).await {
                Ok(connection) => {
                    info!(
                        host = endpoint.host(),
                        vhost = endpoint.vhost(),
                        "connected to broker"
                    );
                    let active = endpoint.active();
                    self.forward(
                        EventScope::Connection,
                        connection.events(),
                        Target::Connection(Arc::downgrade(&connection)),
                    );
                    let _ = self.events.send(ConnectionEvent::Connected(active.clone()));
                    return Ok(Link {
                        connection,
                        endpoint: active,
                    });
                }
                Err(error) => {
                    warn!(url = endpoint.redacted(), %error, "broker endpoint unavailable");
                    failures.push(EndpointFailure {
                        endpoint: endpoint.redacted().to_string(),
                        error,
                    });
                }
            }
        }

        Err(ConnectionError::AllEndpointsFailed(failures))
    }

    fn publish(&self, scope: EventScope, event: TransportEvent) {
        if let TransportEvent::Error(reason) = &event {
            if self.events.receiver_count() == 0 {
                warn!(?scope, %reason, "broker error with no listeners");
                return;
            }
            warn!(?scope, %reason, "broker error");
        } else {
            debug!(?scope, ?event, "lifecycle event");
        }
        let _ = self.events.send(ConnectionEvent::Transport { scope, event });
    }

    fn invalidate(&self, target: &Target) {
        match target {
            Target::Connection(closed) => {
                let current = self.connection.reset_if(|link| {
                    std::ptr::addr_eq(Arc::as_ptr(&link.connection), closed.as_ptr())
                });
                if current {
                    self.channel.take();
                    info!("connection lost; next use reconnects");
                }
            }
            Target::Channel(closed) => {
                if self
                    .channel
                    .reset_if(|channel| std::ptr::addr_eq(Arc::as_ptr(channel), closed.as_ptr()))
                {
                    info!("channel lost; next use reopens");
                }
            }
        }
    }

    /// Re-emits events from one connection or channel until it closes.
    fn forward(
        self: &Arc<Self>,
        scope: EventScope,
        mut events: broadcast::Receiver<TransportEvent>,
        target: Target,
    ) {
        let manager = Arc::downgrade(self);
        let relay = async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(?scope, skipped, "lifecycle events dropped");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                let Some(inner) = manager.upgrade() else {
                    break;
                };

                let closed = event == TransportEvent::Close;
                inner.publish(scope, event);
                if closed {
                    inner.invalidate(&target);
                    break;
                }
            }
        };
        tokio::spawn(relay.in_current_span());
    }
}
