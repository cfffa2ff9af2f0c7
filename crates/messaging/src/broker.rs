//! One connection, many named components.

use std::sync::Arc;

use courier_transport::Transport;
use dashmap::DashMap;
use tracing::info;

use crate::config::BrokerConfig;
use crate::connection::ConnectionManager;
use crate::error::Result;
use crate::gathering::{GatheringClient, GatheringServer};
use crate::pubsub::{Publisher, Subscriber};
use crate::queue::{QueueClient, QueueServer};
use crate::rpc::{RpcClient, RpcServer};

#[derive(Debug)]
struct Inner {
    manager: ConnectionManager,
    config: BrokerConfig,
    rpc_clients: DashMap<String, RpcClient>,
    rpc_servers: DashMap<String, RpcServer>,
    gathering_clients: DashMap<String, GatheringClient>,
    gathering_servers: DashMap<String, GatheringServer>,
    queue_clients: DashMap<String, QueueClient>,
    queue_servers: DashMap<String, QueueServer>,
    publishers: DashMap<String, Publisher>,
    subscribers: DashMap<String, Subscriber>,
}

/// Hands out clients and servers that share one connection and channel.
///
/// Each role keeps one instance per name: asking twice for the RPC client
/// `"users"` returns handles to the same client.
#[derive(Clone, Debug)]
pub struct Broker {
    inner: Arc<Inner>,
}

fn cached<T: Clone>(map: &DashMap<String, T>, name: &str, create: impl FnOnce() -> T) -> T {
    map.entry(name.to_string()).or_insert_with(create).clone()
}

fn drain<T: Clone>(map: &DashMap<String, T>) -> Vec<T> {
    let items = map.iter().map(|entry| entry.value().clone()).collect();
    map.clear();
    items
}

impl Broker {
    /// Creates a broker dialing through `transport`. Nothing is dialed until
    /// a component is used.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, config: BrokerConfig) -> Self {
        let manager = ConnectionManager::new(transport, config.connection.clone());
        Self {
            inner: Arc::new(Inner {
                manager,
                config,
                rpc_clients: DashMap::new(),
                rpc_servers: DashMap::new(),
                gathering_clients: DashMap::new(),
                gathering_servers: DashMap::new(),
                queue_clients: DashMap::new(),
                queue_servers: DashMap::new(),
                publishers: DashMap::new(),
                subscribers: DashMap::new(),
            }),
        }
    }

    /// The shared connection manager.
    #[must_use]
    pub fn manager(&self) -> &ConnectionManager {
        &self.inner.manager
    }

    /// The configuration components are created with.
    #[must_use]
    pub fn config(&self) -> &BrokerConfig {
        &self.inner.config
    }

    /// The RPC client for `name`.
    #[must_use]
    pub fn rpc_client(&self, name: &str) -> RpcClient {
        let inner = &self.inner;
        cached(&inner.rpc_clients, name, || {
            RpcClient::new(name, inner.manager.clone(), inner.config.rpc_client.clone())
        })
    }

    /// The RPC server for `name`.
    #[must_use]
    pub fn rpc_server(&self, name: &str) -> RpcServer {
        let inner = &self.inner;
        cached(&inner.rpc_servers, name, || {
            RpcServer::new(name, inner.manager.clone(), inner.config.rpc_server.clone())
        })
    }

    /// The gathering client for `name`.
    #[must_use]
    pub fn gathering_client(&self, name: &str) -> GatheringClient {
        let inner = &self.inner;
        cached(&inner.gathering_clients, name, || {
            GatheringClient::new(
                name,
                inner.manager.clone(),
                inner.config.gathering_client.clone(),
            )
        })
    }

    /// The gathering server for `name`.
    #[must_use]
    pub fn gathering_server(&self, name: &str) -> GatheringServer {
        let inner = &self.inner;
        cached(&inner.gathering_servers, name, || {
            GatheringServer::new(
                name,
                inner.manager.clone(),
                inner.config.gathering_server.clone(),
            )
        })
    }

    /// The queue client for `name`.
    #[must_use]
    pub fn queue_client(&self, name: &str) -> QueueClient {
        let inner = &self.inner;
        cached(&inner.queue_clients, name, || {
            QueueClient::new(name, inner.manager.clone(), inner.config.queue_client.clone())
        })
    }

    /// The queue server for `name`.
    #[must_use]
    pub fn queue_server(&self, name: &str) -> QueueServer {
        let inner = &self.inner;
        cached(&inner.queue_servers, name, || {
            QueueServer::new(name, inner.manager.clone(), inner.config.queue_server.clone())
        })
    }

    /// The publisher for `name`.
    #[must_use]
    pub fn publisher(&self, name: &str) -> Publisher {
        let inner = &self.inner;
        cached(&inner.publishers, name, || {
            Publisher::new(name, inner.manager.clone(), inner.config.publisher.clone())
        })
    }

    /// The subscriber for `name`.
    #[must_use]
    pub fn subscriber(&self, name: &str) -> Subscriber {
        let inner = &self.inner;
        cached(&inner.subscribers, name, || {
            Subscriber::new(name, inner.manager.clone(), inner.config.subscriber.clone())
        })
    }

    /// Closes every component created so far, then the connection.
    ///
    /// # Errors
    ///
    /// Fails if closing the connection fails; already closed is not an error.
    pub async fn close(&self) -> Result<()> {
        let inner = &self.inner;
        for client in drain(&inner.rpc_clients) {
            client.close().await;
        }
        for client in drain(&inner.gathering_clients) {
            client.close().await;
        }
        for server in drain(&inner.rpc_servers) {
            server.close().await;
        }
        for server in drain(&inner.gathering_servers) {
            server.close().await;
        }
        for server in drain(&inner.queue_servers) {
            server.close().await;
        }
        for subscriber in drain(&inner.subscribers) {
            subscriber.close().await;
        }
        inner.queue_clients.clear();
        inner.publishers.clear();

        inner.manager.close().await?;
        info!("broker closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use courier_transport_memory::MemoryTransport;

    use super::*;

    #[test]
    fn components_are_cached_per_role_and_name() {
        let broker = Broker::new(Arc::new(MemoryTransport::new()), BrokerConfig::default());

        let a = broker.rpc_client("users");
        let b = broker.rpc_client("users");
        let c = broker.rpc_client("orders");
        assert_eq!(a.name(), "users");
        assert_eq!(b.name(), "users");
        assert_eq!(c.name(), "orders");
        assert_eq!(broker.inner.rpc_clients.len(), 2);

        let _server = broker.rpc_server("users");
        let _gathering = broker.gathering_client("users");
        assert_eq!(broker.inner.rpc_servers.len(), 1);
        assert_eq!(broker.inner.gathering_clients.len(), 1);
    }
}
