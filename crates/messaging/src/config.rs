//! Configuration for connections and every client/server role.
//!
//! All option structs deserialize from camelCase JSON and fill missing fields
//! with defaults, so an application can load them from its own config files.

use std::path::PathBuf;

use courier_transport::{ExchangeOptions, QueueOptions};
use serde::{Deserialize, Serialize};

/// Default call and processing deadline, in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 60_000;

/// Default limit on simultaneously pending calls per client.
pub const DEFAULT_QUEUE_MAX_SIZE: usize = 10_000;

/// Default number of unacknowledged deliveries per channel.
pub const DEFAULT_PREFETCH_COUNT: u16 = 10;

/// Default number of redeliveries before a message is dropped.
pub const DEFAULT_MAX_RETRY: u32 = 5;

/// Where to find the broker.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BrokerUrls {
    /// One url.
    Single(String),
    /// Several urls tried in order.
    Many(Vec<String>),
    /// Several hostnames sharing the other url components.
    Hosts(HostList),
}

impl Default for BrokerUrls {
    fn default() -> Self {
        Self::Single("amqp://localhost:5672".to_string())
    }
}

fn default_protocol() -> String {
    "amqp".to_string()
}

/// Hostnames expanded into one url each.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostList {
    /// Hosts tried in order.
    pub hostnames: Vec<String>,
    /// Url scheme, `amqp` or `amqps`.
    #[serde(default = "default_protocol")]
    pub protocol: String,
    /// Port shared by every host.
    #[serde(default)]
    pub port: Option<u16>,
    /// User name.
    #[serde(default)]
    pub username: Option<String>,
    /// Password.
    #[serde(default)]
    pub password: Option<String>,
    /// Virtual host.
    #[serde(default)]
    pub vhost: Option<String>,
}

/// Files holding TLS material.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TlsOptions {
    /// Client certificate.
    pub cert_file: Option<PathBuf>,
    /// Client private key.
    pub key_file: Option<PathBuf>,
    /// Certificate authority bundle.
    pub ca_file: Option<PathBuf>,
    /// Passphrase for the key material.
    pub passphrase: Option<String>,
}

/// Connection settings.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ConnectionOptions {
    /// Broker url(s).
    pub url: BrokerUrls,
    /// Randomize the failover order on every connection attempt.
    pub shuffle_urls: bool,
    /// TLS material, if the connection is encrypted with client credentials.
    pub tls: Option<TlsOptions>,
}

/// RPC client settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RpcClientOptions {
    /// Default call deadline in milliseconds.
    pub timeout_ms: u64,
    /// Maximum simultaneously pending calls.
    pub queue_max_size: usize,
    /// Declare options for the request queue.
    pub assert_queue_options: QueueOptions,
    /// Existing reply queue to use instead of a server-named one.
    pub reply_queue_name: Option<String>,
    /// Route replies through this direct exchange.
    pub bind_direct_exchange_name: Option<String>,
}

impl Default for RpcClientOptions {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_TIMEOUT_MS,
            queue_max_size: DEFAULT_QUEUE_MAX_SIZE,
            assert_queue_options: QueueOptions::default(),
            reply_queue_name: None,
            bind_direct_exchange_name: None,
        }
    }
}

/// RPC server settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RpcServerOptions {
    /// Default response deadline in milliseconds.
    pub timeout_ms: u64,
    /// Unacknowledged requests held at once.
    pub prefetch_count: u16,
    /// Declare options for the request queue.
    pub assert_queue_options: QueueOptions,
    /// Publish replies through this direct exchange.
    pub bind_direct_exchange_name: Option<String>,
}

impl Default for RpcServerOptions {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_TIMEOUT_MS,
            prefetch_count: DEFAULT_PREFETCH_COUNT,
            assert_queue_options: QueueOptions::default(),
            bind_direct_exchange_name: None,
        }
    }
}

fn status_queue_options() -> QueueOptions {
    QueueOptions {
        auto_delete: true,
        ..QueueOptions::default()
    }
}

/// Gathering client settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GatheringClientOptions {
    /// Default request deadline in milliseconds.
    pub timeout_ms: u64,
    /// Maximum simultaneously pending requests.
    pub queue_max_size: usize,
    /// Declare options for the fanout exchange.
    pub assert_exchange_options: ExchangeOptions,
    /// Declare options for the status queue. Must match the servers'.
    pub assert_queue_options: QueueOptions,
}

impl Default for GatheringClientOptions {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_TIMEOUT_MS,
            queue_max_size: DEFAULT_QUEUE_MAX_SIZE,
            assert_exchange_options: ExchangeOptions::default(),
            assert_queue_options: status_queue_options(),
        }
    }
}

/// Gathering server settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GatheringServerOptions {
    /// Default response deadline in milliseconds.
    pub timeout_ms: u64,
    /// Unacknowledged announcements held at once.
    pub prefetch_count: u16,
    /// Declare options for the fanout exchange.
    pub assert_exchange_options: ExchangeOptions,
    /// Declare options for the status queue. Must match the clients'.
    pub assert_queue_options: QueueOptions,
}

impl Default for GatheringServerOptions {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_TIMEOUT_MS,
            prefetch_count: DEFAULT_PREFETCH_COUNT,
            assert_exchange_options: ExchangeOptions::default(),
            assert_queue_options: status_queue_options(),
        }
    }
}

/// Point-to-point producer settings.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct QueueClientOptions {
    /// Declare options for the queue.
    pub assert_queue_options: QueueOptions,
    /// Ask the broker to persist messages.
    pub persistent: bool,
}

/// Settings for consumers running the retry/ack state machine.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ConsumerOptions {
    /// Default processing deadline in milliseconds.
    pub timeout_ms: u64,
    /// Unacknowledged deliveries held at once.
    pub prefetch_count: u16,
    /// Redeliveries allowed before a message is dropped.
    pub max_retry: u32,
    /// Declare options for the consumed queue.
    pub assert_queue_options: QueueOptions,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_TIMEOUT_MS,
            prefetch_count: DEFAULT_PREFETCH_COUNT,
            max_retry: DEFAULT_MAX_RETRY,
            assert_queue_options: QueueOptions::default(),
        }
    }
}

/// Fanout publisher settings.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PublisherOptions {
    /// Declare options for the exchange.
    pub assert_exchange_options: ExchangeOptions,
    /// Ask the broker to persist messages.
    pub persistent: bool,
}

/// Fanout subscriber settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SubscriberOptions {
    /// Default processing deadline in milliseconds.
    pub timeout_ms: u64,
    /// Unacknowledged deliveries held at once.
    pub prefetch_count: u16,
    /// Redeliveries allowed before a message is dropped.
    pub max_retry: u32,
    /// Declare options for the exchange.
    pub assert_exchange_options: ExchangeOptions,
    /// Declare options for a named subscription queue.
    pub assert_queue_options: QueueOptions,
    /// Shared subscription queue; an exclusive server-named queue when unset.
    pub queue_name: Option<String>,
}

impl Default for SubscriberOptions {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_TIMEOUT_MS,
            prefetch_count: DEFAULT_PREFETCH_COUNT,
            max_retry: DEFAULT_MAX_RETRY,
            assert_exchange_options: ExchangeOptions::default(),
            assert_queue_options: QueueOptions::default(),
            queue_name: None,
        }
    }
}

/// Everything a [`Broker`](crate::Broker) needs.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BrokerConfig {
    /// Connection settings.
    pub connection: ConnectionOptions,
    /// Defaults for RPC clients.
    pub rpc_client: RpcClientOptions,
    /// Defaults for RPC servers.
    pub rpc_server: RpcServerOptions,
    /// Defaults for gathering clients.
    pub gathering_client: GatheringClientOptions,
    /// Defaults for gathering servers.
    pub gathering_server: GatheringServerOptions,
    /// Defaults for queue clients.
    pub queue_client: QueueClientOptions,
    /// Defaults for queue servers.
    pub queue_server: ConsumerOptions,
    /// Defaults for publishers.
    pub publisher: PublisherOptions,
    /// Defaults for subscribers.
    pub subscriber: SubscriberOptions,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config: BrokerConfig = serde_json::from_str("{}").unwrap();

        assert_eq!(config, BrokerConfig::default());
        assert_eq!(config.rpc_client.timeout_ms, 60_000);
        assert_eq!(config.rpc_client.queue_max_size, 10_000);
        assert_eq!(config.queue_server.prefetch_count, 10);
        assert_eq!(config.subscriber.max_retry, 5);
        assert!(!config.connection.shuffle_urls);
    }

    #[test]
    fn url_forms() {
        let single: ConnectionOptions =
            serde_json::from_str(r#"{"url":"amqp://one"}"#).unwrap();
        assert_eq!(single.url, BrokerUrls::Single("amqp://one".to_string()));

        let many: ConnectionOptions =
            serde_json::from_str(r#"{"url":["amqp://one","amqp://two"],"shuffleUrls":true}"#)
                .unwrap();
        assert!(many.shuffle_urls);
        assert!(matches!(many.url, BrokerUrls::Many(ref urls) if urls.len() == 2));

        let hosts: ConnectionOptions = serde_json::from_str(
            r#"{"url":{"hostnames":["a","b"],"port":5671,"protocol":"amqps","vhost":"prod"}}"#,
        )
        .unwrap();
        let BrokerUrls::Hosts(list) = hosts.url else {
            panic!("expected a host list");
        };
        assert_eq!(list.hostnames, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(list.port, Some(5671));
        assert_eq!(list.protocol, "amqps");
    }

    #[test]
    fn role_options_take_camel_case_knobs() {
        let options: RpcServerOptions = serde_json::from_str(
            r#"{"timeoutMs":250,"prefetchCount":1,"bindDirectExchangeName":"replies","assertQueueOptions":{"durable":true}}"#,
        )
        .unwrap();

        assert_eq!(options.timeout_ms, 250);
        assert_eq!(options.prefetch_count, 1);
        assert_eq!(options.bind_direct_exchange_name.as_deref(), Some("replies"));
        assert!(options.assert_queue_options.durable);
    }
}
