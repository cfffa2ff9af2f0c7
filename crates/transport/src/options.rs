use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Extra declare-time arguments passed through to the broker verbatim
/// (`x-message-ttl`, `x-dead-letter-exchange`, ...).
pub type Arguments = BTreeMap<String, ArgumentValue>;

/// A single declare-time argument value.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ArgumentValue {
    /// Boolean flag.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// Text.
    Text(String),
}

/// Routing behaviour of an exchange.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    /// Routes on exact routing key match.
    Direct,
    /// Copies every message to every bound queue.
    Fanout,
    /// Routes on dotted routing key patterns.
    Topic,
    /// Routes on message headers.
    Headers,
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            Self::Direct => "direct",
            Self::Fanout => "fanout",
            Self::Topic => "topic",
            Self::Headers => "headers",
        };
        f.write_str(kind)
    }
}

/// Options for declaring an exchange.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ExchangeOptions {
    /// Survive broker restarts.
    pub durable: bool,
    /// Delete once the last binding is removed.
    pub auto_delete: bool,
    /// Not directly publishable by clients.
    pub internal: bool,
    /// Broker-specific arguments.
    pub arguments: Arguments,
}

/// Options for declaring a queue.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct QueueOptions {
    /// Survive broker restarts.
    pub durable: bool,
    /// Owned by the declaring connection and deleted with it.
    pub exclusive: bool,
    /// Delete once the last consumer goes away.
    pub auto_delete: bool,
    /// Broker-specific arguments.
    pub arguments: Arguments,
}

impl QueueOptions {
    /// Options for a private, server-named reply queue.
    #[must_use]
    pub fn exclusive() -> Self {
        Self {
            exclusive: true,
            auto_delete: true,
            ..Self::default()
        }
    }
}

/// Options for starting a consumer.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConsumeOptions {
    /// Deliveries are acknowledged by the broker on send.
    pub no_ack: bool,
    /// No other consumer may attach to the queue.
    pub exclusive: bool,
    /// Consumer tag; generated by the transport when absent.
    pub consumer_tag: Option<String>,
}

/// Result of a queue declaration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueInfo {
    /// Actual queue name (server-generated when declared with an empty name).
    pub name: String,
    /// Messages ready for delivery.
    pub message_count: u32,
    /// Consumers currently attached.
    pub consumer_count: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_options_accept_camel_case_and_untagged_arguments() {
        let options: QueueOptions = serde_json::from_str(
            r#"{"durable":true,"autoDelete":true,"arguments":{"x-message-ttl":5000,"x-queue-mode":"lazy"}}"#,
        )
        .unwrap();

        assert!(options.durable);
        assert!(options.auto_delete);
        assert!(!options.exclusive);
        assert_eq!(
            options.arguments.get("x-message-ttl"),
            Some(&ArgumentValue::Int(5000))
        );
        assert_eq!(
            options.arguments.get("x-queue-mode"),
            Some(&ArgumentValue::Text("lazy".to_string()))
        );
    }

    #[test]
    fn exchange_kind_is_lowercase() {
        let kind: ExchangeKind = serde_json::from_str(r#""fanout""#).unwrap();
        assert_eq!(kind, ExchangeKind::Fanout);
        assert_eq!(ExchangeKind::Topic.to_string(), "topic");
    }
}
