//! Error types for the messaging layer.

use std::path::PathBuf;
use std::time::Duration;

use courier_transport::TransportError;
use serde_json::Value;
use thiserror::Error;

use crate::envelope::CodecError;

/// Result type alias for messaging operations.
pub type Result<T> = std::result::Result<T, Error>;

/// A broker endpoint that could not be reached.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EndpointFailure {
    /// The endpoint url with any password redacted.
    pub endpoint: String,
    /// Why dialing it failed.
    pub error: TransportError,
}

fn render_failures(failures: &[EndpointFailure]) -> String {
    failures
        .iter()
        .map(|failure| format!("{} ({})", failure.endpoint, failure.error))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Errors raised while establishing a connection or channel.
///
/// `Clone` so that one in-flight connection attempt can hand its outcome to
/// every caller waiting on it.
#[derive(Clone, Debug, Error)]
pub enum ConnectionError {
    /// The url configuration expanded to no endpoints.
    #[error("no broker urls configured")]
    NoEndpoints,

    /// A configured url could not be parsed.
    #[error("invalid broker url {url}: {reason}")]
    InvalidUrl {
        /// The offending url.
        url: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A TLS file could not be read.
    #[error("failed to read tls file {}: {reason}", path.display())]
    Tls {
        /// The file that was being read.
        path: PathBuf,
        /// Why reading failed.
        reason: String,
    },

    /// Every configured endpoint was tried and none accepted the connection.
    #[error("all broker endpoints failed: {}", render_failures(.0))]
    AllEndpointsFailed(Vec<EndpointFailure>),

    /// The manager was closed while the connection or channel was being
    /// established.
    #[error("closed while connecting")]
    Closed,

    /// The transport failed after the connection was established.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Main error type for messaging operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Connecting or opening a channel failed.
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// A broker operation failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Encoding or decoding an envelope failed.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Too many calls are pending on this client.
    #[error("{name}: too many pending calls (limit {limit})")]
    CapacityExceeded {
        /// The client name.
        name: String,
        /// The configured pending-call limit.
        limit: usize,
    },

    /// An RPC call received no reply before its deadline.
    #[error("rpc {name} timed out after {timeout:?} (id {id})")]
    RpcTimeout {
        /// The RPC name.
        name: String,
        /// The correlation id of the call.
        id: String,
        /// The deadline that elapsed.
        timeout: Duration,
    },

    /// A gathering request was not settled before its deadline.
    #[error(
        "gathering {name} timed out after {timeout:?} (id {id}, {received}/{expected} responders answered)"
    )]
    GatheringTimeout {
        /// The gathering name.
        name: String,
        /// The correlation id of the request.
        id: String,
        /// The deadline that elapsed.
        timeout: Duration,
        /// Status messages received before the deadline.
        received: u32,
        /// Responders listening when the request was sent.
        expected: u32,
    },

    /// Every responder of a gathering reported not found.
    #[error("{name}: resource not found {received}/{expected}")]
    NotFound {
        /// The gathering name.
        name: String,
        /// Not-found statuses received.
        received: u32,
        /// Responders listening when the request was sent.
        expected: u32,
    },

    /// The remote side replied with an error status.
    #[error("{name}: remote error: {reason}")]
    Remote {
        /// The RPC or gathering name.
        name: String,
        /// The data carried by the error reply.
        reason: Value,
    },

    /// The client was closed, or lost its reply queue, while the call was
    /// pending.
    #[error("{0} closed")]
    Closed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_failure_lists_every_endpoint() {
        let error = ConnectionError::AllEndpointsFailed(vec![
            EndpointFailure {
                endpoint: "amqp://a/".to_string(),
                error: TransportError::Connect {
                    url: "amqp://a/".to_string(),
                    reason: "refused".to_string(),
                },
            },
            EndpointFailure {
                endpoint: "amqp://b/".to_string(),
                error: TransportError::Closed,
            },
        ]);

        let message = error.to_string();
        assert!(message.contains("amqp://a/"));
        assert!(message.contains("amqp://b/ (connection closed)"));
    }

    #[test]
    fn gathering_timeout_names_the_tally() {
        let error = Error::GatheringTimeout {
            name: "inventory".to_string(),
            id: "abc".to_string(),
            timeout: Duration::from_millis(50),
            received: 1,
            expected: 3,
        };

        let message = error.to_string();
        assert!(message.contains("inventory"));
        assert!(message.contains("abc"));
        assert!(message.contains("1/3"));
    }
}
