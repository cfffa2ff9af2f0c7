use thiserror::Error;

/// Errors surfaced by a broker transport.
///
/// Variants carry rendered messages rather than backend error values so the
/// type stays `Clone` and can be handed to every waiter of a shared attempt.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    /// Dialing the broker failed.
    #[error("failed to connect to {url}: {reason}")]
    Connect {
        /// The (credential-free) url that was dialed.
        url: String,
        /// Why the dial failed.
        reason: String,
    },

    /// The connection was already closed when close was requested.
    #[error("connection already closed")]
    AlreadyClosed,

    /// The connection or channel is closed.
    #[error("connection closed")]
    Closed,

    /// Opening a channel failed.
    #[error("failed to open channel: {0}")]
    Channel(String),

    /// Declaring or binding topology failed.
    #[error("failed to declare {resource}: {reason}")]
    Declare {
        /// The exchange or queue being declared.
        resource: String,
        /// Why the declaration failed.
        reason: String,
    },

    /// Publishing failed.
    #[error("failed to publish: {0}")]
    Publish(String),

    /// Starting or reading a consumer failed.
    #[error("consumer error: {0}")]
    Consume(String),

    /// Acknowledging a delivery failed.
    #[error("failed to acknowledge delivery: {0}")]
    Ack(String),

    /// TLS material was rejected.
    #[error("invalid tls material: {0}")]
    Tls(String),
}
