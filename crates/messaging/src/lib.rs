//! Request/response, scatter/gather, work queues and pub/sub over a broker
//! transport.
//!
//! Every component is built from a [`ConnectionManager`], which owns the one
//! connection and channel they share. [`Broker`] wires that up from a
//! [`BrokerConfig`] and caches components by name.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use courier_messaging::{Broker, BrokerConfig, Initializable, ActionRegistrar, Request, Response, HandlerError};
//! # async fn demo(transport: Arc<dyn courier_transport::Transport>) -> courier_messaging::Result<()> {
//! async fn ping(_request: Request) -> Result<Response, HandlerError> {
//!     Ok(Response::new("pong"))
//! }
//!
//! let broker = Broker::new(transport, BrokerConfig::default());
//!
//! let server = broker.rpc_server("ping");
//! server.consume(Arc::new(ping));
//! server.initialize().await?;
//!
//! let pong: String = broker.rpc_client("ping").call("ping").await?;
//! assert_eq!(pong, "pong");
//! # Ok(())
//! # }
//! ```
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod ack;

/// Named component cache over one connection.
pub mod broker;

/// Serde-backed configuration for every role.
pub mod config;

/// Connection and channel lifecycle.
pub mod connection;

mod consumer;

/// Pending-call bookkeeping for clients awaiting replies.
pub mod correlation;

mod dispatch;

/// The wire envelope.
pub mod envelope;

/// Error types.
pub mod error;

/// Scatter/gather.
pub mod gathering;

/// Handler contracts and capability traits.
pub mod handler;

/// Fanout publishers and subscribers.
pub mod pubsub;

/// Point-to-point queues.
pub mod queue;

mod retry;

/// Request/response.
pub mod rpc;

pub use broker::Broker;
pub use config::BrokerConfig;
pub use connection::{ConnectionEvent, ConnectionManager, ConnectionState, EventScope};
pub use envelope::{CodecError, Envelope, Status};
pub use error::{ConnectionError, Error, Result};
pub use gathering::{GatheringClient, GatheringServer};
pub use handler::{
    ActionRegistrar, CallOptions, Callable, ConsumerHandler, GatherOutcome, GatheringHandler,
    HandlerError, Initializable, Reply, Request, Response, RpcHandler,
};
pub use pubsub::{Publisher, Subscriber};
pub use queue::{QueueClient, QueueServer, SendOptions};
pub use rpc::{RpcClient, RpcServer};
