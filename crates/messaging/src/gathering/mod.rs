//! Scatter/gather over a fanout exchange.
//!
//! A gathering client broadcasts one request to every server bound to the
//! exchange named after the gathering. Each server answers on the client's
//! reply queue with either a `status` message (nothing here, or an error) or
//! a `reply` carrying the answer. The first reply wins; when every responder
//! counted at send time has reported a status, the request settles as not
//! found.
//!
//! Responders are counted through the consumers of the shared status queue
//! `<name>.status`, which every server consumes without ever receiving on it.

mod client;
mod server;

pub use client::GatheringClient;
pub use server::GatheringServer;

/// Name of the status queue servers of gathering `name` consume.
#[must_use]
pub fn status_queue(name: &str) -> String {
    format!("{name}.status")
}
