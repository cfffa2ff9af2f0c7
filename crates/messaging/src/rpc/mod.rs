//! Request/response over a named queue.
//!
//! The client publishes requests to the queue named after the RPC, tagged
//! with a correlation id and its private reply queue. The server consumes
//! the queue, runs the handler registered for the request's action under a
//! deadline and publishes exactly one reply per request.

mod client;
mod server;

pub use client::RpcClient;
pub use server::RpcServer;
