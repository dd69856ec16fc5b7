//! Redstream - Redis Streams transport
//!
//! A messaging transport for microservices built on an append-only log with
//! consumer groups. Offers two delivery patterns:
//! - fire-and-forget events (`StreamsClient::emit`)
//! - correlated request/response (`StreamsClient::send`)
//!
//! Requests are consumed by a `StreamsServer`, dispatched to handlers supplied
//! through a `HandlerRegistry`, and answered on the requester's private reply
//! stream.

pub mod client;
pub mod config;
mod connection;
pub mod error;
pub mod naming;
pub mod packet;
pub mod pattern;
pub mod server;
pub mod status;
pub mod store;
pub mod utils;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use client::{ReplyStream, StreamsClient};
pub use config::{ResolvedOptions, StreamsOptions};
pub use error::{HandlerError, Result, TransportError};
pub use pattern::Pattern;
pub use server::handlers::{
    event_fn, request_fn, EventHandler, HandlerMap, HandlerRegistry, RequestHandler,
    StreamsContext,
};
pub use server::StreamsServer;
pub use status::{ConnectionEvent, ConnectionEventKind};
