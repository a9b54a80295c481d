//! rrb - Redis request broker
//!
//! Request/response RPC and fan-out pub/sub over a shared Redis backend.
//! A [`Client`] enqueues a request on a named queue and exactly one
//! [`Worker`] listening on that queue executes it and publishes the
//! response; a [`Publisher`] fans a message out to every [`Subscriber`]
//! currently listening on a named channel.

pub mod client;
pub mod codec;
pub mod config;
mod connection;
pub mod error;
pub mod keys;
pub mod publisher;
pub mod subscriber;
pub mod worker;

// Re-export common types for library usage
pub use client::Client;
pub use codec::{ChannelEnvelope, CodecError, ErrorPayload, RequestEnvelope, ResponseBody,
    ResponseEnvelope, StructuredError};
pub use config::{apply, set_defaults, BrokerConfig, BrokerOptions, RedisConfig, RedisOptions};
pub use error::{BrokerError, Result};
pub use keys::KeyBuilder;
pub use publisher::Publisher;
pub use subscriber::{MessageHandler, Subscriber};
pub use worker::{RequestHandler, Worker, WorkerState};
