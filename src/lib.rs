//! Topic-bound channels over publish/subscribe brokers
//!
//! This library binds one topic to a pair of broker connections, one that
//! publishes and one that subscribes, and exposes a single combined
//! lifecycle: `Connect` once the channel can both send and receive,
//! `Message` for every payload on the topic, `Error`, and a final `End`.
//! Payloads travel as structured JSON values or as raw scalars.
//!

// Import all sub modules once...
mod channel;
mod domain;
mod transport;

mod channel_builder;
mod codec;
mod connection_builder;

mod error;
mod macros;

#[allow(unused_imports)]
pub(crate) use macros::{log_debug, log_error, log_info, log_trace, log_warn};

// Re-export main types
pub use channel::{Channel, ChannelEvent, ChannelEvents, Ownership, Provisioned, ReadyState};
pub use channel_builder::ChannelBuilder;
pub use connection_builder::{open_connection, ConnectionBuilder};

pub use codec::{decode, encode, Payload};
pub use error::{ChannelError, Result};

pub use transport::{
    //
    create_memory_connection,
    create_redis_connection,
    MemoryBroker,
    MemoryConnection,
};

// --- public re-exports
pub use domain::{
    //
    Connection,
    ConnectionBase,
    ConnectionConfig,
    ConnectionEvent,
    ConnectionPtr,
    ConnectionRole,
    EventInbox,
    ListenerToken,
    Reply,
};

/// Create a channel on `topic` that owns two new connections to `uri`.
///
/// Shorthand for `ChannelBuilder::new(topic).endpoint(uri).build()`.
pub fn create_channel(uri: &str, topic: &str) -> Result<(Channel, ChannelEvents)> {
    // ---
    ChannelBuilder::new(topic).endpoint(uri).build()
}
