use thiserror::Error;

/// Errors surfaced by channels, connections and builders.
///
/// Errors raised while the coordinator is handling a connection event are
/// never returned from a call; they are delivered as
/// [`ChannelEvent::Error`](crate::ChannelEvent::Error) instead.
#[derive(Error, Debug)]
pub enum ChannelError {
    /// The broker answered with a reply the channel cannot accept
    /// (unexpected shape, duplicate or mismatched subscribe acknowledgment).
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The broker reported an error reply for a command.
    #[error("broker error reply: {0}")]
    Broker(String),

    /// An underlying connection reported an error.
    #[error("connection {connection} error: {reason}")]
    Connection { connection: String, reason: String },

    /// A structured-mode message could not be parsed.
    #[error("failed to decode message: {0}")]
    Decode(#[source] serde_json::Error),

    /// An outbound payload cannot be represented in the current mode.
    #[error("failed to encode message: {0}")]
    Encode(String),

    /// JSON serialization of a typed payload failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A command was issued on a connection that is not live.
    #[error("connection {0} is not connected")]
    NotConnected(String),

    /// Transport-level failure while issuing a command.
    #[error("transport error: {0}")]
    Transport(String),

    /// Required builder configuration is missing.
    #[error("missing required configuration: {0}")]
    MissingConfig(String),

    /// Builder configuration is contradictory.
    #[error("configuration conflict: {0}")]
    ConfigConflict(String),

    /// Channels and connections spawn tasks and need a Tokio runtime.
    #[error("no Tokio runtime available")]
    NoRuntime,

    /// The channel ended before the awaited condition was reached.
    #[error("channel ended")]
    Ended,
}

/// Result type alias for channel operations.
pub type Result<T> = std::result::Result<T, ChannelError>;
