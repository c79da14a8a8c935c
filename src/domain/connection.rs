// src/domain/connection.rs

//! Connection domain abstractions.
//!
//! This module defines the domain-level interface to a single broker
//! connection. It intentionally avoids any reference to concrete protocols,
//! brokers, or client libraries: a connection is an object that accepts
//! commands and emits lifecycle events, nothing more.
//!
//! Replies arrive already classified as [`Reply`] values. Parsing the wire
//! format into those values is the job of each concrete implementation under
//! `src/transport/`; the channel coordinator only validates them.
//!
//! Listener registration is explicit: [`Connection::attach`] hands out a
//! [`ListenerToken`] together with an event inbox, and [`Connection::detach`]
//! removes exactly that registration. Several channels may therefore share one
//! connection without ever removing each other's listeners.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::Result;

/// Which half of a channel a connection serves.
///
/// Brokers in the Redis family put a connection into a dedicated mode once
/// it subscribes, so a channel always uses one connection per role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionRole {
    /// Issues `publish` commands only.
    Publisher,
    /// Issues `subscribe`/`unsubscribe` commands and receives messages.
    Subscriber,
}

impl fmt::Display for ConnectionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionRole::Publisher => f.write_str("publisher"),
            ConnectionRole::Subscriber => f.write_str("subscriber"),
        }
    }
}

/// Configuration for creating a connection instance.
///
/// Built by [`ConnectionBuilder`](crate::ConnectionBuilder) and kept by every
/// connection so that a sibling connection to the same endpoint can be
/// opened later (see [`Connection::open_sibling`]).
#[derive(Clone, Debug)]
pub struct ConnectionConfig {
    /// Endpoint URI (e.g. `"redis://127.0.0.1:6379"`, `"memory://tests"`).
    ///
    /// Credentials, when the backend supports them, travel inside the URI.
    pub uri: String,
    /// Identifier used in logs and errors.
    pub connection_id: String,
    /// Role of the connection.
    pub role: ConnectionRole,
    /// Optional backend override (`"memory"`, `"redis"`).
    /// If `None`, the URI scheme decides.
    pub transport_type: Option<String>,
}

impl ConnectionConfig {
    /// Same endpoint, different role, fresh identifier.
    pub fn sibling(&self, role: ConnectionRole) -> Self {
        // ---
        Self {
            uri: self.uri.clone(),
            connection_id: format!("{}-{}-{}", self.connection_id, role, short_id()),
            role,
            transport_type: self.transport_type.clone(),
        }
    }
}

/// Short random suffix for generated connection identifiers.
pub(crate) fn short_id() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(8);
    id
}

/// Shared base state for all connection implementations.
///
/// Each concrete connection embeds this as a field named `base` and returns
/// it from [`Connection::base`], so the identity accessors can be provided
/// once as default trait methods.
#[derive(Debug, Clone)]
pub struct ConnectionBase {
    /// The configuration the connection was opened with.
    pub config: ConnectionConfig,
}

impl From<&ConnectionConfig> for ConnectionBase {
    fn from(config: &ConnectionConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }
}

/// Opaque handle to one listener registration on a connection.
///
/// Returned by [`Connection::attach`], consumed by [`Connection::detach`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerToken(pub(crate) u64);

/// A broker reply, already classified by the connection implementation.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Subscription confirmed. `count` is the number of topics the connection
    /// is subscribed to after this command.
    Subscribed { topic: String, count: i64 },
    /// Unsubscription confirmed, with the remaining subscription count.
    Unsubscribed { topic: String, count: i64 },
    /// A message published to a topic this connection subscribes to.
    Message { topic: String, payload: Bytes },
    /// A publish command completed; `receivers` is the number of connections
    /// the broker delivered it to.
    Published { receivers: i64 },
    /// The broker rejected a command.
    Error(String),
    /// Anything the implementation could not classify, described as text.
    Unexpected(String),
}

/// Lifecycle and data events emitted by a connection.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// The connection became live (first connect or after a reconnect).
    Connect,
    /// The link dropped; the implementation may reconnect and emit
    /// `Connect` again. Broker-side subscriptions are lost.
    Disconnect,
    /// A reply from the broker.
    Reply(Reply),
    /// A connection-level failure. Does not by itself end the connection.
    Error(String),
    /// The connection is closed for good. No further events follow.
    End,
}

/// Inbox receiving the events of one listener registration.
pub type EventInbox = mpsc::UnboundedReceiver<ConnectionEvent>;

/// Connection abstraction.
///
/// A `Connection` is a bidirectional, event-driven handle to one broker
/// connection. Commands are issued through the async methods; their outcome,
/// and everything else the broker sends, arrives as [`ConnectionEvent`]s on
/// every attached listener.
///
/// Implementations must ensure that:
/// - `attach()` on a connection that is currently live queues
///   [`ConnectionEvent::Connect`] as the first event of the new inbox, so a
///   late listener learns the state without racing the original event;
/// - `detach()` removes only the given registration and is a no-op for
///   unknown or already removed tokens;
/// - after [`ConnectionEvent::End`] no further events are emitted;
/// - `close()` is idempotent.
///
/// # Notes
///
/// This trait uses `async_trait`; the expanded documentation may show explicit
/// lifetimes and a boxed `Future`. Consumers should treat methods as normal
/// `async fn`s.
#[async_trait::async_trait]
pub trait Connection: Send + Sync {
    // ---
    /// Returns a reference to the shared base state.
    fn base(&self) -> &ConnectionBase;

    /// Returns the identifier of the connection.
    fn connection_id(&self) -> &str {
        &self.base().config.connection_id
    }

    /// Returns the role the connection was opened for.
    fn role(&self) -> ConnectionRole {
        self.base().config.role
    }

    /// Returns the configuration the connection was opened with.
    fn config(&self) -> &ConnectionConfig {
        &self.base().config
    }

    /// Register a listener and return its token and event inbox.
    fn attach(&self) -> (ListenerToken, EventInbox);

    /// Remove the listener registered under `token`.
    fn detach(&self, token: ListenerToken);

    /// Whether the connection is currently live.
    fn is_connected(&self) -> bool;

    /// Open a new, independent connection to the same endpoint with the same
    /// parameters, for the given role.
    fn open_sibling(&self, role: ConnectionRole) -> Result<ConnectionPtr>;

    /// Issue a subscribe command. The confirmation arrives as
    /// [`Reply::Subscribed`].
    async fn subscribe(&self, topic: &str) -> Result<()>;

    /// Issue an unsubscribe command. The confirmation arrives as
    /// [`Reply::Unsubscribed`].
    async fn unsubscribe(&self, topic: &str) -> Result<()>;

    /// Issue a publish command. The outcome arrives as
    /// [`Reply::Published`] or [`Reply::Error`].
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()>;

    /// Close the connection and release its resources.
    async fn close(&self) -> Result<()>;
}

/// Shared connection pointer.
///
/// `.clone()` only increments a reference count; all clones drive the same
/// underlying connection.
pub type ConnectionPtr = Arc<dyn Connection>;
