//! Connection builder for creating connection instances.
//!
//! Provides a fluent builder API for constructing connections with clear
//! separation between required and optional configuration.

use crate::domain::short_id;
use crate::{ChannelError, ConnectionConfig, ConnectionPtr, ConnectionRole, Result};

/// Builder for creating connection instances.
///
/// Building is synchronous: connections go live in the background and
/// announce it with [`ConnectionEvent::Connect`](crate::ConnectionEvent::Connect).
/// A Tokio runtime must be running.
///
/// # Examples
///
/// ## Publisher on the in-memory broker
/// ```no_run
/// use mom_channel::ConnectionBuilder;
///
/// # async fn example() -> mom_channel::Result<()> {
/// let publisher = ConnectionBuilder::new()
///     .uri("memory://local")
///     .connection_id("orders-pub")
///     .publisher()
///     .build()?;
/// # Ok(())
/// # }
/// ```
///
/// ## Subscriber on a Redis server
/// ```no_run
/// use mom_channel::ConnectionBuilder;
///
/// # async fn example() -> mom_channel::Result<()> {
/// let subscriber = ConnectionBuilder::new()
///     .uri("redis://127.0.0.1:6379")
///     .subscriber()
///     .build()?;
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct ConnectionBuilder {
    uri: Option<String>,
    connection_id: Option<String>,
    transport_type: Option<String>,

    // Track which role methods were called (conflicts detected at build())
    called_publisher: bool,
    called_subscriber: bool,
}

impl ConnectionBuilder {
    /// Create a new connection builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the endpoint URI (required).
    ///
    /// Examples:
    /// - `"memory://tests"` (process-global in-memory broker `tests`)
    /// - `"redis://127.0.0.1:6379"`
    /// - `"redis://:secret@cache.internal:6379/0"`
    pub fn uri(mut self, uri: impl Into<String>) -> Self {
        self.uri = Some(uri.into());
        self
    }

    /// Set the connection ID used in logs and errors.
    ///
    /// If not specified, a random one is generated.
    pub fn connection_id(mut self, id: impl Into<String>) -> Self {
        self.connection_id = Some(id.into());
        self
    }

    /// Open the connection for publishing.
    pub fn publisher(mut self) -> Self {
        self.called_publisher = true;
        self
    }

    /// Open the connection for subscribing.
    pub fn subscriber(mut self) -> Self {
        self.called_subscriber = true;
        self
    }

    /// Set the role explicitly; same as calling
    /// [`publisher`](Self::publisher) or [`subscriber`](Self::subscriber).
    pub fn role(self, role: ConnectionRole) -> Self {
        match role {
            ConnectionRole::Publisher => self.publisher(),
            ConnectionRole::Subscriber => self.subscriber(),
        }
    }

    /// Set explicit backend type.
    ///
    /// Valid values: `"memory"`, `"redis"`
    ///
    /// If not specified, the URI scheme decides.
    pub fn transport_type(mut self, flag: impl Into<String>) -> Self {
        self.transport_type = Some(flag.into());
        self
    }

    /// Build the connection (consumes self).
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - `uri` is missing
    /// - no role, or both roles, were requested
    /// - the backend is unknown or its feature is disabled
    /// - no Tokio runtime is running
    pub fn build(self) -> Result<ConnectionPtr> {
        // ---
        let uri = self
            .uri
            .ok_or_else(|| ChannelError::MissingConfig("uri".into()))?;

        let role = match (self.called_publisher, self.called_subscriber) {
            (true, false) => ConnectionRole::Publisher,
            (false, true) => ConnectionRole::Subscriber,
            (true, true) => {
                return Err(ChannelError::ConfigConflict(
                    "a connection is either a publisher or a subscriber, not both".into(),
                ))
            }
            (false, false) => {
                return Err(ChannelError::MissingConfig(
                    "role (publisher or subscriber)".into(),
                ))
            }
        };

        let connection_id = self
            .connection_id
            .unwrap_or_else(|| format!("{role}-{}", short_id()));

        let config = ConnectionConfig {
            uri,
            connection_id,
            role,
            transport_type: self.transport_type,
        };

        open_connection(config)
    }
}

/// Open a connection for an already assembled configuration.
///
/// When `transport_type` is set it is used directly; otherwise the URI scheme
/// selects the backend. Disabled backends return `Err` through their stubs.
pub fn open_connection(config: ConnectionConfig) -> Result<ConnectionPtr> {
    // ---
    let backend = match config.transport_type.as_deref() {
        Some(flag) => flag.to_string(),
        None => scheme_of(&config.uri).to_string(),
    };

    match backend.as_str() {
        "memory" => crate::create_memory_connection(config),
        "redis" | "rediss" => crate::create_redis_connection(config),
        other => Err(ChannelError::Transport(format!(
            "unrecognized transport type '{other}' for {}, valid values: memory, redis",
            config.uri
        ))),
    }
}

fn scheme_of(uri: &str) -> &str {
    uri.split_once("://").map(|(scheme, _)| scheme).unwrap_or("")
}
