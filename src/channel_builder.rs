//! Channel builder.
//!
//! Resolves the three ways of handing connections to a channel and records,
//! for each connection, whether the channel owns it:
//!
//! | Supplied                         | Publish connection | Subscribe connection        |
//! |----------------------------------|--------------------|-----------------------------|
//! | `.endpoint(uri)`                 | created, owned     | created, owned              |
//! | `.connection(c)`                 | `c`, borrowed      | sibling of `c`, owned       |
//! | `.connections(p, s)`             | `p`, borrowed      | `s`, borrowed               |

use std::sync::Arc;

use crate::{
    // ---
    log_debug,
    log_warn,
    Channel,
    ChannelError,
    ChannelEvents,
    ConnectionBuilder,
    ConnectionPtr,
    ConnectionRole,
    Provisioned,
    Result,
};

/// Builder for creating channels.
///
/// # Examples
///
/// ## Channel owning both of its connections
/// ```no_run
/// use mom_channel::ChannelBuilder;
///
/// # async fn example() -> mom_channel::Result<()> {
/// let (channel, events) = ChannelBuilder::new("orders")
///     .endpoint("redis://127.0.0.1:6379")
///     .build()?;
/// # Ok(())
/// # }
/// ```
///
/// ## Two channels sharing one publish connection
/// ```no_run
/// use mom_channel::{ChannelBuilder, ConnectionBuilder};
///
/// # async fn example() -> mom_channel::Result<()> {
/// let publisher = ConnectionBuilder::new()
///     .uri("memory://shared")
///     .publisher()
///     .build()?;
///
/// let (orders, _orders_events) = ChannelBuilder::new("orders")
///     .connection(publisher.clone())
///     .build()?;
/// let (audit, _audit_events) = ChannelBuilder::new("audit")
///     .connection(publisher)
///     .raw_mode(true)
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct ChannelBuilder {
    // ---
    topic: Arc<str>,
    endpoint: Option<String>,
    transport_type: Option<String>,
    publisher: Option<ConnectionPtr>,
    subscriber: Option<ConnectionPtr>,
    raw_mode: bool,
}

impl ChannelBuilder {
    /// Create a builder for a channel bound to `topic`.
    pub fn new(topic: impl Into<Arc<str>>) -> Self {
        // ---
        Self {
            topic: topic.into(),
            endpoint: None,
            transport_type: None,
            publisher: None,
            subscriber: None,
            raw_mode: false,
        }
    }

    /// Create both connections from this endpoint URI; the channel owns them.
    pub fn endpoint(mut self, uri: impl Into<String>) -> Self {
        self.endpoint = Some(uri.into());
        self
    }

    /// Backend override passed on to [`ConnectionBuilder::transport_type`]
    /// for connections the channel creates from an endpoint.
    pub fn transport_type(mut self, flag: impl Into<String>) -> Self {
        self.transport_type = Some(flag.into());
        self
    }

    /// Publish through an existing connection (borrowed). The subscribe
    /// connection is opened to the same endpoint and owned by the channel.
    pub fn connection(mut self, publisher: ConnectionPtr) -> Self {
        self.publisher = Some(publisher);
        self.subscriber = None;
        self
    }

    /// Use two existing connections (both borrowed).
    ///
    /// The subscribe connection must be dedicated to this channel: its
    /// subscription count has to stay at one.
    pub fn connections(mut self, publisher: ConnectionPtr, subscriber: ConnectionPtr) -> Self {
        self.publisher = Some(publisher);
        self.subscriber = Some(subscriber);
        self
    }

    /// Start in raw mode instead of structured mode.
    ///
    /// Default: `false`.
    pub fn raw_mode(mut self, raw: bool) -> Self {
        self.raw_mode = raw;
        self
    }

    /// Resolve the publish and subscribe connections and their ownership.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - the topic is empty
    /// - neither an endpoint nor a connection was supplied
    /// - both an endpoint and connections were supplied
    /// - a supplied connection was opened for the other role
    /// - opening a connection fails
    pub fn provision(&self) -> Result<(Provisioned, Provisioned)> {
        // ---
        if self.topic.is_empty() {
            return Err(ChannelError::MissingConfig("topic".into()));
        }
        tokio::runtime::Handle::try_current().map_err(|_| ChannelError::NoRuntime)?;

        match (&self.endpoint, &self.publisher, &self.subscriber) {
            (Some(_), Some(_), _) | (Some(_), _, Some(_)) => Err(ChannelError::ConfigConflict(
                "use either an endpoint or existing connections, not both".into(),
            )),
            (None, None, _) => Err(ChannelError::MissingConfig(
                "endpoint or publish connection".into(),
            )),
            (Some(uri), None, None) => {
                // ---
                let publisher = self.open(uri, ConnectionRole::Publisher)?;
                let subscriber = match self.open(uri, ConnectionRole::Subscriber) {
                    Ok(subscriber) => subscriber,
                    Err(err) => {
                        discard(publisher);
                        return Err(err);
                    }
                };
                Ok((Provisioned::owned(publisher), Provisioned::owned(subscriber)))
            }
            (None, Some(publisher), None) => {
                // ---
                expect_role(publisher, ConnectionRole::Publisher)?;
                let subscriber = publisher.open_sibling(ConnectionRole::Subscriber)?;
                log_debug!(
                    "{}: opened {} next to borrowed {}",
                    self.topic,
                    subscriber.connection_id(),
                    publisher.connection_id()
                );
                Ok((
                    Provisioned::borrowed(Arc::clone(publisher)),
                    Provisioned::owned(subscriber),
                ))
            }
            (None, Some(publisher), Some(subscriber)) => {
                // ---
                expect_role(publisher, ConnectionRole::Publisher)?;
                expect_role(subscriber, ConnectionRole::Subscriber)?;
                Ok((
                    Provisioned::borrowed(Arc::clone(publisher)),
                    Provisioned::borrowed(Arc::clone(subscriber)),
                ))
            }
        }
    }

    /// Build the channel (consumes self).
    ///
    /// Returns as soon as the connections are provisioned; readiness is
    /// reported later through [`ChannelEvents`].
    pub fn build(self) -> Result<(Channel, ChannelEvents)> {
        // ---
        let (publisher, subscriber) = self.provision()?;
        Channel::start(self.topic, publisher, subscriber, self.raw_mode)
    }

    fn open(&self, uri: &str, role: ConnectionRole) -> Result<ConnectionPtr> {
        // ---
        let mut builder = ConnectionBuilder::new()
            .uri(uri)
            .connection_id(format!("{}-{role}-{}", self.topic, crate::domain::short_id()))
            .role(role);
        if let Some(flag) = &self.transport_type {
            builder = builder.transport_type(flag.clone());
        }
        builder.build()
    }
}

fn expect_role(connection: &ConnectionPtr, role: ConnectionRole) -> Result<()> {
    // ---
    if connection.role() == role {
        return Ok(());
    }
    Err(ChannelError::ConfigConflict(format!(
        "{} was opened as {}, expected {role}",
        connection.connection_id(),
        connection.role()
    )))
}

// Close a connection opened for a channel that failed to build.
fn discard(connection: ConnectionPtr) {
    tokio::spawn(async move {
        if let Err(_err) = connection.close().await {
            log_warn!("{}: close after failed build: {_err}", connection.connection_id());
        }
    });
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::{MemoryBroker, Ownership};

    #[tokio::test]
    async fn endpoint_only_owns_both_connections() {
        // ---
        let (publisher, subscriber) = ChannelBuilder::new("t")
            .endpoint("memory://provision-endpoint")
            .provision()
            .unwrap();

        assert_eq!(publisher.ownership, Ownership::Owned);
        assert_eq!(subscriber.ownership, Ownership::Owned);
        assert_eq!(publisher.role(), ConnectionRole::Publisher);
        assert_eq!(subscriber.role(), ConnectionRole::Subscriber);
    }

    #[tokio::test]
    async fn single_connection_is_borrowed_and_sibling_is_owned() {
        // ---
        let broker = MemoryBroker::named("provision-single");
        let existing: ConnectionPtr = broker
            .open(crate::ConnectionConfig {
                uri: "memory://provision-single".into(),
                connection_id: "caller-pub".into(),
                role: ConnectionRole::Publisher,
                transport_type: None,
            })
            .unwrap();

        let (publisher, subscriber) = ChannelBuilder::new("t")
            .connection(existing.clone())
            .provision()
            .unwrap();

        assert!(Arc::ptr_eq(&publisher.connection, &existing));
        assert_eq!(publisher.ownership, Ownership::Borrowed);
        assert_eq!(subscriber.ownership, Ownership::Owned);
        assert_eq!(subscriber.connection.config().uri, "memory://provision-single");
        assert_eq!(broker.connections().len(), 2);
    }

    #[tokio::test]
    async fn endpoint_and_connection_conflict() {
        // ---
        let existing = ConnectionBuilder::new()
            .uri("memory://provision-conflict")
            .publisher()
            .build()
            .unwrap();

        let err = ChannelBuilder::new("t")
            .endpoint("memory://provision-conflict")
            .connection(existing)
            .provision()
            .unwrap_err();
        assert!(matches!(err, ChannelError::ConfigConflict(_)));
    }

    #[tokio::test]
    async fn supplied_connections_must_match_their_roles() {
        // ---
        let broker = MemoryBroker::new();
        let open = |id: &str, role: ConnectionRole| -> ConnectionPtr {
            let connection: ConnectionPtr = broker
                .open(crate::ConnectionConfig {
                    uri: "memory://provision-roles".into(),
                    connection_id: id.into(),
                    role,
                    transport_type: None,
                })
                .unwrap();
            connection
        };
        let publisher = open("roles-pub", ConnectionRole::Publisher);
        let subscriber = open("roles-sub", ConnectionRole::Subscriber);

        let err = ChannelBuilder::new("t")
            .connections(subscriber.clone(), publisher.clone())
            .provision()
            .unwrap_err();
        assert!(matches!(err, ChannelError::ConfigConflict(_)));

        let err = ChannelBuilder::new("t")
            .connection(subscriber.clone())
            .provision()
            .unwrap_err();
        assert!(matches!(err, ChannelError::ConfigConflict(_)));
        assert_eq!(broker.connections().len(), 2, "no sibling was opened");
    }

    #[tokio::test]
    async fn nothing_supplied_is_missing_config() {
        // ---
        let err = ChannelBuilder::new("t").provision().unwrap_err();
        assert!(matches!(err, ChannelError::MissingConfig(_)));

        let err = ChannelBuilder::new("")
            .endpoint("memory://x")
            .provision()
            .unwrap_err();
        assert!(matches!(err, ChannelError::MissingConfig(field) if field == "topic"));
    }

    #[test]
    fn building_outside_a_runtime_fails_cleanly() {
        // ---
        let err = ChannelBuilder::new("t")
            .endpoint("memory://provision-no-runtime")
            .provision()
            .unwrap_err();
        assert!(matches!(err, ChannelError::NoRuntime));
    }
}
