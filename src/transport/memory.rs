//! In-memory broker and connection implementation.
//!
//! This module provides a pure in-process implementation of the domain-level
//! `Connection` trait. It is intended primarily for testing, local execution,
//! and as a reference for connection semantics.
//!
//! ## Reference Semantics
//!
//! The in-memory broker defines the **reference behavior** for the
//! connection layer. It answers commands the way a Redis-style pub/sub
//! server does:
//!
//! - `subscribe` replies [`Reply::Subscribed`] with the number of topics the
//!   connection is subscribed to afterwards;
//! - `unsubscribe` replies [`Reply::Unsubscribed`] with the remaining count;
//! - `publish` delivers [`Reply::Message`] to every live connection
//!   subscribed to the topic, then replies [`Reply::Published`] with the
//!   number of receivers;
//! - a dropped link forgets the connection's subscriptions.
//!
//! Connections go live asynchronously: [`MemoryBroker::open`] returns at once
//! and `Connect` is emitted on a later scheduling turn. A broker created with
//! [`MemoryBroker::manual`] leaves that step to the test, see
//! [`MemoryConnection::establish`].
//!
//! ## Non-Goals
//!
//! This broker does not attempt to emulate persistence, pattern
//! subscriptions, or the failure timing of any specific server.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use bytes::Bytes;

use super::listeners::{lock_ignore_poison, EventFanout};
use crate::{
    // ---
    log_debug,
    log_info,
    ChannelError,
    Connection,
    ConnectionBase,
    ConnectionConfig,
    ConnectionEvent,
    ConnectionPtr,
    ConnectionRole,
    EventInbox,
    ListenerToken,
    Reply,
    Result,
};

/// Shared message hub simulating one broker server within the process.
///
/// All [`MemoryConnection`]s opened on the same broker can publish and
/// receive each other's messages, exactly as connections to a real server
/// would.
///
/// URIs of the form `memory://<name>` resolve to a process-global broker
/// registered under `<name>`; use distinct names to isolate parallel tests.
pub struct MemoryBroker {
    // ---
    name: String,
    auto_connect: bool,
    connections: Mutex<Vec<Weak<MemoryConnection>>>,
}

/// Process-global brokers addressed by `memory://<name>`.
static NAMED_BROKERS: OnceLock<Mutex<HashMap<String, Arc<MemoryBroker>>>> = OnceLock::new();

impl MemoryBroker {
    // ---
    /// Create a new, empty broker whose connections go live on their own.
    pub fn new() -> Arc<Self> {
        Self::build("anonymous", true)
    }

    /// Create a broker whose connections stay offline until
    /// [`MemoryConnection::establish`] is called.
    pub fn manual() -> Arc<Self> {
        Self::build("manual", false)
    }

    fn build(name: &str, auto_connect: bool) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            auto_connect,
            connections: Mutex::new(Vec::new()),
        })
    }

    /// Return the process-global broker registered under `name`, creating it
    /// on first use.
    pub fn named(name: &str) -> Arc<Self> {
        // ---
        let registry = NAMED_BROKERS.get_or_init(|| Mutex::new(HashMap::new()));
        let mut registry = lock_ignore_poison(registry);
        registry
            .entry(name.to_string())
            .or_insert_with(|| Self::build(name, true))
            .clone()
    }

    /// Return the broker a `memory://<name>` URI refers to.
    pub fn for_uri(uri: &str) -> Arc<Self> {
        // ---
        let name = uri.strip_prefix("memory://").unwrap_or(uri);
        let name = name.trim_end_matches('/');
        Self::named(name)
    }

    /// Open a connection on this broker.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::NoRuntime`] when called outside a Tokio
    /// runtime on an auto-connecting broker.
    pub fn open(self: &Arc<Self>, config: ConnectionConfig) -> Result<Arc<MemoryConnection>> {
        // ---
        let runtime = if self.auto_connect {
            Some(tokio::runtime::Handle::try_current().map_err(|_| ChannelError::NoRuntime)?)
        } else {
            None
        };

        log_debug!(
            "{}: open memory connection on broker '{}' as {}",
            config.connection_id,
            self.name,
            config.role
        );

        let connection = Arc::new(MemoryConnection {
            base: ConnectionBase::from(&config),
            broker: Arc::clone(self),
            fanout: EventFanout::new(),
            topics: Mutex::new(BTreeSet::new()),
            closed: AtomicBool::new(false),
        });

        {
            let mut connections = lock_ignore_poison(&self.connections);
            connections.retain(|weak| weak.strong_count() > 0);
            connections.push(Arc::downgrade(&connection));
        }

        if let Some(runtime) = runtime {
            let pending = Arc::clone(&connection);
            runtime.spawn(async move {
                tokio::task::yield_now().await;
                pending.establish();
            });
        }

        Ok(connection)
    }

    /// All connections opened on this broker that are still referenced.
    pub fn connections(&self) -> Vec<Arc<MemoryConnection>> {
        // ---
        lock_ignore_poison(&self.connections)
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }

    /// Deliver a payload to every live subscriber of `topic`.
    ///
    /// Returns the number of receiving connections.
    fn deliver(&self, origin: &str, topic: &str, payload: &Bytes) -> i64 {
        // ---
        let mut receivers = 0;

        for connection in self.connections() {
            if !connection.fanout.is_live() || !connection.is_subscribed_to(topic) {
                continue;
            }
            connection.fanout.emit(ConnectionEvent::Reply(Reply::Message {
                topic: topic.to_string(),
                payload: payload.clone(),
            }));
            receivers += 1;
        }

        log_debug!("{origin}: delivered message on '{topic}' to {receivers} connection(s)");
        receivers
    }
}

/// One simulated broker connection.
///
/// Besides the [`Connection`] trait, it exposes hooks that let tests drive
/// the connection lifecycle and inspect what a channel did to it.
pub struct MemoryConnection {
    // ---
    base: ConnectionBase,
    broker: Arc<MemoryBroker>,
    fanout: EventFanout,
    topics: Mutex<BTreeSet<String>>,
    closed: AtomicBool,
}

impl MemoryConnection {
    // ---
    /// Bring the connection live and emit `Connect`.
    ///
    /// No-op when it is already live or has ended.
    pub fn establish(&self) {
        // ---
        if self.fanout.is_ended() || self.fanout.is_live() {
            return;
        }
        log_debug!("{}: connected", self.connection_id());
        self.fanout.emit(ConnectionEvent::Connect);
    }

    /// Simulate a dropped link: subscriptions are forgotten and `Disconnect`
    /// is emitted.
    pub fn drop_link(&self) {
        // ---
        if !self.fanout.is_live() {
            return;
        }
        lock_ignore_poison(&self.topics).clear();
        log_debug!("{}: link dropped", self.connection_id());
        self.fanout.emit(ConnectionEvent::Disconnect);
    }

    /// Simulate a reconnect after [`drop_link`](Self::drop_link).
    pub fn restore_link(&self) {
        self.establish();
    }

    /// Simulate the server closing the connection.
    pub fn end(&self) {
        // ---
        lock_ignore_poison(&self.topics).clear();
        log_debug!("{}: ended by server", self.connection_id());
        self.fanout.emit(ConnectionEvent::End);
    }

    /// Emit an arbitrary event to all listeners, e.g. a forged reply.
    pub fn inject(&self, event: ConnectionEvent) {
        self.fanout.emit(event);
    }

    /// Whether `close()` was called on this connection.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of currently attached listeners.
    pub fn listener_count(&self) -> usize {
        self.fanout.len()
    }

    /// Topics this connection is currently subscribed to.
    pub fn subscriptions(&self) -> Vec<String> {
        lock_ignore_poison(&self.topics).iter().cloned().collect()
    }

    /// The broker this connection belongs to.
    pub fn broker(&self) -> Arc<MemoryBroker> {
        Arc::clone(&self.broker)
    }

    fn is_subscribed_to(&self, topic: &str) -> bool {
        lock_ignore_poison(&self.topics).contains(topic)
    }

    fn ensure_live(&self) -> Result<()> {
        // ---
        if self.fanout.is_live() {
            Ok(())
        } else {
            Err(ChannelError::NotConnected(self.connection_id().to_string()))
        }
    }
}

#[async_trait::async_trait]
impl Connection for MemoryConnection {
    // ---
    fn base(&self) -> &ConnectionBase {
        &self.base
    }

    fn attach(&self) -> (ListenerToken, EventInbox) {
        self.fanout.attach()
    }

    fn detach(&self, token: ListenerToken) {
        self.fanout.detach(token);
    }

    fn is_connected(&self) -> bool {
        self.fanout.is_live()
    }

    fn open_sibling(&self, role: ConnectionRole) -> Result<ConnectionPtr> {
        // ---
        let sibling: ConnectionPtr = self.broker.open(self.config().sibling(role))?;
        Ok(sibling)
    }

    async fn subscribe(&self, topic: &str) -> Result<()> {
        // ---
        self.ensure_live()?;

        let count = {
            let mut topics = lock_ignore_poison(&self.topics);
            topics.insert(topic.to_string());
            topics.len() as i64
        };

        self.fanout.emit(ConnectionEvent::Reply(Reply::Subscribed {
            topic: topic.to_string(),
            count,
        }));
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<()> {
        // ---
        self.ensure_live()?;

        let count = {
            let mut topics = lock_ignore_poison(&self.topics);
            topics.remove(topic);
            topics.len() as i64
        };

        self.fanout.emit(ConnectionEvent::Reply(Reply::Unsubscribed {
            topic: topic.to_string(),
            count,
        }));
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()> {
        // ---
        self.ensure_live()?;

        let receivers = self.broker.deliver(self.connection_id(), topic, &payload);
        self.fanout
            .emit(ConnectionEvent::Reply(Reply::Published { receivers }));
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        // ---
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        log_info!("{}: closing memory connection", self.connection_id());
        lock_ignore_poison(&self.topics).clear();
        self.fanout.emit(ConnectionEvent::End);
        Ok(())
    }
}

/// Open a memory connection on the broker named by `config.uri`.
pub fn create_memory_connection(config: ConnectionConfig) -> Result<ConnectionPtr> {
    // ---
    let connection: ConnectionPtr = MemoryBroker::for_uri(&config.uri).open(config)?;
    Ok(connection)
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    fn config(id: &str, role: ConnectionRole) -> ConnectionConfig {
        ConnectionConfig {
            uri: "memory://unit".into(),
            connection_id: id.into(),
            role,
            transport_type: None,
        }
    }

    #[tokio::test]
    async fn subscribe_ack_reports_per_connection_count() {
        // ---
        let broker = MemoryBroker::manual();
        let conn = broker.open(config("sub", ConnectionRole::Subscriber)).unwrap();
        let (_token, mut inbox) = conn.attach();

        assert!(conn.subscribe("a").await.is_err());

        conn.establish();
        conn.subscribe("a").await.unwrap();
        conn.subscribe("b").await.unwrap();

        assert_eq!(inbox.recv().await, Some(ConnectionEvent::Connect));
        assert_eq!(
            inbox.recv().await,
            Some(ConnectionEvent::Reply(Reply::Subscribed {
                topic: "a".into(),
                count: 1
            }))
        );
        assert_eq!(
            inbox.recv().await,
            Some(ConnectionEvent::Reply(Reply::Subscribed {
                topic: "b".into(),
                count: 2
            }))
        );
    }

    #[tokio::test]
    async fn publish_reaches_subscribers_and_reports_receivers() {
        // ---
        let broker = MemoryBroker::manual();
        let publisher = broker.open(config("pub", ConnectionRole::Publisher)).unwrap();
        let subscriber = broker.open(config("sub", ConnectionRole::Subscriber)).unwrap();
        publisher.establish();
        subscriber.establish();

        let (_p, mut pub_inbox) = publisher.attach();
        let (_s, mut sub_inbox) = subscriber.attach();
        subscriber.subscribe("news").await.unwrap();
        publisher
            .publish("news", Bytes::from_static(b"hello"))
            .await
            .unwrap();

        assert_eq!(pub_inbox.recv().await, Some(ConnectionEvent::Connect));
        assert_eq!(
            pub_inbox.recv().await,
            Some(ConnectionEvent::Reply(Reply::Published { receivers: 1 }))
        );

        assert_eq!(sub_inbox.recv().await, Some(ConnectionEvent::Connect));
        let _ack = sub_inbox.recv().await;
        assert_eq!(
            sub_inbox.recv().await,
            Some(ConnectionEvent::Reply(Reply::Message {
                topic: "news".into(),
                payload: Bytes::from_static(b"hello"),
            }))
        );
    }

    #[tokio::test]
    async fn auto_connect_happens_after_open_returns() {
        // ---
        let broker = MemoryBroker::new();
        let conn = broker.open(config("auto", ConnectionRole::Publisher)).unwrap();
        assert!(!conn.is_connected());

        let (_token, mut inbox) = conn.attach();
        assert_eq!(inbox.recv().await, Some(ConnectionEvent::Connect));
        assert!(conn.is_connected());
    }

    #[tokio::test]
    async fn drop_link_forgets_subscriptions() {
        // ---
        let broker = MemoryBroker::manual();
        let conn = broker.open(config("sub", ConnectionRole::Subscriber)).unwrap();
        conn.establish();
        conn.subscribe("t").await.unwrap();
        assert_eq!(conn.subscriptions(), vec!["t".to_string()]);

        conn.drop_link();
        assert!(conn.subscriptions().is_empty());
        assert!(!conn.is_connected());

        conn.restore_link();
        assert!(conn.is_connected());
    }

    #[tokio::test]
    async fn close_is_idempotent_and_ends_listeners() {
        // ---
        let broker = MemoryBroker::manual();
        let conn = broker.open(config("c", ConnectionRole::Publisher)).unwrap();
        let (_token, mut inbox) = conn.attach();

        conn.close().await.unwrap();
        conn.close().await.unwrap();

        assert!(conn.is_closed());
        assert_eq!(inbox.recv().await, Some(ConnectionEvent::End));
        assert_eq!(inbox.recv().await, None);
    }

    #[test]
    fn named_brokers_are_shared_by_uri() {
        // ---
        let a = MemoryBroker::for_uri("memory://shared-name");
        let b = MemoryBroker::named("shared-name");
        assert!(Arc::ptr_eq(&a, &b));
    }
}
