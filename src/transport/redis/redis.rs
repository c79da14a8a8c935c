//! Redis Pub/Sub connection implementation using `redis`.
//!
//! This module provides an implementation of the `Connection` trait backed by
//! one Redis connection. It follows an **actor-based concurrency model**.
//!
//! ## Concurrency model
//!
//! - A single background **actor task** owns the Redis handle.
//! - The actor is responsible for:
//!   - establishing the connection (lazily, so creation is synchronous),
//!   - publishing outbound messages on a publisher connection,
//!   - registering and dropping subscriptions on a subscriber connection,
//!   - polling the Pub/Sub stream for incoming data messages,
//!   - clean shutdown.
//! - All interaction with the Redis client is serialized through this actor;
//!   no other task ever touches the connection directly.
//!
//! ## One role per connection
//!
//! A Redis connection in Pub/Sub mode cannot issue regular commands such as
//! `PUBLISH`, so each `RedisConnection` is opened for one role:
//!
//! - publisher: `MultiplexedConnection`, used only for `PUBLISH`
//! - subscriber: `aio::PubSub` split into `PubSubSink` (commands) and
//!   `PubSubStream` (incoming messages)
//!
//! ## Acknowledgments
//!
//! `PubSubSink::subscribe()` resolves only after the server confirmed the
//! subscription and does not surface the server's subscription count. The
//! actor keeps the set of topics it subscribed to and synthesizes
//! [`Reply::Subscribed`] / [`Reply::Unsubscribed`] with that count, which is
//! exactly what the server reports for a connection used by one client.
//!
//! ## Failure handling
//!
//! There is no reconnect. A failed connect, a dropped link, or an ended
//! Pub/Sub stream emits `Error` (where there is one to report) followed by
//! `End`, after which the actor stops.
//!
//! A publisher link carries no traffic between publishes, so the actor sends
//! a `PING` every [`KEEPALIVE`]. A ping that fails at the I/O level or gets
//! no answer within the same interval counts as a lost link.
//!
//! Commands are read while the connect is still in progress: `close()`
//! never waits for a slow or unreachable server.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use redis::aio::{MultiplexedConnection, PubSubSink, PubSubStream};
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;

use crate::transport::listeners::EventFanout;
use crate::{
    //
    log_debug,
    log_error,
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

/// Interval between publisher link checks.
const KEEPALIVE: Duration = Duration::from_secs(15);

//
// Actor commands
//

enum Cmd {
    //
    Publish {
        topic: String,
        payload: Bytes,
        resp: oneshot::Sender<Result<()>>,
    },
    Subscribe {
        topic: String,
        resp: oneshot::Sender<Result<()>>,
    },
    Unsubscribe {
        topic: String,
        resp: oneshot::Sender<Result<()>>,
    },
    Close {
        resp: oneshot::Sender<Result<()>>,
    },
}

enum ActorStep {
    //
    Continue,
    Stop,
}

impl Cmd {
    // ---

    /// Dispatches an actor command to the correct handler on the actor.
    async fn handle(self, actor: &mut RedisActor, link: &mut Link) -> ActorStep {
        // ---
        match self {
            Cmd::Publish {
                topic,
                payload,
                resp,
            } => {
                let (result, step) = actor.handle_publish(link, topic, payload).await;
                let _ = resp.send(result);
                step
            }
            Cmd::Subscribe { topic, resp } => {
                let _ = resp.send(actor.handle_subscribe(link, topic).await);
                ActorStep::Continue
            }
            Cmd::Unsubscribe { topic, resp } => {
                let _ = resp.send(actor.handle_unsubscribe(link, topic).await);
                ActorStep::Continue
            }
            Cmd::Close { resp } => {
                log_debug!("{}: disconnecting redis client", actor.connection_id);
                let _ = resp.send(Ok(()));
                ActorStep::Stop
            }
        }
    }

    /// Answers a command that arrived before the link was up.
    fn reject(self, connection_id: &str) {
        // ---
        let not_connected = || Err(ChannelError::NotConnected(connection_id.to_string()));
        let _ = match self {
            Cmd::Publish { resp, .. } => resp.send(not_connected()),
            Cmd::Subscribe { resp, .. } => resp.send(not_connected()),
            Cmd::Unsubscribe { resp, .. } => resp.send(not_connected()),
            Cmd::Close { resp } => resp.send(Ok(())),
        };
    }
}

/// Outcome of one publisher link check.
#[derive(Debug, PartialEq, Eq)]
enum LinkHealth {
    Alive,
    Lost(String),
}

impl LinkHealth {
    /// Classify a `PING` outcome; `None` means no answer in time.
    fn of(outcome: Option<redis::RedisResult<String>>) -> Self {
        // ---
        match outcome {
            None => LinkHealth::Lost("no answer to PING".to_string()),
            Some(Err(err)) if is_fatal(&err) => LinkHealth::Lost(err.to_string()),
            // The server answered, even if with an error reply.
            Some(_) => LinkHealth::Alive,
        }
    }
}

/// The live Redis handle, by role.
enum Link {
    Publisher(MultiplexedConnection),
    Subscriber {
        sink: PubSubSink,
        stream: PubSubStream,
        topics: BTreeSet<String>,
    },
}

/// Redis implementation of the `Connection` trait.
pub struct RedisConnection {
    // ---
    base: ConnectionBase,
    cmd_tx: mpsc::Sender<Cmd>,
    fanout: Arc<EventFanout>,
}

impl RedisConnection {
    // ---

    /// Send a command to the actor and wait for its answer.
    ///
    /// A stopped actor means the connection has ended.
    async fn request(&self, make: impl FnOnce(oneshot::Sender<Result<()>>) -> Cmd) -> Result<()> {
        // ---
        let (tx, rx) = oneshot::channel();

        self.cmd_tx
            .send(make(tx))
            .await
            .map_err(|_| ChannelError::NotConnected(self.connection_id().to_string()))?;

        rx.await
            .map_err(|_| ChannelError::NotConnected(self.connection_id().to_string()))?
    }
}

struct RedisActor {
    // ---
    connection_id: String, // for logs and errors
    role: ConnectionRole,
    client: redis::Client,
    cmd_rx: mpsc::Receiver<Cmd>,
    fanout: Arc<EventFanout>,
}

impl RedisActor {
    // ---

    async fn run(mut self) {
        // ---
        let mut link = {
            let connecting = connect(&self.client, self.role, &self.connection_id);
            tokio::pin!(connecting);

            loop {
                tokio::select! {
                    connected = &mut connecting => match connected {
                        Ok(link) => break link,
                        Err(msg) => {
                            log_error!("{msg}");
                            self.fanout.emit(ConnectionEvent::Error(msg));
                            self.fanout.emit(ConnectionEvent::End);
                            return;
                        }
                    },

                    cmd = self.cmd_rx.recv() => match cmd {
                        Some(Cmd::Close { resp }) => {
                            log_debug!("{}: closed while connecting", self.connection_id);
                            let _ = resp.send(Ok(()));
                            self.fanout.emit(ConnectionEvent::End);
                            return;
                        }
                        Some(cmd) => cmd.reject(&self.connection_id),
                        None => {
                            self.fanout.emit(ConnectionEvent::End);
                            return;
                        }
                    },
                }
            }
        };

        log_info!("{}: connected as {}", self.connection_id, self.role);
        self.fanout.emit(ConnectionEvent::Connect);

        let is_publisher = matches!(link, Link::Publisher(_));
        let mut keepalive = tokio::time::interval(KEEPALIVE);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
        keepalive.reset();

        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(cmd) => {
                            if matches!(cmd.handle(&mut self, &mut link).await, ActorStep::Stop) {
                                break;
                            }
                        }
                        None => break,
                    }
                }

                maybe_msg = next_message(&mut link) => {
                    match maybe_msg {
                        Some(msg) => self.handle_incoming(msg),
                        None => {
                            log_error!("{}: pubsub stream ended", self.connection_id);
                            break;
                        }
                    }
                }

                _ = keepalive.tick(), if is_publisher => {
                    if let LinkHealth::Lost(reason) = ping(&mut link).await {
                        let msg = format!("{}: publisher link lost: {reason}", self.connection_id);
                        log_error!("{msg}");
                        self.fanout.emit(ConnectionEvent::Error(msg));
                        break;
                    }
                }
            }
        }

        self.fanout.emit(ConnectionEvent::End);
    }

    /// Issues a Redis PUBLISH on the publisher connection.
    ///
    /// A server error reply becomes [`Reply::Error`]; a dropped link stops
    /// the actor.
    async fn handle_publish(
        &mut self,
        link: &mut Link,
        topic: String,
        payload: Bytes,
    ) -> (Result<()>, ActorStep) {
        // ---
        let Link::Publisher(conn) = link else {
            let msg = format!("{}: a subscriber connection cannot publish", self.connection_id);
            return (Err(ChannelError::Transport(msg)), ActorStep::Continue);
        };

        let result = redis::cmd("PUBLISH")
            .arg(&topic)
            .arg(payload.as_ref())
            .query_async::<i64>(conn)
            .await;

        match result {
            Ok(receivers) => {
                self.fanout
                    .emit(ConnectionEvent::Reply(Reply::Published { receivers }));
                (Ok(()), ActorStep::Continue)
            }
            Err(err) if is_fatal(&err) => {
                let msg = format!(
                    "{}: publish failed for topic {topic}: {err}",
                    self.connection_id
                );
                log_error!("{msg}");
                self.fanout.emit(ConnectionEvent::Error(msg.clone()));
                (Err(ChannelError::Transport(msg)), ActorStep::Stop)
            }
            Err(err) => {
                self.fanout
                    .emit(ConnectionEvent::Reply(Reply::Error(err.to_string())));
                (Ok(()), ActorStep::Continue)
            }
        }
    }

    /// Registers a subscription and acknowledges it once the server confirmed.
    async fn handle_subscribe(&mut self, link: &mut Link, topic: String) -> Result<()> {
        // ---
        let Link::Subscriber { sink, topics, .. } = link else {
            let msg = format!("{}: a publisher connection cannot subscribe", self.connection_id);
            return Err(ChannelError::Transport(msg));
        };

        if let Err(err) = sink.subscribe(&topic).await {
            let msg = format!(
                "{}: failed to subscribe to topic {topic}: {err}",
                self.connection_id
            );
            log_error!("{msg}");
            return Err(ChannelError::Transport(msg));
        }

        topics.insert(topic.clone());
        let count = topics.len() as i64;
        log_info!("{}: subscribed to topic {topic}", self.connection_id);

        self.fanout
            .emit(ConnectionEvent::Reply(Reply::Subscribed { topic, count }));
        Ok(())
    }

    async fn handle_unsubscribe(&mut self, link: &mut Link, topic: String) -> Result<()> {
        // ---
        let Link::Subscriber { sink, topics, .. } = link else {
            let msg = format!("{}: a publisher connection cannot unsubscribe", self.connection_id);
            return Err(ChannelError::Transport(msg));
        };

        sink.unsubscribe(&topic).await.map_err(|err| {
            let msg = format!(
                "{}: failed to unsubscribe from topic {topic}: {err}",
                self.connection_id
            );
            log_error!("{msg}");
            ChannelError::Transport(msg)
        })?;

        topics.remove(&topic);
        let count = topics.len() as i64;

        self.fanout
            .emit(ConnectionEvent::Reply(Reply::Unsubscribed { topic, count }));
        Ok(())
    }

    /// Forwards an incoming Pub/Sub message to the listeners.
    fn handle_incoming(&self, msg: redis::Msg) {
        // ---
        let topic = msg.get_channel_name().to_string();
        let payload = Bytes::copy_from_slice(msg.get_payload_bytes());

        self.fanout
            .emit(ConnectionEvent::Reply(Reply::Message { topic, payload }));
    }
} // RedisActor

async fn connect(
    client: &redis::Client,
    role: ConnectionRole,
    connection_id: &str,
) -> std::result::Result<Link, String> {
    // ---
    let failed = |err: redis::RedisError| format!("{connection_id}: failed to connect: {err}");

    match role {
        ConnectionRole::Publisher => client
            .get_multiplexed_async_connection()
            .await
            .map(Link::Publisher)
            .map_err(failed),
        ConnectionRole::Subscriber => {
            let (sink, stream) = client.get_async_pubsub().await.map_err(failed)?.split();
            Ok(Link::Subscriber {
                sink,
                stream,
                topics: BTreeSet::new(),
            })
        }
    }
}

/// Check a publisher link with `PING`; subscriber links are always alive.
async fn ping(link: &mut Link) -> LinkHealth {
    // ---
    let Link::Publisher(conn) = link else {
        return LinkHealth::Alive;
    };
    let outcome = tokio::time::timeout(
        KEEPALIVE,
        redis::cmd("PING").query_async::<String>(conn),
    )
    .await
    .ok();
    LinkHealth::of(outcome)
}

/// Next Pub/Sub message; a publisher link never yields.
async fn next_message(link: &mut Link) -> Option<redis::Msg> {
    // ---
    match link {
        Link::Subscriber { stream, .. } => stream.next().await,
        Link::Publisher(_) => std::future::pending().await,
    }
}

fn is_fatal(err: &redis::RedisError) -> bool {
    err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal()
}

#[async_trait::async_trait]
impl Connection for RedisConnection {
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
        create_connection(self.config().sibling(role))
    }

    async fn subscribe(&self, topic: &str) -> Result<()> {
        // ---
        let topic = topic.to_string();
        self.request(|resp| Cmd::Subscribe { topic, resp }).await
    }

    async fn unsubscribe(&self, topic: &str) -> Result<()> {
        // ---
        let topic = topic.to_string();
        self.request(|resp| Cmd::Unsubscribe { topic, resp }).await
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()> {
        // ---
        let topic = topic.to_string();
        self.request(|resp| Cmd::Publish {
            topic,
            payload,
            resp,
        })
        .await
    }

    async fn close(&self) -> Result<()> {
        // ---
        if self.fanout.is_ended() {
            return Ok(());
        }
        // A stopped actor has already emitted End.
        let _ = self.request(|resp| Cmd::Close { resp }).await;
        Ok(())
    }
}

/// Creates a Redis connection from the given configuration.
///
/// The connection is established by a background task; `Connect` is
/// emitted once it is up.
///
/// # Errors
///
/// Returns an error if:
/// - The URI is missing or cannot be parsed
/// - No Tokio runtime is running
pub fn create_connection(config: ConnectionConfig) -> Result<ConnectionPtr> {
    // ---
    if config.uri.is_empty() {
        return Err(ChannelError::MissingConfig(
            "Redis connection requires URI".to_string(),
        ));
    }

    let client = redis::Client::open(config.uri.as_str()).map_err(|err| {
        let msg = format!("redis: failed to open client for URI {}: {err}", config.uri);
        log_error!("{msg}");
        ChannelError::Transport(msg)
    })?;

    let runtime = tokio::runtime::Handle::try_current().map_err(|_| ChannelError::NoRuntime)?;

    let (cmd_tx, cmd_rx) = mpsc::channel(64);
    let fanout = Arc::new(EventFanout::new());

    let actor = RedisActor {
        connection_id: config.connection_id.clone(),
        role: config.role,
        client,
        cmd_rx,
        fanout: Arc::clone(&fanout),
    };
    runtime.spawn(actor.run());

    log_debug!("{}: redis connection to {} starting", config.connection_id, config.uri);

    Ok(Arc::new(RedisConnection {
        base: ConnectionBase::from(&config),
        cmd_tx,
        fanout,
    }))
}
