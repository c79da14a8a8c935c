// tests/channel_protocol.rs
//
// Drives the connection side by hand through a manual memory broker: the
// test decides when connections go live and may forge broker replies.

mod common;

use std::sync::Arc;

use bytes::Bytes;
use serde_json::json;

use common::{eventually, expect_closed, expect_quiet, init_logging, next_event, open_pair};
use mom_channel::{
    // ---
    Channel,
    ChannelBuilder,
    ChannelError,
    ChannelEvent,
    ChannelEvents,
    Connection,
    ConnectionEvent,
    MemoryBroker,
    MemoryConnection,
    ReadyState,
    Reply,
    Result,
};

const TOPIC: &str = "t";

struct Harness {
    // ---
    channel: Channel,
    events: ChannelEvents,
    publisher: Arc<MemoryConnection>,
    subscriber: Arc<MemoryConnection>,
}

impl Harness {
    // ---
    /// A channel over two borrowed, still offline connections, with its
    /// listeners already attached.
    async fn attached(prefix: &str) -> Result<Self> {
        // ---
        let broker = MemoryBroker::manual();
        let (publisher, subscriber) = open_pair(&broker, prefix);

        let (channel, events) = ChannelBuilder::new(TOPIC)
            .connections(publisher.clone(), subscriber.clone())
            .build()?;

        eventually("the channel is attached", || {
            publisher.listener_count() == 1 && subscriber.listener_count() == 1
        })
        .await;

        Ok(Self {
            channel,
            events,
            publisher,
            subscriber,
        })
    }

    /// Both connections live and the subscription confirmed.
    async fn ready(prefix: &str) -> Result<Self> {
        // ---
        let mut harness = Self::attached(prefix).await?;
        harness.publisher.establish();
        harness.subscriber.establish();

        assert!(matches!(
            next_event(&mut harness.events).await,
            ChannelEvent::Connect
        ));
        Ok(harness)
    }

    fn message(&self, topic: &str, payload: &'static str) {
        self.subscriber
            .inject(ConnectionEvent::Reply(Reply::Message {
                topic: topic.to_string(),
                payload: Bytes::from_static(payload.as_bytes()),
            }));
    }

    fn ack(&self, topic: &str, count: i64) {
        self.subscriber
            .inject(ConnectionEvent::Reply(Reply::Subscribed {
                topic: topic.to_string(),
                count,
            }));
    }

    fn assert_released(&self) {
        assert_eq!(self.publisher.listener_count(), 0);
        assert_eq!(self.subscriber.listener_count(), 0);
        assert!(!self.publisher.is_closed());
        assert!(!self.subscriber.is_closed());
    }
}

async fn expect_protocol_error(events: &mut ChannelEvents) {
    match next_event(events).await {
        ChannelEvent::Error(ChannelError::Protocol(_)) => {}
        other => panic!("expected protocol error, got {other:?}"),
    }
}

#[tokio::test]
async fn ready_requires_both_sides() -> Result<()> {
    // ---
    init_logging();

    let mut h = Harness::attached("both-sides").await?;

    h.subscriber.establish();
    eventually("the subscription is registered", || {
        h.subscriber.subscriptions() == [TOPIC]
    })
    .await;
    expect_quiet(&mut h.events).await;
    assert_eq!(h.channel.ready_state(), ReadyState::Unready);

    h.publisher.establish();
    assert!(matches!(next_event(&mut h.events).await, ChannelEvent::Connect));
    assert!(h.channel.is_ready());
    Ok(())
}

#[tokio::test]
async fn repeated_connect_in_one_lifetime_does_not_resubscribe() -> Result<()> {
    // ---
    init_logging();

    let mut h = Harness::ready("repeated-connect").await?;

    h.subscriber.inject(ConnectionEvent::Connect);

    expect_quiet(&mut h.events).await;
    assert!(h.channel.is_ready());
    assert_eq!(h.subscriber.subscriptions(), [TOPIC]);
    Ok(())
}

#[tokio::test]
async fn foreign_topic_messages_are_discarded() -> Result<()> {
    // ---
    init_logging();

    let mut h = Harness::ready("foreign").await?;

    h.message("other", r#""not for us""#);
    h.message(TOPIC, r#""for us""#);

    match next_event(&mut h.events).await {
        ChannelEvent::Message(payload) => assert_eq!(payload.as_value(), Some(&json!("for us"))),
        other => panic!("expected message, got {other:?}"),
    }
    expect_quiet(&mut h.events).await;
    Ok(())
}

#[tokio::test]
async fn undecodable_message_is_an_error_but_not_fatal() -> Result<()> {
    // ---
    init_logging();

    let mut h = Harness::ready("undecodable").await?;

    h.message(TOPIC, "{not json");
    match next_event(&mut h.events).await {
        ChannelEvent::Error(ChannelError::Decode(_)) => {}
        other => panic!("expected decode error, got {other:?}"),
    }

    h.message(TOPIC, "[1,2]");
    match next_event(&mut h.events).await {
        ChannelEvent::Message(payload) => assert_eq!(payload.as_value(), Some(&json!([1, 2]))),
        other => panic!("expected message, got {other:?}"),
    }
    assert!(h.channel.is_ready());
    Ok(())
}

#[tokio::test]
async fn duplicate_acknowledgment_ends_the_channel() -> Result<()> {
    // ---
    init_logging();

    let mut h = Harness::ready("duplicate-ack").await?;

    h.ack(TOPIC, 1);

    expect_protocol_error(&mut h.events).await;
    assert!(matches!(next_event(&mut h.events).await, ChannelEvent::End));
    expect_closed(&mut h.events).await;
    h.assert_released();
    assert!(h.subscriber.subscriptions().is_empty());
    Ok(())
}

#[tokio::test]
async fn acknowledgment_before_subscribe_is_a_protocol_error() -> Result<()> {
    // ---
    init_logging();

    let mut h = Harness::attached("early-ack").await?;

    h.ack(TOPIC, 1);

    expect_protocol_error(&mut h.events).await;
    // Never ready, so the channel ends without an End event.
    expect_closed(&mut h.events).await;
    assert_eq!(h.channel.ready_state(), ReadyState::Ended);
    h.assert_released();
    Ok(())
}

#[tokio::test]
async fn acknowledgment_for_another_topic_is_a_protocol_error() -> Result<()> {
    // ---
    init_logging();

    let mut h = Harness::attached("mismatched-ack").await?;
    h.publisher.establish();

    // Queued right behind Connect, ahead of the real acknowledgment.
    h.subscriber.establish();
    h.ack("elsewhere", 1);

    expect_protocol_error(&mut h.events).await;
    expect_closed(&mut h.events).await;
    h.assert_released();
    Ok(())
}

#[tokio::test]
async fn shared_subscribe_connection_is_a_protocol_error() -> Result<()> {
    // ---
    init_logging();

    let broker = MemoryBroker::manual();
    let (publisher, subscriber) = open_pair(&broker, "count");
    publisher.establish();
    subscriber.establish();
    subscriber.subscribe("someone-else").await?;

    let (_channel, mut events) = ChannelBuilder::new(TOPIC)
        .connections(publisher, subscriber.clone())
        .build()?;

    expect_protocol_error(&mut events).await;
    expect_closed(&mut events).await;

    // Only our own subscription is withdrawn.
    assert_eq!(subscriber.subscriptions(), ["someone-else"]);
    Ok(())
}

#[tokio::test]
async fn unexpected_reply_on_the_publish_connection_ends_the_channel() -> Result<()> {
    // ---
    init_logging();

    let mut h = Harness::ready("unexpected").await?;

    h.publisher
        .inject(ConnectionEvent::Reply(Reply::Unexpected("QUEUED".into())));

    expect_protocol_error(&mut h.events).await;
    assert!(matches!(next_event(&mut h.events).await, ChannelEvent::End));
    expect_closed(&mut h.events).await;
    Ok(())
}

#[tokio::test]
async fn broker_errors_and_connection_errors_are_forwarded() -> Result<()> {
    // ---
    init_logging();

    let mut h = Harness::ready("errors").await?;

    h.publisher
        .inject(ConnectionEvent::Reply(Reply::Error("ERR wrong type".into())));
    match next_event(&mut h.events).await {
        ChannelEvent::Error(ChannelError::Broker(text)) => assert_eq!(text, "ERR wrong type"),
        other => panic!("expected broker error, got {other:?}"),
    }

    h.subscriber.inject(ConnectionEvent::Error("socket hiccup".into()));
    match next_event(&mut h.events).await {
        ChannelEvent::Error(ChannelError::Connection { connection, reason }) => {
            assert_eq!(connection, "errors-sub");
            assert_eq!(reason, "socket hiccup");
        }
        other => panic!("expected connection error, got {other:?}"),
    }

    assert!(h.channel.is_ready());
    Ok(())
}

#[tokio::test]
async fn transient_disconnect_and_reconnect() -> Result<()> {
    // ---
    init_logging();

    let mut h = Harness::ready("reconnect").await?;

    h.subscriber.drop_link();
    assert!(matches!(next_event(&mut h.events).await, ChannelEvent::Disconnected));
    assert_eq!(h.channel.ready_state(), ReadyState::Unready);

    // The subscription is issued again on the new connection lifetime.
    h.subscriber.restore_link();
    assert!(matches!(next_event(&mut h.events).await, ChannelEvent::Connect));
    assert_eq!(h.subscriber.subscriptions(), [TOPIC]);

    h.publisher.drop_link();
    assert!(matches!(next_event(&mut h.events).await, ChannelEvent::Disconnected));
    h.publisher.restore_link();
    assert!(matches!(next_event(&mut h.events).await, ChannelEvent::Connect));

    h.channel.send(json!("after reconnect")).await?;
    match next_event(&mut h.events).await {
        ChannelEvent::Message(payload) => {
            assert_eq!(payload.as_value(), Some(&json!("after reconnect")));
        }
        other => panic!("expected message, got {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn publisher_end_ends_the_channel_once() -> Result<()> {
    // ---
    init_logging();

    let mut h = Harness::ready("publisher-end").await?;

    h.publisher.end();

    assert!(matches!(next_event(&mut h.events).await, ChannelEvent::End));
    expect_closed(&mut h.events).await;
    assert_eq!(h.publisher.listener_count(), 0);
    assert_eq!(h.subscriber.listener_count(), 0);
    assert!(h.subscriber.subscriptions().is_empty());

    // A later close is a no-op.
    h.channel.close().await;
    Ok(())
}

#[tokio::test]
async fn subscriber_end_ends_the_channel_once() -> Result<()> {
    // ---
    init_logging();

    let mut h = Harness::ready("subscriber-end").await?;

    h.subscriber.end();

    assert!(matches!(next_event(&mut h.events).await, ChannelEvent::End));
    expect_closed(&mut h.events).await;
    h.assert_released();
    Ok(())
}

#[tokio::test]
async fn events_after_destroy_are_suppressed() -> Result<()> {
    // ---
    init_logging();

    let mut h = Harness::ready("suppressed").await?;

    h.message(TOPIC, r#""queued before destroy""#);
    h.channel.destroy();

    // The queued message is dropped; only End remains.
    assert!(matches!(next_event(&mut h.events).await, ChannelEvent::End));
    expect_closed(&mut h.events).await;
    Ok(())
}

#[tokio::test]
async fn publish_on_an_offline_connection_fails() -> Result<()> {
    // ---
    init_logging();

    let h = Harness::attached("offline").await?;

    let err = h.channel.send(json!("nobody home")).await.unwrap_err();
    assert!(matches!(err, ChannelError::NotConnected(id) if id == "offline-pub"));
    Ok(())
}
