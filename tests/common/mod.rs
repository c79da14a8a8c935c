// tests/common/mod.rs

#![allow(dead_code)]

use std::sync::Arc;

use tokio::time::{timeout, Duration};

use mom_channel::{
    // ---
    ChannelEvent,
    ChannelEvents,
    ConnectionConfig,
    ConnectionRole,
    MemoryBroker,
    MemoryConnection,
};

/// Upper bound for anything that is expected to happen.
pub const WAIT: Duration = Duration::from_secs(2);

/// How long to listen before concluding nothing else arrives.
pub const QUIET: Duration = Duration::from_millis(100);

pub fn init_logging() {
    // ---
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Next admitted channel event; panics on timeout or a closed inbox.
pub async fn next_event(events: &mut ChannelEvents) -> ChannelEvent {
    // ---
    timeout(WAIT, events.recv())
        .await
        .expect("timed out waiting for channel event")
        .expect("channel event inbox closed unexpectedly")
}

/// Assert that no further event arrives; a closed inbox counts as quiet.
pub async fn expect_quiet(events: &mut ChannelEvents) {
    // ---
    if let Ok(Some(event)) = timeout(QUIET, events.recv()).await {
        panic!("unexpected channel event: {event:?}");
    }
}

/// Assert that the inbox is closed: the channel ended and nothing is left.
pub async fn expect_closed(events: &mut ChannelEvents) {
    // ---
    let next = timeout(WAIT, events.recv())
        .await
        .expect("timed out waiting for the event inbox to close");
    assert!(next.is_none(), "expected closed inbox, got {next:?}");
}

/// Poll `check` until it holds or the wait bound expires.
pub async fn eventually(what: &str, check: impl Fn() -> bool) {
    // ---
    let polled = timeout(WAIT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(polled.is_ok(), "timed out waiting until {what}");
}

pub fn config(uri: &str, id: &str, role: ConnectionRole) -> ConnectionConfig {
    ConnectionConfig {
        uri: uri.to_string(),
        connection_id: id.to_string(),
        role,
        transport_type: None,
    }
}

/// Open a publisher and a subscriber on `broker`.
pub fn open_pair(
    broker: &Arc<MemoryBroker>,
    prefix: &str,
) -> (Arc<MemoryConnection>, Arc<MemoryConnection>) {
    // ---
    let uri = "memory://pair";
    let publisher = broker
        .open(config(uri, &format!("{prefix}-pub"), ConnectionRole::Publisher))
        .expect("failed to open publisher");
    let subscriber = broker
        .open(config(uri, &format!("{prefix}-sub"), ConnectionRole::Subscriber))
        .expect("failed to open subscriber");
    (publisher, subscriber)
}
