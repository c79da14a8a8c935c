//! Channel example using the in-memory broker.
//!
//! Two channels on topic "foo" share one in-process broker. Each message
//! published by either channel reaches both of them, first in structured
//! mode and then in raw mode.
//!
//! Run with: cargo run --example channel_memory

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::panic_in_result_fn
)]

use mom_channel::{create_channel, ChannelEvent, ChannelEvents, Result};
use serde_json::json;
use tokio::time::{timeout, Duration};
use tracing_subscriber::{fmt as tracing_format, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    tracing_format()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(true)
        .with_line_number(true)
        .init();

    let uri = "memory://demo";
    let (alice, mut alice_events) = create_channel(uri, "foo")?;
    let (bob, mut bob_events) = create_channel(uri, "foo")?;

    alice.wait_ready().await?;
    bob.wait_ready().await?;
    println!("both channels ready");

    alice.send(json!({ "x": "bla" })).await?;
    print_message("alice", &mut alice_events).await;
    print_message("bob", &mut bob_events).await;

    alice.set_raw_mode(true);
    bob.set_raw_mode(true);

    bob.send("bla").await?;
    print_message("alice", &mut alice_events).await;
    print_message("bob", &mut bob_events).await;

    alice.close().await;
    bob.close().await;
    println!("channels closed");

    Ok(())
}

// Skips lifecycle events until the next message arrives.
async fn print_message(name: &str, events: &mut ChannelEvents) {
    // ---
    loop {
        let event = timeout(Duration::from_secs(1), events.recv())
            .await
            .expect("timed out waiting for a message")
            .expect("channel ended");

        match event {
            ChannelEvent::Message(payload) => {
                println!("{name} received {payload:?}");
                return;
            }
            ChannelEvent::Error(err) => println!("{name} error: {err}"),
            _ => {}
        }
    }
}
