//! Topic-bound channels.
//!
//! A [`Channel`] binds one topic to a pair of broker connections: one that
//! only publishes and one that only subscribes. It hides the two raw
//! connection lifecycles behind a single one, delivered as [`ChannelEvent`]s
//! on the [`ChannelEvents`] inbox returned at construction.
//!
//! # Example
//!
//! ```no_run
//! use mom_channel::{ChannelBuilder, ChannelEvent};
//!
//! # async fn example() -> mom_channel::Result<()> {
//! let (channel, mut events) = ChannelBuilder::new("foo")
//!     .endpoint("memory://docs")
//!     .build()?;
//!
//! channel.wait_ready().await?;
//! channel.send_json(&serde_json::json!({ "x": "bla" })).await?;
//!
//! while let Some(event) = events.recv().await {
//!     if let ChannelEvent::Message(payload) = event {
//!         println!("received {payload:?}");
//!         break;
//!     }
//! }
//!
//! channel.close().await;
//! # Ok(())
//! # }
//! ```

mod coordinator;
mod ownership;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};

use self::coordinator::{Cmd, Coordinator};
use crate::{
    // ---
    codec,
    log_debug,
    ChannelError,
    Payload,
    Result,
};

pub use ownership::{Ownership, Provisioned};

/// Derived readiness of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    /// At least one side is not live, or the subscription is not confirmed.
    Unready,
    /// Publish side live and subscription confirmed.
    Ready,
    /// Torn down. Terminal.
    Ended,
}

/// Events of the combined channel lifecycle.
#[derive(Debug)]
pub enum ChannelEvent {
    /// The channel became ready.
    Connect,
    /// A message for the channel topic, decoded with the current mode.
    Message(Payload),
    /// A protocol violation, decode failure, broker error reply or
    /// connection error.
    Error(ChannelError),
    /// A ready channel lost one side temporarily and is unready again.
    Disconnected,
    /// A ready channel ended. Always the last event.
    End,
}

/// State shared between the handle, the event inbox and the coordinator.
pub(crate) struct Shared {
    pub(crate) topic: Arc<str>,
    raw: AtomicBool,
    closing: AtomicBool,
    publisher: Ownership,
    subscriber: Ownership,
}

impl Shared {
    pub(crate) fn raw_mode(&self) -> bool {
        self.raw.load(Ordering::SeqCst)
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }
}

/// Handle to a topic-bound channel.
///
/// Dropping the handle tears the channel down, as [`destroy`](Self::destroy)
/// does.
pub struct Channel {
    // ---
    shared: Arc<Shared>,
    cmd_tx: mpsc::UnboundedSender<Cmd>,
    state_rx: watch::Receiver<ReadyState>,
}

impl Channel {
    // ---
    /// Start a channel over two provisioned connections.
    ///
    /// Returns immediately; the coordinator attaches its listeners on the
    /// next scheduling turn of the runtime.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::NoRuntime`] outside a Tokio runtime.
    pub fn start(
        topic: impl Into<Arc<str>>,
        publisher: Provisioned,
        subscriber: Provisioned,
        raw_mode: bool,
    ) -> Result<(Channel, ChannelEvents)> {
        // ---
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| ChannelError::NoRuntime)?;

        let shared = Arc::new(Shared {
            topic: topic.into(),
            raw: AtomicBool::new(raw_mode),
            closing: AtomicBool::new(false),
            publisher: publisher.ownership,
            subscriber: subscriber.ownership,
        });

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ReadyState::Unready);

        log_debug!(
            "{}: starting channel over {publisher:?} / {subscriber:?}",
            shared.topic
        );

        let coordinator = Coordinator::new(
            Arc::clone(&shared),
            publisher,
            subscriber,
            cmd_rx,
            events_tx,
            state_tx,
        );
        runtime.spawn(coordinator.run());

        let channel = Channel {
            shared: Arc::clone(&shared),
            cmd_tx,
            state_rx,
        };
        let events = ChannelEvents {
            inbox: events_rx,
            shared,
        };

        Ok((channel, events))
    }

    /// The topic this channel is bound to.
    pub fn topic(&self) -> &str {
        &self.shared.topic
    }

    /// Whether payloads are sent and received in raw mode.
    pub fn raw_mode(&self) -> bool {
        self.shared.raw_mode()
    }

    /// Switch between raw and structured mode.
    ///
    /// Takes effect for the next send and the next received message.
    pub fn set_raw_mode(&self, raw: bool) {
        self.shared.raw.store(raw, Ordering::SeqCst);
    }

    /// Ownership of the publish connection.
    pub fn publisher_ownership(&self) -> Ownership {
        self.shared.publisher
    }

    /// Ownership of the subscribe connection.
    pub fn subscriber_ownership(&self) -> Ownership {
        self.shared.subscriber
    }

    /// Current readiness.
    pub fn ready_state(&self) -> ReadyState {
        *self.state_rx.borrow()
    }

    pub fn is_ready(&self) -> bool {
        self.ready_state() == ReadyState::Ready
    }

    /// Wait until the channel is ready.
    ///
    /// There is no built-in timeout; wrap the call in
    /// `tokio::time::timeout` if one is needed.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Ended`] if the channel ends first.
    pub async fn wait_ready(&self) -> Result<()> {
        // ---
        let mut state_rx = self.state_rx.clone();
        let ready = state_rx
            .wait_for(|state| *state != ReadyState::Unready)
            .await
            .map(|state| *state == ReadyState::Ready)
            .map_err(|_| ChannelError::Ended)?;

        if ready {
            Ok(())
        } else {
            Err(ChannelError::Ended)
        }
    }

    /// Encode `payload` with the current mode and publish it on the topic.
    ///
    /// Resolves once the publish command has been issued on the publish
    /// connection. Sending on an ended channel is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an encode error if the payload cannot be represented in the
    /// current mode, or the connection's error if the command fails.
    pub async fn send(&self, payload: impl Into<Payload>) -> Result<()> {
        // ---
        let payload = codec::encode(payload.into(), self.raw_mode())?;

        if self.shared.is_closing() {
            log_debug!("{}: send after destroy ignored", self.topic());
            return Ok(());
        }

        let (resp_tx, resp_rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Cmd::Publish {
                payload,
                resp: resp_tx,
            })
            .is_err()
        {
            log_debug!("{}: send on ended channel ignored", self.topic());
            return Ok(());
        }

        // A dropped responder means the channel ended with the command queued.
        resp_rx.await.unwrap_or(Ok(()))
    }

    /// Serialize `value` to JSON and send it as a structured payload.
    pub async fn send_json<T: Serialize>(&self, value: &T) -> Result<()> {
        self.send(Payload::json(value)?).await
    }

    /// Begin teardown without waiting for it to finish.
    ///
    /// Safe to call at any time and any number of times. After this call no
    /// `Connect`, `Message` or `Error` event is delivered.
    pub fn destroy(&self) {
        // ---
        if self.shared.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.cmd_tx.send(Cmd::Close { resp: None });
    }

    /// Tear the channel down and wait until its connections are released.
    pub async fn close(&self) {
        // ---
        self.shared.closing.store(true, Ordering::SeqCst);

        let (resp_tx, resp_rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Cmd::Close {
                resp: Some(resp_tx),
            })
            .is_ok()
        {
            let _ = resp_rx.await;
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Inbox of channel events, returned together with the [`Channel`].
///
/// Events are buffered from the moment the channel is created, so none can
/// be missed by registering late.
pub struct ChannelEvents {
    // ---
    inbox: mpsc::UnboundedReceiver<ChannelEvent>,
    shared: Arc<Shared>,
}

impl ChannelEvents {
    // ---
    /// Receive the next event.
    ///
    /// Returns `None` once the channel has ended and all events were taken.
    /// After [`Channel::destroy`] only a final [`ChannelEvent::End`] can
    /// still be observed.
    pub async fn recv(&mut self) -> Option<ChannelEvent> {
        // ---
        loop {
            let event = self.inbox.recv().await?;
            if self.admits(&event) {
                return Some(event);
            }
        }
    }

    /// Receive the next event if one is already queued.
    pub fn try_recv(&mut self) -> Option<ChannelEvent> {
        // ---
        while let Ok(event) = self.inbox.try_recv() {
            if self.admits(&event) {
                return Some(event);
            }
        }
        None
    }

    fn admits(&self, event: &ChannelEvent) -> bool {
        !self.shared.is_closing() || matches!(event, ChannelEvent::End)
    }
}
