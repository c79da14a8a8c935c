// src/channel/coordinator.rs

//! The channel coordinator actor.
//!
//! A single background task owns both provisioned connections and every
//! piece of channel state. Connection events and commands from the
//! [`Channel`](super::Channel) handle are taken one at a time and handled to
//! completion, so no lock guards the state below.
//!
//! ## Readiness
//!
//! Readiness is the conjunction of two independent facts, recomputed after
//! every event that can change either of them:
//!
//! - the publish connection is live;
//! - the subscribe acknowledgment for the channel topic has been validated on
//!   the current subscribe-connection lifetime.
//!
//! A transient `Disconnect` on either side clears its fact; the next
//! `Connect` (and, for the subscribe side, the next validated
//! acknowledgment) restores it. `End` on either side tears the channel down.
//!
//! ## Teardown
//!
//! Teardown detaches exactly the listener tokens this coordinator attached,
//! unsubscribes a borrowed subscribe connection it issued a subscribe on, and
//! closes owned connections. It runs at most once.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, watch};

use super::ownership::{Ownership, Provisioned};
use super::{ChannelEvent, ReadyState, Shared};
use crate::{
    // ---
    codec,
    log_debug,
    log_info,
    log_trace,
    log_warn,
    ChannelError,
    ConnectionEvent,
    EventInbox,
    ListenerToken,
    Reply,
    Result,
};

/// Commands sent from the channel handle to the coordinator.
pub(crate) enum Cmd {
    // ---
    Publish {
        payload: Bytes,
        resp: oneshot::Sender<Result<()>>,
    },
    Close {
        resp: Option<oneshot::Sender<()>>,
    },
}

impl Cmd {
    // ---

    /// Dispatches a command to the correct handler on the coordinator.
    async fn handle(self, coordinator: &mut Coordinator) {
        // ---
        match self {
            Cmd::Publish { payload, resp } => {
                let result = coordinator.handle_publish(payload).await;
                let _ = resp.send(result);
            }
            Cmd::Close { resp } => {
                coordinator.teardown("closed by caller").await;
                if let Some(resp) = resp {
                    let _ = resp.send(());
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Publisher,
    Subscriber,
}

/// One provisioned connection and, once setup ran, our registration on it.
struct Link {
    provisioned: Provisioned,
    listener: Option<(ListenerToken, EventInbox)>,
}

impl Link {
    fn new(provisioned: Provisioned) -> Self {
        Self {
            provisioned,
            listener: None,
        }
    }
}

pub(crate) struct Coordinator {
    // ---
    shared: Arc<Shared>,
    cmd_rx: mpsc::UnboundedReceiver<Cmd>,
    events_tx: mpsc::UnboundedSender<ChannelEvent>,
    state_tx: watch::Sender<ReadyState>,

    publisher: Option<Link>,
    subscriber: Option<Link>,

    publisher_live: bool,
    subscribe_issued: bool,
    subscribed: bool,
    ready: bool,
    ended: bool,
}

impl Coordinator {
    // ---
    pub(crate) fn new(
        shared: Arc<Shared>,
        publisher: Provisioned,
        subscriber: Provisioned,
        cmd_rx: mpsc::UnboundedReceiver<Cmd>,
        events_tx: mpsc::UnboundedSender<ChannelEvent>,
        state_tx: watch::Sender<ReadyState>,
    ) -> Self {
        Self {
            shared,
            cmd_rx,
            events_tx,
            state_tx,
            publisher: Some(Link::new(publisher)),
            subscriber: Some(Link::new(subscriber)),
            publisher_live: false,
            subscribe_issued: false,
            subscribed: false,
            ready: false,
            ended: false,
        }
    }

    pub(crate) async fn run(mut self) {
        // ---

        // A channel destroyed before its first turn never gets wired.
        if self.shared.is_closing() {
            self.teardown("destroyed before setup").await;
            return;
        }

        self.setup();

        while !self.ended {
            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(cmd) => cmd.handle(&mut self).await,
                        None => self.teardown("channel handle dropped").await,
                    }
                }

                event = next_event(&mut self.publisher) => {
                    self.on_publisher_event(event).await;
                }

                event = next_event(&mut self.subscriber) => {
                    self.on_subscriber_event(event).await;
                }
            }
        }

        log_debug!("{}: coordinator stopped", self.topic());
    }

    fn topic(&self) -> &str {
        &self.shared.topic
    }

    fn setup(&mut self) {
        // ---
        for link in [self.publisher.as_mut(), self.subscriber.as_mut()]
            .into_iter()
            .flatten()
        {
            link.listener = Some(link.provisioned.connection.attach());
        }

        log_debug!(
            "{}: attached to {:?} and {:?}",
            self.shared.topic,
            self.publisher.as_ref().map(|l| &l.provisioned),
            self.subscriber.as_ref().map(|l| &l.provisioned)
        );
    }

    fn emit(&self, event: ChannelEvent) {
        // ---
        log_trace!("{}: emit {event:?}", self.topic());
        let _ = self.events_tx.send(event);
    }

    fn connection_error(&self, side: Side, reason: String) -> ChannelError {
        // ---
        let link = match side {
            Side::Publisher => self.publisher.as_ref(),
            Side::Subscriber => self.subscriber.as_ref(),
        };
        let connection = link
            .map(|l| l.provisioned.connection.connection_id().to_string())
            .unwrap_or_default();
        ChannelError::Connection { connection, reason }
    }

    /// Re-derive readiness and announce a change, if any.
    fn refresh_readiness(&mut self) {
        // ---
        let ready = self.publisher_live && self.subscribed;
        if ready == self.ready {
            return;
        }

        self.ready = ready;
        if ready {
            log_info!("{}: channel ready", self.topic());
            self.state_tx.send_replace(ReadyState::Ready);
            self.emit(ChannelEvent::Connect);
        } else {
            log_info!("{}: channel no longer ready", self.topic());
            self.state_tx.send_replace(ReadyState::Unready);
            self.emit(ChannelEvent::Disconnected);
        }
    }

    async fn on_publisher_event(&mut self, event: ConnectionEvent) {
        // ---
        log_trace!("{}: publisher event {event:?}", self.topic());

        match event {
            ConnectionEvent::Connect => {
                self.publisher_live = true;
                self.refresh_readiness();
            }
            ConnectionEvent::Disconnect => {
                self.publisher_live = false;
                self.refresh_readiness();
            }
            ConnectionEvent::Reply(Reply::Published { .. }) => {}
            ConnectionEvent::Reply(Reply::Error(text)) => {
                self.emit(ChannelEvent::Error(ChannelError::Broker(text)));
            }
            ConnectionEvent::Reply(other) => {
                self.protocol_violation(format!("bad reply on publish connection: {other:?}"))
                    .await;
            }
            ConnectionEvent::Error(reason) => {
                let err = self.connection_error(Side::Publisher, reason);
                self.emit(ChannelEvent::Error(err));
            }
            ConnectionEvent::End => self.on_end(Side::Publisher).await,
        }
    }

    async fn on_subscriber_event(&mut self, event: ConnectionEvent) {
        // ---
        log_trace!("{}: subscriber event {event:?}", self.topic());

        match event {
            ConnectionEvent::Connect => self.issue_subscribe().await,
            ConnectionEvent::Disconnect => {
                // The broker forgot the subscription; a new lifetime starts.
                self.subscribe_issued = false;
                self.subscribed = false;
                self.refresh_readiness();
            }
            ConnectionEvent::Reply(Reply::Subscribed { topic, count }) => {
                match self.check_subscribe_ack(&topic, count) {
                    Ok(()) => {
                        log_debug!("{}: subscription confirmed", self.topic());
                        self.subscribed = true;
                        self.refresh_readiness();
                    }
                    Err(detail) => self.protocol_violation(detail).await,
                }
            }
            ConnectionEvent::Reply(Reply::Unsubscribed { .. }) => {}
            ConnectionEvent::Reply(Reply::Message { topic, payload }) => {
                self.deliver(&topic, payload);
            }
            ConnectionEvent::Reply(Reply::Error(text)) => {
                self.emit(ChannelEvent::Error(ChannelError::Broker(text)));
            }
            ConnectionEvent::Reply(other) => {
                self.protocol_violation(format!("bad reply on subscribe connection: {other:?}"))
                    .await;
            }
            ConnectionEvent::Error(reason) => {
                let err = self.connection_error(Side::Subscriber, reason);
                self.emit(ChannelEvent::Error(err));
            }
            ConnectionEvent::End => self.on_end(Side::Subscriber).await,
        }
    }

    /// Issue the single subscribe of this connection lifetime.
    async fn issue_subscribe(&mut self) {
        // ---
        if self.subscribe_issued {
            return;
        }
        let Some(link) = self.subscriber.as_ref() else {
            return;
        };
        let connection = Arc::clone(&link.provisioned.connection);

        self.subscribe_issued = true;
        log_debug!("{}: subscribing", self.topic());

        if let Err(err) = connection.subscribe(&self.shared.topic).await {
            log_warn!("{}: subscribe failed: {err}", self.topic());
            self.subscribe_issued = false;
            self.emit(ChannelEvent::Error(err));
        }
    }

    /// Validate a subscribe acknowledgment against the one we issued.
    fn check_subscribe_ack(&self, topic: &str, count: i64) -> std::result::Result<(), String> {
        // ---
        if !self.subscribe_issued {
            return Err(format!(
                "subscribe acknowledgment for '{topic}' before any subscribe was issued"
            ));
        }
        if self.subscribed {
            return Err(format!("duplicate subscribe acknowledgment for '{topic}'"));
        }
        if topic != self.topic() {
            return Err(format!(
                "subscribe acknowledgment for '{topic}', expected '{}'",
                self.topic()
            ));
        }
        if count != 1 {
            return Err(format!(
                "subscribe acknowledgment reports {count} active subscriptions, expected 1"
            ));
        }
        Ok(())
    }

    fn deliver(&self, topic: &str, payload: Bytes) {
        // ---
        if topic != self.topic() {
            log_debug!("{}: discarding message for '{topic}'", self.topic());
            return;
        }

        match codec::decode(payload, self.shared.raw_mode()) {
            Ok(message) => self.emit(ChannelEvent::Message(message)),
            Err(err) => {
                log_debug!("{}: undecodable message: {err}", self.topic());
                self.emit(ChannelEvent::Error(err));
            }
        }
    }

    async fn handle_publish(&mut self, payload: Bytes) -> Result<()> {
        // ---
        let Some(link) = self.publisher.as_ref() else {
            log_debug!("{}: send on ended channel ignored", self.topic());
            return Ok(());
        };
        let connection = Arc::clone(&link.provisioned.connection);
        connection.publish(&self.shared.topic, payload).await
    }

    async fn protocol_violation(&mut self, detail: String) {
        // ---
        log_warn!("{}: {detail}", self.topic());
        self.emit(ChannelEvent::Error(ChannelError::Protocol(detail)));
        self.teardown("protocol violation").await;
    }

    /// One side reported closure: forget it, then tear down the rest.
    async fn on_end(&mut self, side: Side) {
        // ---
        let was_ready = self.ready;

        let link = match side {
            Side::Publisher => self.publisher.take(),
            Side::Subscriber => self.subscriber.take(),
        };
        if let Some(Link {
            provisioned,
            listener: Some((token, _inbox)),
        }) = link
        {
            provisioned.connection.detach(token);
        }

        match side {
            Side::Publisher => self.publisher_live = false,
            Side::Subscriber => {
                self.subscribed = false;
                self.subscribe_issued = false;
            }
        }

        log_info!("{}: {side:?} connection ended", self.topic());
        self.finish(was_ready).await;
    }

    /// Explicit or cascading teardown. Idempotent.
    async fn teardown(&mut self, reason: &str) {
        // ---
        if self.ended {
            return;
        }
        log_debug!("{}: teardown ({reason})", self.topic());
        let was_ready = self.ready;
        self.finish(was_ready).await;
    }

    async fn finish(&mut self, was_ready: bool) {
        // ---
        if self.ended {
            return;
        }
        self.ended = true;
        self.ready = false;
        self.publisher_live = false;

        if let Some(link) = self.publisher.take() {
            self.release(link, false).await;
        }
        if let Some(link) = self.subscriber.take() {
            let unsubscribe = self.subscribe_issued;
            self.release(link, unsubscribe).await;
        }
        self.subscribe_issued = false;
        self.subscribed = false;

        self.state_tx.send_replace(ReadyState::Ended);
        if was_ready {
            self.emit(ChannelEvent::End);
        }
        log_info!("{}: channel ended", self.topic());
    }

    async fn release(&self, link: Link, unsubscribe: bool) {
        // ---
        let Link {
            provisioned,
            listener,
        } = link;
        let connection = provisioned.connection;

        if provisioned.ownership == Ownership::Borrowed && unsubscribe && connection.is_connected() {
            if let Err(_err) = connection.unsubscribe(&self.shared.topic).await {
                log_warn!(
                    "{}: unsubscribe on borrowed {} failed: {_err}",
                    self.topic(),
                    connection.connection_id()
                );
            }
        }

        if let Some((token, _inbox)) = listener {
            connection.detach(token);
        }

        if provisioned.ownership == Ownership::Owned {
            if let Err(_err) = connection.close().await {
                log_warn!(
                    "{}: closing owned {} failed: {_err}",
                    self.topic(),
                    connection.connection_id()
                );
            }
        }
    }
}

/// Next event of a link, pending forever once the link is gone.
///
/// An inbox that closes without `End` means the connection dropped our
/// registration; it is treated as `End`.
async fn next_event(link: &mut Option<Link>) -> ConnectionEvent {
    // ---
    match link.as_mut().and_then(|l| l.listener.as_mut()) {
        Some((_token, inbox)) => inbox.recv().await.unwrap_or(ConnectionEvent::End),
        None => std::future::pending().await,
    }
}
