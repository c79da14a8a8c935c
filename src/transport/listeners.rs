// src/transport/listeners.rs

//! Listener bookkeeping shared by the connection implementations.
//!
//! [`EventFanout`] keeps the registered listener inboxes of one connection
//! together with its live flag, under a single lock. Holding both in one place
//! is what lets `attach()` replay `Connect` to a late listener without racing
//! a concurrent state change.

use std::sync::{Mutex, MutexGuard};

use tokio::sync::mpsc;

use crate::{ConnectionEvent, EventInbox, ListenerToken};

/// Acquire mutex guard, ignoring poisoning
pub(crate) fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[derive(Default)]
struct FanoutState {
    next_token: u64,
    live: bool,
    ended: bool,
    listeners: Vec<(ListenerToken, mpsc::UnboundedSender<ConnectionEvent>)>,
}

/// Registered listeners and live state of one connection.
#[derive(Default)]
pub(crate) struct EventFanout {
    state: Mutex<FanoutState>,
}

impl EventFanout {
    // ---
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register a listener. A live connection replays `Connect` first.
    pub(crate) fn attach(&self) -> (ListenerToken, EventInbox) {
        // ---
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = lock_ignore_poison(&self.state);

        state.next_token += 1;
        let token = ListenerToken(state.next_token);

        if state.ended {
            // Nothing will ever be emitted again; hand out a closed inbox.
            return (token, rx);
        }
        if state.live {
            let _ = tx.send(ConnectionEvent::Connect);
        }
        state.listeners.push((token, tx));
        (token, rx)
    }

    /// Remove one registration. Returns whether it was present.
    pub(crate) fn detach(&self, token: ListenerToken) -> bool {
        // ---
        let mut state = lock_ignore_poison(&self.state);
        let before = state.listeners.len();
        state.listeners.retain(|(t, _)| *t != token);
        state.listeners.len() != before
    }

    /// Deliver an event to every listener, updating the live flag first.
    ///
    /// Listeners whose inbox was dropped are evicted. After `End` the
    /// listener list is cleared and later events are ignored.
    pub(crate) fn emit(&self, event: ConnectionEvent) {
        // ---
        let mut state = lock_ignore_poison(&self.state);
        if state.ended {
            return;
        }

        match event {
            ConnectionEvent::Connect => state.live = true,
            ConnectionEvent::Disconnect => state.live = false,
            ConnectionEvent::End => {
                state.live = false;
                state.ended = true;
            }
            _ => {}
        }

        state
            .listeners
            .retain(|(_, tx)| tx.send(event.clone()).is_ok());

        if state.ended {
            state.listeners.clear();
        }
    }

    pub(crate) fn is_live(&self) -> bool {
        lock_ignore_poison(&self.state).live
    }

    pub(crate) fn is_ended(&self) -> bool {
        lock_ignore_poison(&self.state).ended
    }

    pub(crate) fn len(&self) -> usize {
        lock_ignore_poison(&self.state).listeners.len()
    }
}
