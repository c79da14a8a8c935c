//! Domain layer public interface.
//!
//! This module defines domain-level abstractions that are independent of
//! connection implementations, protocols, or infrastructure concerns.
//!
//! All domain consumers must import symbols via this module, not by
//! referencing individual files directly.

mod connection;

pub(crate) use connection::short_id;

// --- Connection domain re-exports ---

pub use connection::{
    //
    Connection,
    ConnectionBase,
    ConnectionConfig,
    ConnectionEvent,
    ConnectionPtr,
    ConnectionRole,
    EventInbox,
    ListenerToken,
    Reply,
};
