// src/channel/ownership.rs

//! Connection ownership.
//!
//! A channel either created a connection (and must close it on teardown) or
//! was handed it by the caller (and must only detach its own listener). The
//! decision is made once, at construction, and travels with the connection
//! as a [`Provisioned`] pair.

use std::fmt;

use crate::{ConnectionPtr, ConnectionRole};

/// Who is responsible for closing a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    /// Created by the channel; closed on teardown.
    Owned,
    /// Supplied by the caller; left open on teardown.
    Borrowed,
}

/// A connection together with the channel's ownership of it.
#[derive(Clone)]
pub struct Provisioned {
    pub connection: ConnectionPtr,
    pub ownership: Ownership,
}

impl Provisioned {
    pub fn owned(connection: ConnectionPtr) -> Self {
        Self {
            connection,
            ownership: Ownership::Owned,
        }
    }

    pub fn borrowed(connection: ConnectionPtr) -> Self {
        Self {
            connection,
            ownership: Ownership::Borrowed,
        }
    }

    pub fn is_owned(&self) -> bool {
        self.ownership == Ownership::Owned
    }

    pub fn role(&self) -> ConnectionRole {
        self.connection.role()
    }
}

impl fmt::Debug for Provisioned {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Provisioned")
            .field("connection", &self.connection.connection_id())
            .field("ownership", &self.ownership)
            .finish()
    }
}
