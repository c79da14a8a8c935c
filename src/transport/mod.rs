//! Connection backends.
//!
//! This module provides concrete implementations of the domain-level
//! `Connection` trait. Backends other than the in-memory broker are hidden
//! behind feature flags and exposed only through constructor functions.
//!
//! Channel code must not depend on backend-specific types.

mod listeners;
mod memory;
mod redis;

pub use memory::{create_memory_connection, MemoryBroker, MemoryConnection};
pub use self::redis::create_redis_connection;
