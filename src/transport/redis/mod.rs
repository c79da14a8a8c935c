//! Redis protocol connections.
//!
//! This module contains the connection implementation for Redis Pub/Sub.
//! Currently supports:
//! - redis - Redis Pub/Sub via the `redis` library (redis.rs)

#[cfg(feature = "transport_redis")]
#[allow(clippy::module_inception)]
mod redis;

#[cfg(feature = "transport_redis")]
pub use self::redis::create_connection as create_redis_connection;

#[cfg(not(feature = "transport_redis"))]
pub fn create_redis_connection(
    _config: crate::ConnectionConfig,
) -> crate::Result<crate::ConnectionPtr> {
    Err(crate::ChannelError::Transport(
        "transport_redis feature is not enabled".into(),
    ))
}
