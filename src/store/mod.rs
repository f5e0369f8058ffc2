//! The shared key-value store seam.
//!
//! All connection state lives behind the [`Store`] trait: hashes for context
//! records, strings for subscribe payload records, and sets for the fan-out
//! index. The three multi-key registry mutations are part of the trait so
//! that implementations can apply each one atomically: the Redis store runs
//! them as single server-side scripts, the in-memory store inside one
//! critical section.

mod memory;
#[cfg(feature = "redis-store")]
mod redis;

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;

pub use self::memory::MemoryStore;
#[cfg(feature = "redis-store")]
pub use self::redis::RedisStore;

/// A boxed error from a store backend.
pub type BackendError = Box<dyn std::error::Error + Send + Sync>;

/// An error reported by the store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend failed to execute the operation.
    #[error("store backend error: {0}")]
    Backend(#[source] BackendError),

    /// The key exists but holds a different record type.
    #[error("wrong record type at key `{key}`")]
    WrongType {
        /// The offending key.
        key: String,
    },
}

/// The shared key-value store the adapter keeps all connection state in.
///
/// Implementations must apply [`replace_fields`](Store::replace_fields),
/// [`link_subscription`](Store::link_subscription),
/// [`unlink_subscription`](Store::unlink_subscription), and
/// [`purge_connection`](Store::purge_connection) atomically: concurrent
/// invocations may observe the state before or after one of these mutations,
/// never a torn intermediate.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Reads all fields of the hash at `key`; an absent key reads as empty.
    async fn read_fields(&self, key: &str) -> Result<HashMap<String, String>, StoreError>;

    /// Writes the given hash fields at `key`, in order.
    async fn write_fields(&self, key: &str, fields: &[(String, String)]) -> Result<(), StoreError>;

    /// Deletes the given hash fields at `key`.
    async fn clear_fields(&self, key: &str, fields: &[String]) -> Result<(), StoreError>;

    /// Atomically replaces the hash at `key` with the given fields.
    async fn replace_fields(&self, key: &str, fields: &[(String, String)])
        -> Result<(), StoreError>;

    /// Reads the string value at `key`.
    async fn read_value(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Writes a string value at `key`, replacing any prior value.
    async fn write_value(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Lists the members of the set at `key`; an absent key reads as empty.
    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError>;

    /// Whether any record exists at `key`.
    async fn key_exists(&self, key: &str) -> Result<bool, StoreError>;

    /// Deletes the given keys, ignoring those that do not exist.
    async fn delete(&self, keys: &[String]) -> Result<(), StoreError>;

    /// Atomically records a subscription: adds `sub_key` to the set at
    /// `conn_key`, adds `channel` to the set at every key in `topic_keys`,
    /// and adds every topic key to the set at `sub_key`. Idempotent.
    async fn link_subscription(
        &self,
        conn_key: &str,
        sub_key: &str,
        topic_keys: &[String],
        channel: &str,
    ) -> Result<(), StoreError>;

    /// Atomically removes a subscription: removes `channel` from every topic
    /// set listed at `sub_key`, removes `sub_key` from the set at `conn_key`,
    /// and deletes `sub_key`. Tolerates an already-removed subscription.
    async fn unlink_subscription(
        &self,
        conn_key: &str,
        sub_key: &str,
        channel: &str,
    ) -> Result<(), StoreError>;

    /// Atomically removes every subscription owned by the connection at
    /// `conn_key` (for each member `sub_key`, removing the
    /// `{conn_key}#{sub_key}` channel from every topic set listed at
    /// `sub_key` and deleting `sub_key`), then deletes `conn_key` itself.
    async fn purge_connection(&self, conn_key: &str) -> Result<(), StoreError>;
}
