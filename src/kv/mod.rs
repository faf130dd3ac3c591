//! Key/value store interface used for conversation flows, availability
//! probes, safety counters and catalog snapshots.
//!
//! The core depends only on the [`KvStore`] trait; the bundled
//! [`memory::MemoryKv`] backs the binary and the test suites. An external
//! Redis-style driver plugs in behind the same trait.

pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

/// Errors from K/V store operations.
#[derive(Debug, thiserror::Error)]
pub enum KvError {
    /// The backend is unreachable or timed out.
    #[error("kv store unavailable: {0}")]
    Unavailable(String),

    /// A stored value could not be serialized or deserialized.
    #[error("kv serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// TTL-aware JSON key/value store.
///
/// All values are JSON documents; callers serialize their own record types.
/// A `ttl` of `None` means the entry does not expire.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Read the value at `key`, or `None` when absent or expired.
    async fn get(&self, key: &str) -> Result<Option<Value>, KvError>;

    /// Write `value` at `key`, replacing any existing entry and resetting
    /// the TTL.
    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<(), KvError>;

    /// Delete the entry at `key`. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), KvError>;
}

/// Read and deserialize a typed record from the store.
///
/// Returns `None` when the key is absent or the stored document does not
/// match the expected shape (corrupt entries are treated as missing).
pub async fn get_record<T: serde::de::DeserializeOwned>(
    kv: &dyn KvStore,
    key: &str,
) -> Result<Option<T>, KvError> {
    match kv.get(key).await? {
        Some(value) => Ok(serde_json::from_value(value).ok()),
        None => Ok(None),
    }
}

/// Serialize and write a typed record to the store.
pub async fn set_record<T: serde::Serialize>(
    kv: &dyn KvStore,
    key: &str,
    record: &T,
    ttl: Option<Duration>,
) -> Result<(), KvError> {
    let value = serde_json::to_value(record)?;
    kv.set(key, value, ttl).await
}
