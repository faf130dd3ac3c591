//! In-memory TTL key/value store.
//!
//! Entries expire lazily: a read past the deadline removes the entry and
//! reports a miss. Uses `tokio::time::Instant` so paused-clock tests can
//! drive expiry deterministically.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::{KvError, KvStore};

struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

/// In-memory [`KvStore`] implementation.
#[derive(Default)]
pub struct MemoryKv {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryKv {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live (non-expired) entries. Test helper.
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        let entries = self.entries.lock().await;
        entries
            .values()
            .filter(|e| e.expires_at.is_none_or(|at| now < at))
            .count()
    }

    /// Whether the store holds no live entries.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<Value>, KvError> {
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some(entry) => {
                if entry.expires_at.is_some_and(|at| Instant::now() >= at) {
                    entries.remove(key);
                    Ok(None)
                } else {
                    Ok(Some(entry.value.clone()))
                }
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<(), KvError> {
        let expires_at = ttl.map(|d| Instant::now().checked_add(d).unwrap_or_else(Instant::now));
        let mut entries = self.entries.lock().await;
        entries.insert(key.to_owned(), Entry { value, expires_at });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        let mut entries = self.entries.lock().await;
        entries.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_set_get_roundtrip() {
        let kv = MemoryKv::new();
        kv.set("a", json!({"x": 1}), None).await.expect("set");
        let got = kv.get("a").await.expect("get");
        assert_eq!(got, Some(json!({"x": 1})));
    }

    #[tokio::test]
    async fn test_get_missing_is_none() {
        let kv = MemoryKv::new();
        assert_eq!(kv.get("nope").await.expect("get"), None);
    }

    #[tokio::test]
    async fn test_delete_removes_entry() {
        let kv = MemoryKv::new();
        kv.set("a", json!(1), None).await.expect("set");
        kv.delete("a").await.expect("delete");
        assert_eq!(kv.get("a").await.expect("get"), None);
        // Deleting again is a no-op.
        kv.delete("a").await.expect("delete");
    }

    #[tokio::test(start_paused = true)]
    async fn test_entry_expires_after_ttl() {
        let kv = MemoryKv::new();
        kv.set("a", json!("v"), Some(Duration::from_secs(10)))
            .await
            .expect("set");

        tokio::time::advance(Duration::from_secs(9)).await;
        assert_eq!(kv.get("a").await.expect("get"), Some(json!("v")));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(kv.get("a").await.expect("get"), None);
        assert!(kv.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_refreshes_ttl() {
        let kv = MemoryKv::new();
        kv.set("a", json!(1), Some(Duration::from_secs(10)))
            .await
            .expect("set");
        tokio::time::advance(Duration::from_secs(8)).await;
        kv.set("a", json!(2), Some(Duration::from_secs(10)))
            .await
            .expect("set");
        tokio::time::advance(Duration::from_secs(8)).await;
        assert_eq!(kv.get("a").await.expect("get"), Some(json!(2)));
    }

    #[tokio::test]
    async fn test_typed_record_helpers() {
        #[derive(serde::Serialize, serde::Deserialize)]
        struct Rec {
            n: u32,
        }

        let kv = MemoryKv::new();
        super::super::set_record(&kv, "rec", &Rec { n: 7 }, None)
            .await
            .expect("set");
        let rec: Option<Rec> = super::super::get_record(&kv, "rec").await.expect("get");
        assert_eq!(rec.map(|r| r.n), Some(7));

        // A document with the wrong shape reads back as None.
        kv.set("rec", json!("not-an-object"), None).await.expect("set");
        let rec: Option<Rec> = super::super::get_record(&kv, "rec").await.expect("get");
        assert!(rec.is_none());
    }
}
