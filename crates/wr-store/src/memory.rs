use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
// tokio's Instant respects paused test clocks, unlike std's.
use tokio::time::Instant;

use crate::store::{KvStore, Result};

// ---------------------------------------------------------------------------
// MemoryStore — in-process KvStore for tests and local development
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Inner {
    strings: HashMap<String, (String, Option<Instant>)>,
    lists: HashMap<String, VecDeque<String>>,
    hashes: HashMap<String, HashMap<String, (String, Option<Instant>)>>,
}

impl Inner {
    fn purge_expired(&mut self) {
        let now = Instant::now();
        self.strings
            .retain(|_, (_, deadline)| deadline.map(|d| d > now).unwrap_or(true));
        for fields in self.hashes.values_mut() {
            fields.retain(|_, (_, deadline)| deadline.map(|d| d > now).unwrap_or(true));
        }
    }
}

/// A [`KvStore`] held entirely in process memory.
///
/// Mirrors the store semantics the queue and leader election rely on:
/// TTLs (including per-hash-field idle TTLs), ordered multi-list blocking
/// pop, and atomic compare-and-delete. Clones share state.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
    /// Woken on every list push so blocked poppers re-check immediately.
    push_notify: Arc<Notify>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        inner.purge_expired();
        if inner.strings.contains_key(key) {
            return Ok(false);
        }
        inner
            .strings
            .insert(key.to_string(), (value.to_string(), Some(Instant::now() + ttl)));
        Ok(true)
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner
            .strings
            .insert(key.to_string(), (value.to_string(), Some(Instant::now() + ttl)));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut inner = self.inner.lock().await;
        inner.purge_expired();
        Ok(inner.strings.get(key).map(|(v, _)| v.clone()))
    }

    async fn compare_and_delete(&self, key: &str, expected_value: &str) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        inner.purge_expired();
        match inner.strings.get(key) {
            Some((v, _)) if v == expected_value => {
                inner.strings.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_right_push(&self, list_key: &str, item: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner
            .lists
            .entry(list_key.to_string())
            .or_default()
            .push_back(item.to_string());
        drop(inner);
        self.push_notify.notify_waiters();
        Ok(())
    }

    async fn list_block_pop_left_multi(
        &self,
        keys: &[String],
        timeout: Duration,
    ) -> Result<Option<(String, String)>> {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut inner = self.inner.lock().await;
                for key in keys {
                    if let Some(list) = inner.lists.get_mut(key) {
                        if let Some(item) = list.pop_front() {
                            return Ok(Some((key.clone(), item)));
                        }
                    }
                }
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            let _ = tokio::time::timeout(remaining, self.push_notify.notified()).await;
        }
    }

    async fn list_len(&self, list_key: &str) -> Result<u64> {
        let inner = self.inner.lock().await;
        Ok(inner.lists.get(list_key).map(|l| l.len() as u64).unwrap_or(0))
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner
            .hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), (value.to_string(), None));
        Ok(())
    }

    async fn hash_set_if_absent(&self, key: &str, field: &str, value: &str) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        inner.purge_expired();
        let fields = inner.hashes.entry(key.to_string()).or_default();
        if fields.contains_key(field) {
            return Ok(false);
        }
        fields.insert(field.to_string(), (value.to_string(), None));
        Ok(true)
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>> {
        let mut inner = self.inner.lock().await;
        inner.purge_expired();
        Ok(inner
            .hashes
            .get(key)
            .and_then(|fields| fields.get(field))
            .map(|(v, _)| v.clone()))
    }

    async fn hash_delete(&self, key: &str, field: &str) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        inner.purge_expired();
        Ok(inner
            .hashes
            .get_mut(key)
            .map(|fields| fields.remove(field).is_some())
            .unwrap_or(false))
    }

    async fn hash_increment(&self, key: &str, field: &str, delta: i64) -> Result<i64> {
        let mut inner = self.inner.lock().await;
        inner.purge_expired();
        let fields = inner.hashes.entry(key.to_string()).or_default();
        let current = fields
            .get(field)
            .and_then(|(v, _)| v.parse::<i64>().ok())
            .unwrap_or(0);
        let next = current + delta;
        fields.insert(field.to_string(), (next.to_string(), None));
        Ok(next)
    }

    async fn hash_len(&self, key: &str) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        inner.purge_expired();
        Ok(inner.hashes.get(key).map(|f| f.len() as u64).unwrap_or(0))
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>> {
        let mut inner = self.inner.lock().await;
        inner.purge_expired();
        Ok(inner
            .hashes
            .get(key)
            .map(|fields| {
                fields
                    .iter()
                    .map(|(f, (v, _))| (f.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn hash_field_expire(&self, key: &str, field: &str, ttl: Duration) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        inner.purge_expired();
        match inner.hashes.get_mut(key).and_then(|f| f.get_mut(field)) {
            Some((_, deadline)) => {
                *deadline = Some(Instant::now() + ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_if_absent_respects_existing() {
        let store = MemoryStore::new();
        assert!(store
            .set_if_absent("k", "a", Duration::from_secs(10))
            .await
            .unwrap());
        assert!(!store
            .set_if_absent("k", "b", Duration::from_secs(10))
            .await
            .unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn string_ttl_expires() {
        let store = MemoryStore::new();
        store
            .set_if_absent("k", "v", Duration::from_millis(50))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
        // Expired key can be re-created.
        assert!(store
            .set_if_absent("k", "v2", Duration::from_secs(10))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn compare_and_delete_checks_value() {
        let store = MemoryStore::new();
        store.set_with_ttl("k", "mine", Duration::from_secs(10)).await.unwrap();
        assert!(!store.compare_and_delete("k", "theirs").await.unwrap());
        assert!(store.compare_and_delete("k", "mine").await.unwrap());
        assert!(!store.compare_and_delete("k", "mine").await.unwrap());
    }

    #[tokio::test]
    async fn multi_pop_prefers_earlier_keys() {
        let store = MemoryStore::new();
        store.list_right_push("low", "l1").await.unwrap();
        store.list_right_push("high", "h1").await.unwrap();
        let keys = vec!["high".to_string(), "normal".to_string(), "low".to_string()];
        let (key, item) = store
            .list_block_pop_left_multi(&keys, Duration::from_millis(100))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(key, "high");
        assert_eq!(item, "h1");
    }

    #[tokio::test]
    async fn multi_pop_is_fifo_within_list() {
        let store = MemoryStore::new();
        store.list_right_push("q", "first").await.unwrap();
        store.list_right_push("q", "second").await.unwrap();
        let keys = vec!["q".to_string()];
        let (_, a) = store
            .list_block_pop_left_multi(&keys, Duration::from_millis(100))
            .await
            .unwrap()
            .unwrap();
        let (_, b) = store
            .list_block_pop_left_multi(&keys, Duration::from_millis(100))
            .await
            .unwrap()
            .unwrap();
        assert_eq!((a.as_str(), b.as_str()), ("first", "second"));
    }

    #[tokio::test]
    async fn multi_pop_times_out_empty() {
        let store = MemoryStore::new();
        let keys = vec!["empty".to_string()];
        let popped = store
            .list_block_pop_left_multi(&keys, Duration::from_millis(50))
            .await
            .unwrap();
        assert!(popped.is_none());
    }

    #[tokio::test]
    async fn blocked_pop_wakes_on_push() {
        let store = MemoryStore::new();
        let waiter = store.clone();
        let handle = tokio::spawn(async move {
            let keys = vec!["q".to_string()];
            waiter
                .list_block_pop_left_multi(&keys, Duration::from_secs(5))
                .await
                .unwrap()
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        store.list_right_push("q", "item").await.unwrap();
        let popped = handle.await.unwrap();
        assert_eq!(popped, Some(("q".to_string(), "item".to_string())));
    }

    #[tokio::test]
    async fn hash_ops() {
        let store = MemoryStore::new();
        assert!(store.hash_set_if_absent("h", "f", "v1").await.unwrap());
        assert!(!store.hash_set_if_absent("h", "f", "v2").await.unwrap());
        assert_eq!(store.hash_get("h", "f").await.unwrap().as_deref(), Some("v1"));
        store.hash_set("h", "f", "v3").await.unwrap();
        assert_eq!(store.hash_get("h", "f").await.unwrap().as_deref(), Some("v3"));
        assert_eq!(store.hash_len("h").await.unwrap(), 1);
        assert!(store.hash_delete("h", "f").await.unwrap());
        assert!(!store.hash_delete("h", "f").await.unwrap());
    }

    #[tokio::test]
    async fn hash_increment_from_absent() {
        let store = MemoryStore::new();
        assert_eq!(store.hash_increment("h", "n", 1).await.unwrap(), 1);
        assert_eq!(store.hash_increment("h", "n", 2).await.unwrap(), 3);
        assert_eq!(store.hash_increment("h", "n", -3).await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn hash_field_ttl_expires() {
        let store = MemoryStore::new();
        store.hash_set("h", "f", "v").await.unwrap();
        assert!(store
            .hash_field_expire("h", "f", Duration::from_millis(50))
            .await
            .unwrap());
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(store.hash_get("h", "f").await.unwrap(), None);
        // Absent field reports false.
        assert!(!store
            .hash_field_expire("h", "f", Duration::from_secs(1))
            .await
            .unwrap());
    }
}
