use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The store could not be reached after retries.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// The store answered with something the client cannot interpret.
    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

// ---------------------------------------------------------------------------
// KvStore
// ---------------------------------------------------------------------------

/// Thin typed interface over a Redis-compatible key/value store.
///
/// Every method maps to one atomic store operation; the caller composes
/// invariants out of these primitives and never needs transactions. All
/// errors surface as [`StoreError::Unavailable`] and are retryable from
/// the caller's perspective.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Atomic SETNX-with-TTL. Returns true when the key was created.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Unconditional set, refreshing the TTL.
    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Atomically delete `key` only when it currently holds
    /// `expected_value`. Returns true when a deletion happened.
    async fn compare_and_delete(&self, key: &str, expected_value: &str) -> Result<bool>;

    async fn list_right_push(&self, list_key: &str, item: &str) -> Result<()>;

    /// Blocking left-pop across several lists. Keys are checked in the
    /// given order on every wake-up, so earlier lists are always drained
    /// first. Returns the source key and the popped item, or `None` on
    /// timeout.
    async fn list_block_pop_left_multi(
        &self,
        keys: &[String],
        timeout: Duration,
    ) -> Result<Option<(String, String)>>;

    async fn list_len(&self, list_key: &str) -> Result<u64>;

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<()>;

    /// HSETNX. Returns true when the field was created.
    async fn hash_set_if_absent(&self, key: &str, field: &str, value: &str) -> Result<bool>;

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>>;

    /// Returns true when the field existed.
    async fn hash_delete(&self, key: &str, field: &str) -> Result<bool>;

    async fn hash_increment(&self, key: &str, field: &str, delta: i64) -> Result<i64>;

    async fn hash_len(&self, key: &str) -> Result<u64>;

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>>;

    /// Per-field idle TTL (HEXPIRE). Returns true when the field existed.
    async fn hash_field_expire(&self, key: &str, field: &str, ttl: Duration) -> Result<bool>;
}
