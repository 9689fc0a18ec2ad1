use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use wr_core::types::{Priority, WorkItem};
use wr_store::{KvStore, StoreError};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("work item codec: {0}")]
    Codec(String),
}

pub type Result<T> = std::result::Result<T, QueueError>;

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Tunables for dedup and the per-agent circuit breaker.
#[derive(Debug, Clone)]
pub struct WorkQueueConfig {
    /// Prefix for every key (`{prefix}:queue:high`, `{prefix}:active`, ...).
    pub key_prefix: String,
    /// Non-successful completions before backoff starts.
    pub max_failures: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    /// Idle TTL for `active` entries; covers runner crashes.
    pub claim_ttl: Duration,
}

impl Default for WorkQueueConfig {
    fn default() -> Self {
        Self {
            key_prefix: "work".into(),
            max_failures: 5,
            backoff_base: Duration::from_secs(60),
            backoff_cap: Duration::from_secs(3600),
            claim_ttl: Duration::from_secs(660),
        }
    }
}

/// Placeholder value held in `active` between enqueue and claim.
const PENDING_MARKER: &str = "pending";

// ---------------------------------------------------------------------------
// QueueDepths — narrow read-only view for metrics exporters
// ---------------------------------------------------------------------------

/// Depth gauges without the mutating queue surface. The coordinator's
/// metrics loop takes this rather than the full queue.
#[async_trait]
pub trait QueueDepths: Send + Sync {
    async fn depth(&self, priority: Priority) -> Result<u64>;
    async fn active_count(&self) -> Result<u64>;
    async fn backoff_count(&self) -> Result<u64>;
}

// ---------------------------------------------------------------------------
// WorkQueue
// ---------------------------------------------------------------------------

/// The shared work queue.
///
/// Invariant: for each agent, at most one work item is either in a queue
/// or recorded in the `active` hash, never both and never two. Enqueue
/// takes the `active` slot with HSETNX (the dedup guard); claim
/// overwrites the placeholder with the real claim id; complete releases
/// the slot and updates the failure/backoff state.
pub struct WorkQueue {
    store: Arc<dyn KvStore>,
    config: WorkQueueConfig,
    claim_nonce: AtomicU64,
}

impl WorkQueue {
    pub fn new(store: Arc<dyn KvStore>, config: WorkQueueConfig) -> Self {
        Self {
            store,
            config,
            claim_nonce: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &WorkQueueConfig {
        &self.config
    }

    fn queue_key(&self, priority: Priority) -> String {
        format!("{}:queue:{}", self.config.key_prefix, priority.queue_suffix())
    }

    fn active_key(&self) -> String {
        format!("{}:active", self.config.key_prefix)
    }

    fn failures_key(&self) -> String {
        format!("{}:failures", self.config.key_prefix)
    }

    fn backoff_key(&self) -> String {
        format!("{}:backoff", self.config.key_prefix)
    }

    fn queue_keys_in_claim_order(&self) -> Vec<String> {
        Priority::ALL.iter().map(|p| self.queue_key(*p)).collect()
    }

    /// Enqueue a work item unless the agent is backing off or already has
    /// an item in flight. Returns whether the item was actually pushed.
    ///
    /// `force` bypasses the backoff gate (operator action); it never
    /// bypasses the dedup guard and never clears the backoff deadline.
    pub async fn enqueue(&self, work: &WorkItem, force: bool) -> Result<bool> {
        let agent_id = work.agent_id.as_str();

        if !force {
            if let Some(until) = self.backoff_until(agent_id).await? {
                let now = chrono::Utc::now().timestamp();
                if until > now {
                    debug!(
                        agent_id,
                        backoff_until = until,
                        "enqueue rejected, agent backing off"
                    );
                    return Ok(false);
                }
            }
        }

        let created = self
            .store
            .hash_set_if_absent(&self.active_key(), agent_id, PENDING_MARKER)
            .await?;
        if !created {
            debug!(agent_id, event = "dedup_rejected", "agent already in flight");
            return Ok(false);
        }
        // The placeholder carries the same idle TTL as a real claim, so a
        // push that never gets claimed cannot wedge the agent forever.
        self.store
            .hash_field_expire(&self.active_key(), agent_id, self.config.claim_ttl)
            .await?;

        let encoded =
            serde_json::to_string(work).map_err(|e| QueueError::Codec(e.to_string()))?;
        self.store
            .list_right_push(&self.queue_key(work.priority), &encoded)
            .await?;
        debug!(
            agent_id,
            priority = %work.priority,
            task_type = %work.task_type,
            "work enqueued"
        );
        Ok(true)
    }

    /// Block until a work item is available on any queue (highest priority
    /// first) or the timeout elapses. On success the item's `claim_id` is
    /// stamped and the `active` entry is overwritten with it.
    pub async fn claim(&self, runner_id: &str, timeout: Duration) -> Result<Option<WorkItem>> {
        let keys = self.queue_keys_in_claim_order();
        let popped = self.store.list_block_pop_left_multi(&keys, timeout).await?;
        let Some((_, encoded)) = popped else {
            return Ok(None);
        };

        let mut work: WorkItem =
            serde_json::from_str(&encoded).map_err(|e| QueueError::Codec(e.to_string()))?;
        let nonce = self.claim_nonce.fetch_add(1, Ordering::Relaxed);
        let claim_id = format!("{runner_id}:{nonce}");
        work.claim_id = Some(claim_id.clone());

        self.store
            .hash_set(&self.active_key(), &work.agent_id, &claim_id)
            .await?;
        self.store
            .hash_field_expire(&self.active_key(), &work.agent_id, self.config.claim_ttl)
            .await?;

        info!(
            agent_id = %work.agent_id,
            claim_id = %claim_id,
            priority = %work.priority,
            event = "work_claimed",
            "work claimed"
        );
        Ok(Some(work))
    }

    /// Release the agent's active slot and update the circuit-breaker
    /// state: success resets the failure counter and clears any backoff;
    /// failure increments the counter and, at the threshold, arms an
    /// exponentially growing backoff deadline.
    pub async fn complete(&self, work: &WorkItem, success: bool) -> Result<()> {
        let agent_id = work.agent_id.as_str();
        self.store.hash_delete(&self.active_key(), agent_id).await?;

        if success {
            self.store
                .hash_set(&self.failures_key(), agent_id, "0")
                .await?;
            self.store.hash_delete(&self.backoff_key(), agent_id).await?;
            debug!(agent_id, "completed, failure counter reset");
            return Ok(());
        }

        let failures = self
            .store
            .hash_increment(&self.failures_key(), agent_id, 1)
            .await?;
        if failures >= self.config.max_failures as i64 {
            let backoff = self.backoff_for(failures as u32);
            let until = chrono::Utc::now().timestamp() + backoff.as_secs() as i64;
            self.store
                .hash_set(&self.backoff_key(), agent_id, &until.to_string())
                .await?;
            warn!(
                agent_id,
                failures,
                backoff_secs = backoff.as_secs(),
                event = "backoff_set",
                "agent backing off"
            );
        } else {
            debug!(agent_id, failures, "completed unsuccessfully");
        }
        Ok(())
    }

    /// Re-assert the claim's idle TTL while an activation is running, so
    /// only genuinely stale claims expire. Returns false when the entry is
    /// already gone (TTL elapsed or completed elsewhere).
    pub async fn refresh_claim(&self, agent_id: &str) -> Result<bool> {
        Ok(self
            .store
            .hash_field_expire(&self.active_key(), agent_id, self.config.claim_ttl)
            .await?)
    }

    /// Backoff deadline for an agent, as unix seconds.
    pub async fn backoff_until(&self, agent_id: &str) -> Result<Option<i64>> {
        let raw = self.store.hash_get(&self.backoff_key(), agent_id).await?;
        Ok(raw.and_then(|v| v.parse::<i64>().ok()))
    }

    /// Current failure count for an agent.
    pub async fn failures(&self, agent_id: &str) -> Result<u32> {
        let raw = self.store.hash_get(&self.failures_key(), agent_id).await?;
        Ok(raw.and_then(|v| v.parse::<u32>().ok()).unwrap_or(0))
    }

    /// The claim id currently occupying an agent's active slot, if any.
    pub async fn active_claim(&self, agent_id: &str) -> Result<Option<String>> {
        Ok(self.store.hash_get(&self.active_key(), agent_id).await?)
    }

    fn backoff_for(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(self.config.max_failures).min(20);
        let secs = self
            .config
            .backoff_base
            .as_secs()
            .saturating_mul(1u64 << exp);
        Duration::from_secs(secs.min(self.config.backoff_cap.as_secs()))
    }
}

#[async_trait]
impl QueueDepths for WorkQueue {
    async fn depth(&self, priority: Priority) -> Result<u64> {
        Ok(self.store.list_len(&self.queue_key(priority)).await?)
    }

    async fn active_count(&self) -> Result<u64> {
        Ok(self.store.hash_len(&self.active_key()).await?)
    }

    async fn backoff_count(&self) -> Result<u64> {
        // Only deadlines still in the future count as backing off.
        let now = chrono::Utc::now().timestamp();
        let all = self.store.hash_get_all(&self.backoff_key()).await?;
        Ok(all
            .values()
            .filter_map(|v| v.parse::<i64>().ok())
            .filter(|until| *until > now)
            .count() as u64)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
