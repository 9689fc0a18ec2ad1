use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use wr_store::{KvStore, Result as StoreResult};

/// The single global leadership record.
const LEADER_KEY: &str = "leader:coordinator";

// ---------------------------------------------------------------------------
// LeaderElector
// ---------------------------------------------------------------------------

/// Single-key TTL leadership.
///
/// The store holds the truth (`leader:coordinator` → instance id, with a
/// TTL); `is_leader()` is a cached boolean refreshed on each heartbeat
/// tick and may be stale by up to one heartbeat interval. Callers that
/// need strict freshness must re-check the store. Failover after a
/// silent leader death takes at most the TTL.
pub struct LeaderElector {
    store: Arc<dyn KvStore>,
    instance_id: String,
    ttl: Duration,
    leading: Arc<AtomicBool>,
}

impl LeaderElector {
    pub fn new(store: Arc<dyn KvStore>, instance_id: impl Into<String>, ttl: Duration) -> Self {
        Self {
            store,
            instance_id: instance_id.into(),
            ttl,
            leading: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Cached leadership flag; stale by at most one heartbeat interval.
    pub fn is_leader(&self) -> bool {
        self.leading.load(Ordering::Relaxed)
    }

    /// Shared flag for the health endpoint.
    pub fn leader_flag(&self) -> Arc<AtomicBool> {
        self.leading.clone()
    }

    /// One heartbeat tick: acquire the lock if free, or refresh the TTL
    /// if we already hold it. Updates the cached flag and returns the
    /// fresh leadership state.
    pub async fn try_become_leader(&self) -> StoreResult<bool> {
        let was_leading = self.is_leader();

        let acquired = self
            .store
            .set_if_absent(LEADER_KEY, &self.instance_id, self.ttl)
            .await?;
        let leading = if acquired {
            true
        } else {
            // The key exists. If it is ours (a previous refresh created
            // it), extend the TTL; otherwise someone else leads.
            match self.store.get(LEADER_KEY).await? {
                Some(holder) if holder == self.instance_id => {
                    self.store
                        .set_with_ttl(LEADER_KEY, &self.instance_id, self.ttl)
                        .await?;
                    true
                }
                _ => false,
            }
        };

        self.leading.store(leading, Ordering::Relaxed);
        match (was_leading, leading) {
            (false, true) => {
                info!(instance_id = %self.instance_id, event = "became_leader", "became leader")
            }
            (true, false) => {
                warn!(instance_id = %self.instance_id, event = "lost_leadership", "lost leadership")
            }
            _ => {}
        }
        Ok(leading)
    }

    /// Graceful release: delete the record only if it is still ours.
    /// Idempotent.
    pub async fn release(&self) -> StoreResult<()> {
        let deleted = self
            .store
            .compare_and_delete(LEADER_KEY, &self.instance_id)
            .await?;
        if deleted {
            info!(instance_id = %self.instance_id, "leadership released");
        } else {
            debug!(instance_id = %self.instance_id, "nothing to release");
        }
        self.leading.store(false, Ordering::Relaxed);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
