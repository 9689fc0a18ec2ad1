use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use lru::LruCache;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use wr_core::config_source::ConfigSource;
use wr_core::types::AgentConfig;
use wr_store::KvStore;

/// In-process tier capacity.
const LOCAL_CAPACITY: usize = 256;
/// How long a failed load suppresses further attempts.
const NEGATIVE_TTL: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigCacheError {
    #[error("config unavailable for {agent_id}: {message}")]
    Unavailable { agent_id: String, message: String },
}

pub type Result<T> = std::result::Result<T, ConfigCacheError>;

// ---------------------------------------------------------------------------
// ConfigCache
// ---------------------------------------------------------------------------

enum LocalEntry {
    /// A loaded config, valid until the deadline.
    Loaded(Arc<AgentConfig>, Instant),
    /// A recent load failure; retried only after the deadline.
    Negative(Instant),
}

/// Read-through, two-tier agent-config cache.
///
/// Tier one is a bounded in-process LRU; tier two is the shared store
/// (`config:{agent_id}`, TTL equal to the config's own `cache_ttl`).
/// Store-tier failures degrade to the source rather than failing the
/// lookup; source failures arm a short negative cache so a missing
/// config cannot stampede the source.
pub struct ConfigCache {
    local: Mutex<LruCache<String, LocalEntry>>,
    store: Arc<dyn KvStore>,
    source: Arc<dyn ConfigSource>,
    key_prefix: String,
}

impl ConfigCache {
    pub fn new(
        store: Arc<dyn KvStore>,
        source: Arc<dyn ConfigSource>,
        key_prefix: impl Into<String>,
    ) -> Self {
        Self {
            local: Mutex::new(LruCache::new(
                NonZeroUsize::new(LOCAL_CAPACITY).expect("nonzero capacity"),
            )),
            store,
            source,
            key_prefix: key_prefix.into(),
        }
    }

    fn store_key(&self, agent_id: &str) -> String {
        format!("{}:{agent_id}", self.key_prefix)
    }

    pub async fn get_or_load(&self, agent_id: &str) -> Result<Arc<AgentConfig>> {
        let now = Instant::now();

        {
            let mut local = self.local.lock().await;
            match local.get(agent_id) {
                Some(LocalEntry::Loaded(config, valid_until)) if *valid_until > now => {
                    return Ok(config.clone());
                }
                Some(LocalEntry::Negative(until)) if *until > now => {
                    return Err(ConfigCacheError::Unavailable {
                        agent_id: agent_id.to_string(),
                        message: "recent load failure (negative cache)".into(),
                    });
                }
                _ => {}
            }
        }

        // Distributed tier; failures here degrade to the source.
        match self.store.get(&self.store_key(agent_id)).await {
            Ok(Some(raw)) => match serde_json::from_str::<AgentConfig>(&raw) {
                Ok(config) => {
                    debug!(agent_id, "config served from store tier");
                    return Ok(self.remember(agent_id, config).await);
                }
                Err(e) => warn!(agent_id, error = %e, "store-tier config is corrupt, reloading"),
            },
            Ok(None) => {}
            Err(e) => warn!(agent_id, error = %e, "store tier unavailable for config read"),
        }

        match self.source.load(agent_id).await {
            Ok(config) => {
                if let Ok(encoded) = serde_json::to_string(&config) {
                    let ttl = Duration::from_secs(config.cache_ttl.max(1));
                    if let Err(e) = self
                        .store
                        .set_with_ttl(&self.store_key(agent_id), &encoded, ttl)
                        .await
                    {
                        warn!(agent_id, error = %e, "failed to populate store tier");
                    }
                }
                Ok(self.remember(agent_id, config).await)
            }
            Err(e) => {
                warn!(agent_id, error = %e, "config load failed, arming negative cache");
                let mut local = self.local.lock().await;
                local.put(
                    agent_id.to_string(),
                    LocalEntry::Negative(now + NEGATIVE_TTL),
                );
                Err(ConfigCacheError::Unavailable {
                    agent_id: agent_id.to_string(),
                    message: e.to_string(),
                })
            }
        }
    }

    async fn remember(&self, agent_id: &str, config: AgentConfig) -> Arc<AgentConfig> {
        let ttl = Duration::from_secs(config.cache_ttl.max(1));
        let config = Arc::new(config);
        let mut local = self.local.lock().await;
        local.put(
            agent_id.to_string(),
            LocalEntry::Loaded(config.clone(), Instant::now() + ttl),
        );
        config
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use wr_core::config_source::{ConfigSourceError, Result as SourceResult};
    use wr_store::MemoryStore;

    struct CountingSource {
        loads: AtomicU32,
        fail: bool,
        cache_ttl: u64,
    }

    impl CountingSource {
        fn new(cache_ttl: u64) -> Self {
            Self {
                loads: AtomicU32::new(0),
                fail: false,
                cache_ttl,
            }
        }

        fn failing() -> Self {
            Self {
                loads: AtomicU32::new(0),
                fail: true,
                cache_ttl: 60,
            }
        }

        fn load_count(&self) -> u32 {
            self.loads.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ConfigSource for CountingSource {
        async fn load(&self, agent_id: &str) -> SourceResult<AgentConfig> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ConfigSourceError::NotFound(agent_id.to_string()));
            }
            let mut config = AgentConfig {
                agent_type: "social".into(),
                behavior: Default::default(),
                capabilities: Default::default(),
                brain: Default::default(),
                cache_ttl: self.cache_ttl,
                system_prompt: format!("agent {agent_id}"),
            };
            config.behavior.max_iterations = 7;
            Ok(config)
        }
    }

    fn cache(source: Arc<CountingSource>) -> (ConfigCache, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (
            ConfigCache::new(store.clone(), source, "config"),
            store,
        )
    }

    #[tokio::test]
    async fn load_populates_both_tiers() {
        let source = Arc::new(CountingSource::new(300));
        let (cache, store) = cache(source.clone());

        let config = cache.get_or_load("alice").await.unwrap();
        assert_eq!(config.behavior.max_iterations, 7);
        assert_eq!(source.load_count(), 1);

        // Distributed tier was written.
        assert!(store.get("config:alice").await.unwrap().is_some());

        // Second read hits the local tier.
        cache.get_or_load("alice").await.unwrap();
        assert_eq!(source.load_count(), 1);
    }

    #[tokio::test]
    async fn store_tier_serves_without_source() {
        let source = Arc::new(CountingSource::new(300));
        let store = Arc::new(MemoryStore::new());
        let warm = ConfigCache::new(store.clone(), source.clone(), "config");
        warm.get_or_load("alice").await.unwrap();
        assert_eq!(source.load_count(), 1);

        // A second cache (fresh process) with a failing source still
        // serves from the store tier.
        let cold_source = Arc::new(CountingSource::failing());
        let cold = ConfigCache::new(store, cold_source.clone(), "config");
        let config = cold.get_or_load("alice").await.unwrap();
        assert_eq!(config.behavior.max_iterations, 7);
        assert_eq!(cold_source.load_count(), 0);
    }

    #[tokio::test]
    async fn failure_arms_negative_cache() {
        let source = Arc::new(CountingSource::failing());
        let (cache, _) = cache(source.clone());

        assert!(cache.get_or_load("ghost").await.is_err());
        assert_eq!(source.load_count(), 1);

        // Within the negative window, the source is not consulted again.
        assert!(cache.get_or_load("ghost").await.is_err());
        assert_eq!(source.load_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn negative_cache_expires() {
        let source = Arc::new(CountingSource::failing());
        let (cache, _) = cache(source.clone());

        assert!(cache.get_or_load("ghost").await.is_err());
        tokio::time::sleep(NEGATIVE_TTL + Duration::from_secs(1)).await;
        assert!(cache.get_or_load("ghost").await.is_err());
        assert_eq!(source.load_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn local_entry_expires_with_config_ttl() {
        let source = Arc::new(CountingSource::new(1));
        let store = Arc::new(MemoryStore::new());
        let cache = ConfigCache::new(store.clone(), source.clone(), "config");

        cache.get_or_load("alice").await.unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        // Local and store tiers both expired; source is reloaded.
        cache.get_or_load("alice").await.unwrap();
        assert_eq!(source.load_count(), 2);
    }
}
