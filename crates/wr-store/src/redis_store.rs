use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use redis::aio::ConnectionManager;
use redis::{FromRedisValue, Script};
use tracing::{debug, warn};

use crate::store::{KvStore, Result, StoreError};

/// Compare-and-delete as a server-side script; Redis has no native
/// primitive for it.
const CAS_DELETE: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
else
    return 0
end
"#;

// ---------------------------------------------------------------------------
// RetryPolicy
// ---------------------------------------------------------------------------

/// Exponential backoff with jitter for connection-level failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry `attempt` (1-based), jittered up to +50%.
    fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
            .min(self.max_delay);
        let jitter_ms = rand::thread_rng().gen_range(0..=exp.as_millis() as u64 / 2);
        exp + Duration::from_millis(jitter_ms)
    }
}

// ---------------------------------------------------------------------------
// RedisStore
// ---------------------------------------------------------------------------

/// [`KvStore`] over a Redis connection manager.
///
/// The manager multiplexes one connection and reconnects on its own; the
/// retry policy here covers the window where a command fails mid-flight.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    cas_delete: Script,
    retry: RetryPolicy,
}

impl RedisStore {
    /// Connect to the given URL (e.g. `redis://127.0.0.1:6379`).
    pub async fn connect(url: &str) -> Result<Self> {
        let client =
            redis::Client::open(url).map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        debug!(url, "connected to store");
        Ok(Self {
            conn,
            cas_delete: Script::new(CAS_DELETE),
            retry: RetryPolicy::default(),
        })
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn is_retryable(e: &redis::RedisError) -> bool {
        e.is_io_error()
            || e.is_timeout()
            || e.is_connection_refusal()
            || e.is_connection_dropped()
    }

    fn map_err(e: redis::RedisError) -> StoreError {
        if Self::is_retryable(&e) {
            StoreError::Unavailable(e.to_string())
        } else {
            StoreError::UnexpectedReply(e.to_string())
        }
    }

    /// Run a command with connection-failure retries.
    async fn query<T: FromRedisValue>(&self, cmd: &redis::Cmd) -> Result<T> {
        let mut attempt = 0u32;
        loop {
            let mut conn = self.conn.clone();
            let result: redis::RedisResult<T> = cmd.query_async(&mut conn).await;
            match result {
                Ok(v) => return Ok(v),
                Err(e) if Self::is_retryable(&e) && attempt < self.retry.max_retries => {
                    attempt += 1;
                    let delay = self.retry.delay_for(attempt);
                    warn!(attempt, error = %e, "store command failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(Self::map_err(e)),
            }
        }
    }

    fn ttl_secs(ttl: Duration) -> u64 {
        ttl.as_secs().max(1)
    }
}

#[async_trait]
impl KvStore for RedisStore {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(Self::ttl_secs(ttl));
        let reply: Option<String> = self.query(&cmd).await?;
        Ok(reply.is_some())
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("EX").arg(Self::ttl_secs(ttl));
        let _: () = self.query(&cmd).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut cmd = redis::cmd("GET");
        cmd.arg(key);
        self.query(&cmd).await
    }

    async fn compare_and_delete(&self, key: &str, expected_value: &str) -> Result<bool> {
        let mut attempt = 0u32;
        loop {
            let mut conn = self.conn.clone();
            let result: redis::RedisResult<i64> = self
                .cas_delete
                .key(key)
                .arg(expected_value)
                .invoke_async(&mut conn)
                .await;
            match result {
                Ok(deleted) => return Ok(deleted == 1),
                Err(e) if Self::is_retryable(&e) && attempt < self.retry.max_retries => {
                    attempt += 1;
                    let delay = self.retry.delay_for(attempt);
                    warn!(attempt, error = %e, "compare-and-delete failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(Self::map_err(e)),
            }
        }
    }

    async fn list_right_push(&self, list_key: &str, item: &str) -> Result<()> {
        let mut cmd = redis::cmd("RPUSH");
        cmd.arg(list_key).arg(item);
        let _: i64 = self.query(&cmd).await?;
        Ok(())
    }

    async fn list_block_pop_left_multi(
        &self,
        keys: &[String],
        timeout: Duration,
    ) -> Result<Option<(String, String)>> {
        // BLPOP checks keys in argument order on every wake-up, which is
        // what gives HIGH strict preference over NORMAL over LOW.
        let mut cmd = redis::cmd("BLPOP");
        for key in keys {
            cmd.arg(key);
        }
        cmd.arg(timeout.as_secs_f64());
        self.query(&cmd).await
    }

    async fn list_len(&self, list_key: &str) -> Result<u64> {
        let mut cmd = redis::cmd("LLEN");
        cmd.arg(list_key);
        self.query(&cmd).await
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let mut cmd = redis::cmd("HSET");
        cmd.arg(key).arg(field).arg(value);
        let _: i64 = self.query(&cmd).await?;
        Ok(())
    }

    async fn hash_set_if_absent(&self, key: &str, field: &str, value: &str) -> Result<bool> {
        let mut cmd = redis::cmd("HSETNX");
        cmd.arg(key).arg(field).arg(value);
        let created: i64 = self.query(&cmd).await?;
        Ok(created == 1)
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>> {
        let mut cmd = redis::cmd("HGET");
        cmd.arg(key).arg(field);
        self.query(&cmd).await
    }

    async fn hash_delete(&self, key: &str, field: &str) -> Result<bool> {
        let mut cmd = redis::cmd("HDEL");
        cmd.arg(key).arg(field);
        let removed: i64 = self.query(&cmd).await?;
        Ok(removed == 1)
    }

    async fn hash_increment(&self, key: &str, field: &str, delta: i64) -> Result<i64> {
        let mut cmd = redis::cmd("HINCRBY");
        cmd.arg(key).arg(field).arg(delta);
        self.query(&cmd).await
    }

    async fn hash_len(&self, key: &str) -> Result<u64> {
        let mut cmd = redis::cmd("HLEN");
        cmd.arg(key);
        self.query(&cmd).await
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>> {
        let mut cmd = redis::cmd("HGETALL");
        cmd.arg(key);
        self.query(&cmd).await
    }

    async fn hash_field_expire(&self, key: &str, field: &str, ttl: Duration) -> Result<bool> {
        // HEXPIRE (Redis >= 7.4) returns one status per field:
        // 1 = TTL set, 0 = condition not met, -2 = no such field.
        let mut cmd = redis::cmd("HEXPIRE");
        cmd.arg(key)
            .arg(Self::ttl_secs(ttl))
            .arg("FIELDS")
            .arg(1)
            .arg(field);
        let statuses: Vec<i64> = self.query(&cmd).await?;
        Ok(statuses.first().copied() == Some(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delay_grows_and_caps() {
        let policy = RetryPolicy::default();
        let d1 = policy.delay_for(1);
        let d3 = policy.delay_for(3);
        assert!(d1 >= Duration::from_millis(100));
        assert!(d3 >= Duration::from_millis(400));
        // Cap plus at most 50% jitter.
        assert!(policy.delay_for(10) <= Duration::from_secs(3));
    }

    #[test]
    fn ttl_never_rounds_to_zero() {
        assert_eq!(RedisStore::ttl_secs(Duration::from_millis(10)), 1);
        assert_eq!(RedisStore::ttl_secs(Duration::from_secs(30)), 30);
    }
}
