use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use reqwest::Method;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::types::{
    AgentWithWork, BudgetHealth, ConsumptionReport, Notification, Post, StaleAgent,
};

/// Responses larger than this are rejected rather than buffered.
const MAX_BODY_BYTES: usize = 1024 * 1024;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("hub unreachable: {0}")]
    Network(String),
    #[error("hub request timed out")]
    Timeout,
    #[error("hub returned {status}: {message}")]
    Status { status: u16, message: String },
    #[error("hub response exceeded {MAX_BODY_BYTES} bytes")]
    BodyTooLarge,
    #[error("hub response decode: {0}")]
    Decode(String),
}

impl HubError {
    /// Network failures and 5xx answers are worth retrying; 4xx never.
    pub fn is_retryable(&self) -> bool {
        match self {
            HubError::Network(_) | HubError::Timeout => true,
            HubError::Status { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, HubError>;

// ---------------------------------------------------------------------------
// HubApi — the seam the coordinator, runner, and agent loop consume
// ---------------------------------------------------------------------------

#[async_trait]
pub trait HubApi: Send + Sync {
    /// Long-poll for agents with unread notifications.
    async fn poll_agents_with_work(
        &self,
        timeout: Duration,
        batch_size: u32,
    ) -> Result<Vec<AgentWithWork>>;

    /// Agents whose last activation is older than `min_staleness`.
    async fn stale_agents(&self, min_staleness: Duration) -> Result<Vec<StaleAgent>>;

    /// Record that an agent was just activated.
    async fn mark_activated(&self, agent_id: &str) -> Result<()>;

    async fn get_thread(&self, post_id: &str) -> Result<Post>;

    async fn create_post(&self, agent_id: &str, content: &str) -> Result<Post>;

    async fn create_comment(&self, post_id: &str, agent_id: &str, content: &str) -> Result<Post>;

    async fn unread_notifications(&self, agent_id: &str) -> Result<Vec<Notification>>;

    async fn mark_notifications_read(&self, ids: &[String]) -> Result<()>;

    async fn search(&self, query: &str) -> Result<Vec<Post>>;

    async fn discover_feed(&self, agent_id: &str) -> Result<Vec<Post>>;

    async fn budget_health(&self, agent_id: &str) -> Result<BudgetHealth>;

    async fn report_consumption(&self, report: &ConsumptionReport) -> Result<()>;
}

// ---------------------------------------------------------------------------
// HubClient
// ---------------------------------------------------------------------------

/// Connection-pooled HTTP client for the upstream hub.
///
/// Every call retries up to `max_retries` times with exponential backoff
/// and jitter on network errors and 5xx; 4xx answers surface immediately.
pub struct HubClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    max_retries: u32,
}

impl HubClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        request_timeout: Duration,
        max_retries: u32,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| HubError::Network(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            max_retries,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&serde_json::Value>,
    ) -> Result<Vec<u8>> {
        let mut attempt = 0u32;
        loop {
            let mut req = self
                .http
                .request(method.clone(), self.url(path))
                .bearer_auth(&self.api_key);
            if !query.is_empty() {
                req = req.query(query);
            }
            if let Some(b) = body {
                req = req.json(b);
            }

            let outcome = match req.send().await {
                Ok(resp) => Self::read_response(resp).await,
                Err(e) if e.is_timeout() => Err(HubError::Timeout),
                Err(e) => Err(HubError::Network(e.to_string())),
            };

            match outcome {
                Ok(bytes) => return Ok(bytes),
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    attempt += 1;
                    let delay = retry_delay(attempt);
                    warn!(path, attempt, error = %e, "hub request failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn read_response(resp: reqwest::Response) -> Result<Vec<u8>> {
        let status = resp.status();
        if let Some(len) = resp.content_length() {
            if len as usize > MAX_BODY_BYTES {
                return Err(HubError::BodyTooLarge);
            }
        }
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| HubError::Network(e.to_string()))?;
        if bytes.len() > MAX_BODY_BYTES {
            return Err(HubError::BodyTooLarge);
        }
        if !status.is_success() {
            return Err(HubError::Status {
                status: status.as_u16(),
                message: String::from_utf8_lossy(&bytes).into_owned(),
            });
        }
        Ok(bytes.to_vec())
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T> {
        let bytes = self.send(Method::GET, path, query, None).await?;
        serde_json::from_slice(&bytes).map_err(|e| HubError::Decode(e.to_string()))
    }

    async fn post_json<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<T> {
        let bytes = self.send(Method::POST, path, &[], Some(body)).await?;
        serde_json::from_slice(&bytes).map_err(|e| HubError::Decode(e.to_string()))
    }

    async fn post_unit(&self, path: &str, body: &serde_json::Value) -> Result<()> {
        self.send(Method::POST, path, &[], Some(body)).await?;
        Ok(())
    }
}

/// Exponential backoff with up to +50% jitter, capped at 5 s.
fn retry_delay(attempt: u32) -> Duration {
    let base = Duration::from_millis(250)
        .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
        .min(Duration::from_secs(5));
    let jitter = rand::thread_rng().gen_range(0..=base.as_millis() as u64 / 2);
    base + Duration::from_millis(jitter)
}

#[async_trait]
impl HubApi for HubClient {
    async fn poll_agents_with_work(
        &self,
        timeout: Duration,
        batch_size: u32,
    ) -> Result<Vec<AgentWithWork>> {
        let query = [
            ("timeout", timeout.as_secs().to_string()),
            ("batch_size", batch_size.to_string()),
        ];
        match self.get_json("/notifications/poll", &query).await {
            Ok(agents) => Ok(agents),
            // Older hubs lack the poll endpoint; fall back to the agent list.
            Err(HubError::Status { status: 404, .. }) => {
                debug!("poll endpoint missing, falling back to agent listing");
                self.get_json(
                    "/agents",
                    &[("has_notifications", "true".to_string())],
                )
                .await
            }
            Err(e) => Err(e),
        }
    }

    async fn stale_agents(&self, min_staleness: Duration) -> Result<Vec<StaleAgent>> {
        self.get_json(
            "/agents",
            &[
                ("stale", "true".to_string()),
                ("min_staleness", min_staleness.as_secs().to_string()),
            ],
        )
        .await
    }

    async fn mark_activated(&self, agent_id: &str) -> Result<()> {
        self.post_unit(
            &format!("/agents/{agent_id}/activated"),
            &serde_json::json!({}),
        )
        .await
    }

    async fn get_thread(&self, post_id: &str) -> Result<Post> {
        self.get_json(
            &format!("/posts/{post_id}"),
            &[("include_comments", "true".to_string())],
        )
        .await
    }

    async fn create_post(&self, agent_id: &str, content: &str) -> Result<Post> {
        self.post_json(
            "/posts",
            &serde_json::json!({ "agent_id": agent_id, "content": content }),
        )
        .await
    }

    async fn create_comment(&self, post_id: &str, agent_id: &str, content: &str) -> Result<Post> {
        self.post_json(
            &format!("/posts/{post_id}/comments"),
            &serde_json::json!({ "agent_id": agent_id, "content": content }),
        )
        .await
    }

    async fn unread_notifications(&self, agent_id: &str) -> Result<Vec<Notification>> {
        self.get_json(
            "/notifications",
            &[
                ("agent_id", agent_id.to_string()),
                ("unread", "true".to_string()),
            ],
        )
        .await
    }

    async fn mark_notifications_read(&self, ids: &[String]) -> Result<()> {
        self.post_unit("/notifications/read", &serde_json::json!({ "ids": ids }))
            .await
    }

    async fn search(&self, query: &str) -> Result<Vec<Post>> {
        self.get_json("/search", &[("q", query.to_string())]).await
    }

    async fn discover_feed(&self, agent_id: &str) -> Result<Vec<Post>> {
        self.get_json("/feed/discover", &[("agent_id", agent_id.to_string())])
            .await
    }

    async fn budget_health(&self, agent_id: &str) -> Result<BudgetHealth> {
        self.get_json(
            "/system/budget-health",
            &[("agent_id", agent_id.to_string())],
        )
        .await
    }

    async fn report_consumption(&self, report: &ConsumptionReport) -> Result<()> {
        let body = serde_json::to_value(report).map_err(|e| HubError::Decode(e.to_string()))?;
        self.post_unit("/system/consumption", &body).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(HubError::Network("refused".into()).is_retryable());
        assert!(HubError::Timeout.is_retryable());
        assert!(HubError::Status {
            status: 503,
            message: String::new()
        }
        .is_retryable());
        assert!(!HubError::Status {
            status: 404,
            message: String::new()
        }
        .is_retryable());
        assert!(!HubError::Decode("bad".into()).is_retryable());
    }

    #[test]
    fn retry_delay_grows() {
        let d1 = retry_delay(1);
        let d3 = retry_delay(3);
        assert!(d1 >= Duration::from_millis(250));
        assert!(d3 >= Duration::from_millis(1000));
        assert!(retry_delay(10) <= Duration::from_millis(7500));
    }

    #[test]
    fn base_url_trailing_slash_trimmed() {
        let client = HubClient::new(
            "http://hub.local/",
            "key",
            Duration::from_secs(5),
            3,
        )
        .unwrap();
        assert_eq!(client.url("/posts"), "http://hub.local/posts");
    }
}
