use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Top-level configuration shared by the coordinator and runner binaries.
///
/// Loaded from a TOML file when one exists, then overridden by the
/// environment (`REDIS_URL`, `HUB_URL`, `HUB_API_KEY`, `INSTANCE_ID`,
/// `AGENT_CONFIG_DIR`). Every tunable has a default matching the
/// operator-facing documentation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub hub: HubConfig,
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub runner: RunnerConfig,
    #[serde(default)]
    pub agent: AgentLoopConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            hub: HubConfig::default(),
            coordinator: CoordinatorConfig::default(),
            queue: QueueConfig::default(),
            runner: RunnerConfig::default(),
            agent: AgentLoopConfig::default(),
        }
    }
}

impl Config {
    /// Load from a TOML file, falling back to defaults when it does not
    /// exist, then apply environment overrides.
    pub fn load(path: Option<&std::path::Path>) -> Result<Self, ConfigError> {
        let mut cfg = match path {
            Some(p) if p.exists() => Self::load_from(p)?,
            _ => Config::default(),
        };
        cfg.apply_env();
        Ok(cfg)
    }

    /// Load from a specific TOML path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text =
            std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Apply environment variable overrides onto this config.
    pub fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("REDIS_URL") {
            self.store.url = url;
        }
        if let Ok(url) = std::env::var("HUB_URL") {
            self.hub.base_url = url;
        }
        if let Ok(key) = std::env::var("HUB_API_KEY") {
            self.hub.api_key = key;
        }
        if let Ok(dir) = std::env::var("AGENT_CONFIG_DIR") {
            self.runner.agent_config_dir = dir;
        }
    }

    /// Resolve the instance id: `INSTANCE_ID`, else hostname, else a uuid.
    pub fn instance_id() -> String {
        if let Ok(id) = std::env::var("INSTANCE_ID") {
            if !id.is_empty() {
                return id;
            }
        }
        std::env::var("HOSTNAME")
            .ok()
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| format!("instance-{}", uuid::Uuid::new_v4()))
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_url")]
    pub url: String,
    /// Prefix for every key the core writes (`work:queue:high`, ...).
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    /// Consecutive connection-failure window before the process exits
    /// non-zero to be restarted.
    #[serde(default = "default_store_fail_secs")]
    pub failure_exit_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: default_store_url(),
            key_prefix: default_key_prefix(),
            failure_exit_secs: default_store_fail_secs(),
        }
    }
}

fn default_store_url() -> String {
    "redis://127.0.0.1:6379".into()
}
fn default_key_prefix() -> String {
    "work".into()
}
fn default_store_fail_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    #[serde(default = "default_hub_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_hub_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_hub_retries")]
    pub max_retries: u32,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            base_url: default_hub_url(),
            api_key: String::new(),
            request_timeout_secs: default_hub_timeout(),
            max_retries: default_hub_retries(),
        }
    }
}

fn default_hub_url() -> String {
    "http://127.0.0.1:8080".into()
}
fn default_hub_timeout() -> u64 {
    35
}
fn default_hub_retries() -> u32 {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Inbox poll cadence; jittered ±20% at runtime.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_min_staleness")]
    pub min_staleness_secs: u64,
    #[serde(default = "default_poll_batch")]
    pub poll_batch_size: u32,
    #[serde(default = "default_leader_ttl")]
    pub leader_ttl_secs: u64,
    #[serde(default = "default_leader_heartbeat")]
    pub leader_heartbeat_secs: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            sweep_interval_secs: default_sweep_interval(),
            min_staleness_secs: default_min_staleness(),
            poll_batch_size: default_poll_batch(),
            leader_ttl_secs: default_leader_ttl(),
            leader_heartbeat_secs: default_leader_heartbeat(),
        }
    }
}

fn default_poll_interval() -> u64 {
    30
}
fn default_sweep_interval() -> u64 {
    60
}
fn default_min_staleness() -> u64 {
    900
}
fn default_poll_batch() -> u32 {
    100
}
fn default_leader_ttl() -> u64 {
    30
}
fn default_leader_heartbeat() -> u64 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Non-successful completions before backoff starts.
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,
    #[serde(default = "default_backoff_base")]
    pub backoff_base_secs: u64,
    #[serde(default = "default_backoff_cap")]
    pub backoff_cap_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_failures: default_max_failures(),
            backoff_base_secs: default_backoff_base(),
            backoff_cap_secs: default_backoff_cap(),
        }
    }
}

fn default_max_failures() -> u32 {
    5
}
fn default_backoff_base() -> u64 {
    60
}
fn default_backoff_cap() -> u64 {
    3600
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    #[serde(default = "default_claim_timeout")]
    pub claim_timeout_secs: u64,
    #[serde(default = "default_activation_timeout")]
    pub activation_timeout_secs: u64,
    /// Added to the activation timeout for the claim's idle TTL, so only
    /// genuinely stale claims expire.
    #[serde(default = "default_claim_grace")]
    pub claim_grace_secs: u64,
    #[serde(default = "default_runner_heartbeat")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: u32,
    #[serde(default = "default_workspace_root")]
    pub workspace_root: String,
    #[serde(default = "default_agent_config_dir")]
    pub agent_config_dir: String,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            claim_timeout_secs: default_claim_timeout(),
            activation_timeout_secs: default_activation_timeout(),
            claim_grace_secs: default_claim_grace(),
            heartbeat_interval_secs: default_runner_heartbeat(),
            max_in_flight: default_max_in_flight(),
            workspace_root: default_workspace_root(),
            agent_config_dir: default_agent_config_dir(),
        }
    }
}

impl RunnerConfig {
    /// Idle TTL applied to `active_task` entries.
    pub fn claim_ttl_secs(&self) -> u64 {
        self.activation_timeout_secs + self.claim_grace_secs
    }
}

fn default_claim_timeout() -> u64 {
    30
}
fn default_activation_timeout() -> u64 {
    600
}
fn default_claim_grace() -> u64 {
    60
}
fn default_runner_heartbeat() -> u64 {
    15
}
fn default_max_in_flight() -> u32 {
    1
}
fn default_workspace_root() -> String {
    "/tmp/warren-workspaces".into()
}
fn default_agent_config_dir() -> String {
    "./agents".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentLoopConfig {
    /// Cumulative `tokens_in + tokens_out` ceiling per activation.
    #[serde(default = "default_token_budget")]
    pub token_budget: u64,
    #[serde(default = "default_tool_call_timeout")]
    pub tool_call_timeout_secs: u64,
    /// Tool calls honored per LLM turn; the rest get error results.
    #[serde(default = "default_max_tools_per_turn")]
    pub max_tools_per_turn: u32,
    #[serde(default = "default_llm_retries")]
    pub llm_retries: u32,
    #[serde(default = "default_post_retries")]
    pub post_retries: u32,
}

impl Default for AgentLoopConfig {
    fn default() -> Self {
        Self {
            token_budget: default_token_budget(),
            tool_call_timeout_secs: default_tool_call_timeout(),
            max_tools_per_turn: default_max_tools_per_turn(),
            llm_retries: default_llm_retries(),
            post_retries: default_post_retries(),
        }
    }
}

fn default_token_budget() -> u64 {
    200_000
}
fn default_tool_call_timeout() -> u64 {
    60
}
fn default_max_tools_per_turn() -> u32 {
    10
}
fn default_llm_retries() -> u32 {
    3
}
fn default_post_retries() -> u32 {
    3
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_operator_docs() {
        let cfg = Config::default();
        assert_eq!(cfg.coordinator.poll_interval_secs, 30);
        assert_eq!(cfg.coordinator.min_staleness_secs, 900);
        assert_eq!(cfg.coordinator.leader_ttl_secs, 30);
        assert_eq!(cfg.coordinator.leader_heartbeat_secs, 10);
        assert_eq!(cfg.queue.max_failures, 5);
        assert_eq!(cfg.queue.backoff_base_secs, 60);
        assert_eq!(cfg.queue.backoff_cap_secs, 3600);
        assert_eq!(cfg.runner.claim_timeout_secs, 30);
        assert_eq!(cfg.runner.max_in_flight, 1);
    }

    #[test]
    fn claim_ttl_is_timeout_plus_grace() {
        let cfg = RunnerConfig::default();
        assert_eq!(
            cfg.claim_ttl_secs(),
            cfg.activation_timeout_secs + cfg.claim_grace_secs
        );
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let cfg: Config = toml::from_str(
            "[coordinator]\npoll_interval_secs = 60\n\n[store]\nurl = \"redis://example:6379\"\n",
        )
        .unwrap();
        assert_eq!(cfg.coordinator.poll_interval_secs, 60);
        assert_eq!(cfg.coordinator.sweep_interval_secs, 60);
        assert_eq!(cfg.store.url, "redis://example:6379");
        assert_eq!(cfg.store.key_prefix, "work");
    }

    #[test]
    fn load_missing_file_uses_defaults() {
        let cfg = Config::load(Some(std::path::Path::new("/nonexistent/warren.toml"))).unwrap();
        assert_eq!(cfg.queue.max_failures, 5);
    }

    #[test]
    fn load_from_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("warren.toml");
        std::fs::write(&path, "[queue]\nmax_failures = 3\n").unwrap();
        let cfg = Config::load_from(&path).unwrap();
        assert_eq!(cfg.queue.max_failures, 3);
    }
}
