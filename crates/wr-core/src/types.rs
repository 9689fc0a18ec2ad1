use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Priority
// ---------------------------------------------------------------------------

/// Priority class of a work item. Claim order is HIGH before NORMAL
/// before LOW; ties within a class are FIFO.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    Normal,
    Low,
}

impl Priority {
    /// All priorities in claim order.
    pub const ALL: [Priority; 3] = [Priority::High, Priority::Normal, Priority::Low];

    /// Queue key suffix for this priority.
    pub fn queue_suffix(&self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.queue_suffix())
    }
}

// ---------------------------------------------------------------------------
// TaskType
// ---------------------------------------------------------------------------

/// What kind of activation this work item asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    /// Unread notifications are waiting; the agent should read and reply.
    Inbox,
    /// The agent has been idle; explore the feed and post something new.
    Discovery,
}

impl TaskType {
    /// Default priority for work of this type.
    pub fn default_priority(&self) -> Priority {
        match self {
            TaskType::Inbox => Priority::High,
            TaskType::Discovery => Priority::Normal,
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskType::Inbox => f.write_str("inbox"),
            TaskType::Discovery => f.write_str("discovery"),
        }
    }
}

// ---------------------------------------------------------------------------
// WorkItem
// ---------------------------------------------------------------------------

/// One unit of agent activation, as it travels through the queue.
///
/// Serialized to JSON for list storage; the payload is an opaque map
/// (notification ids to mark read, thread root id, discovery hints) that
/// round-trips untouched. `claim_id` is absent until a runner claims the
/// item, at which point it is stamped `{runner_id}:{nonce}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub agent_id: String,
    pub agent_name: String,
    pub task_type: TaskType,
    pub priority: Priority,
    #[serde(default)]
    pub payload: BTreeMap<String, serde_json::Value>,
    /// Unix seconds at enqueue time.
    pub enqueued_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claim_id: Option<String>,
}

impl WorkItem {
    /// Build a work item with the default priority for its task type.
    pub fn new(
        agent_id: impl Into<String>,
        agent_name: impl Into<String>,
        task_type: TaskType,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            agent_name: agent_name.into(),
            task_type,
            priority: task_type.default_priority(),
            payload: BTreeMap::new(),
            enqueued_at: chrono::Utc::now().timestamp(),
            claim_id: None,
        }
    }

    /// Override the priority (e.g. an operator-forced re-enqueue).
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Attach a payload entry.
    pub fn with_payload(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.payload.insert(key.into(), value);
        self
    }

    /// Notification ids this activation should mark read, if any.
    pub fn notification_ids(&self) -> Vec<String> {
        self.payload
            .get("notification_ids")
            .and_then(|v| v.as_array())
            .map(|a| {
                a.iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Root post id of the thread this item replies to, if any.
    pub fn thread_root(&self) -> Option<&str> {
        self.payload.get("thread_root").and_then(|v| v.as_str())
    }
}

// ---------------------------------------------------------------------------
// AgentConfig
// ---------------------------------------------------------------------------

/// An agent's configuration, immutable per version. Loaded through a
/// [`ConfigSource`](crate::config_source::ConfigSource) and cached with
/// `cache_ttl` by the runner's config cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Selects the executor adapter; opaque to the core.
    #[serde(rename = "type", default = "default_agent_type")]
    pub agent_type: String,
    #[serde(default)]
    pub behavior: BehaviorConfig,
    #[serde(default)]
    pub capabilities: CapabilitiesConfig,
    #[serde(default)]
    pub brain: BrainConfig,
    /// Seconds this config may be served from cache.
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl: u64,
    /// Opaque system prompt blob, passed to the agent loop verbatim.
    #[serde(default)]
    pub system_prompt: String,
}

fn default_agent_type() -> String {
    "generic".into()
}
fn default_cache_ttl() -> u64 {
    300
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BehaviorConfig {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    #[serde(default = "default_true")]
    pub respond_to_mentions: bool,
    #[serde(default = "default_true")]
    pub respond_to_replies: bool,
}

impl Default for BehaviorConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            respond_to_mentions: true,
            respond_to_replies: true,
        }
    }
}

fn default_max_iterations() -> u32 {
    10
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CapabilitiesConfig {
    /// Capability strings (e.g. `github:read`) gating tool servers and tools.
    #[serde(default)]
    pub grants: Vec<String>,
    /// Tool servers to launch per activation, in order.
    #[serde(default)]
    pub tool_servers: Vec<ToolServerSpec>,
}

impl CapabilitiesConfig {
    pub fn has_grant(&self, grant: &str) -> bool {
        self.grants.iter().any(|g| g == grant)
    }
}

/// How to reach one tool server and which grants it needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolServerSpec {
    pub name: String,
    pub transport: ToolTransport,
    /// Every grant listed here must be present in `capabilities.grants`
    /// for this server to be launched.
    #[serde(default)]
    pub required_grants: Vec<String>,
    /// Advertised when the server fails to start; calling one of these
    /// yields an error tool-result, never a fabricated success.
    #[serde(default)]
    pub fallback_tools: Vec<FallbackTool>,
}

/// Tool-server transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolTransport {
    /// Spawn a child process speaking JSON-RPC over stdio.
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
    },
    /// POST the same JSON-RPC envelope to an HTTP endpoint.
    Http { url: String },
}

/// Static descriptor for a tool on a server that is not running.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackTool {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrainConfig {
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

impl Default for BrainConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
        }
    }
}

fn default_model() -> String {
    "claude-sonnet-4-20250514".into()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_max_tokens() -> u32 {
    4096
}

// ---------------------------------------------------------------------------
// ActivationOutcome
// ---------------------------------------------------------------------------

/// Result of one complete run of the agent loop for one work item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivationOutcome {
    pub success: bool,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub iterations: u32,
    pub final_text: Option<String>,
    pub error_kind: Option<ErrorKind>,
}

impl ActivationOutcome {
    pub fn success(final_text: impl Into<String>) -> Self {
        Self {
            success: true,
            tokens_in: 0,
            tokens_out: 0,
            iterations: 0,
            final_text: Some(final_text.into()),
            error_kind: None,
        }
    }

    pub fn failure(kind: ErrorKind) -> Self {
        Self {
            success: false,
            tokens_in: 0,
            tokens_out: 0,
            iterations: 0,
            final_text: None,
            error_kind: Some(kind),
        }
    }
}

// ---------------------------------------------------------------------------
// ErrorKind
// ---------------------------------------------------------------------------

/// Stable error kinds surfaced in logs and metrics, never in API responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    StoreUnavailable,
    UpstreamUnavailable,
    ConfigUnavailable,
    LlmUnavailable,
    ToolTimeout,
    ToolUnknown,
    ToolDenied,
    BudgetExceeded,
    IterationLimit,
    Cancelled,
}

impl ErrorKind {
    /// Stable label used in log fields and metric labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::StoreUnavailable => "STORE_UNAVAILABLE",
            ErrorKind::UpstreamUnavailable => "UPSTREAM_UNAVAILABLE",
            ErrorKind::ConfigUnavailable => "CONFIG_UNAVAILABLE",
            ErrorKind::LlmUnavailable => "LLM_UNAVAILABLE",
            ErrorKind::ToolTimeout => "TOOL_TIMEOUT",
            ErrorKind::ToolUnknown => "TOOL_UNKNOWN",
            ErrorKind::ToolDenied => "TOOL_DENIED",
            ErrorKind::BudgetExceeded => "BUDGET_EXCEEDED",
            ErrorKind::IterationLimit => "ITERATION_LIMIT",
            ErrorKind::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// RunnerMode
// ---------------------------------------------------------------------------

/// Which task types a runner accepts. The filter is a post-claim guard;
/// all modes compete on the same queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerMode {
    Notification,
    Exploration,
    Hybrid,
}

impl RunnerMode {
    pub fn accepts(&self, task_type: TaskType) -> bool {
        match (self, task_type) {
            (RunnerMode::Hybrid, _) => true,
            (RunnerMode::Notification, TaskType::Inbox) => true,
            (RunnerMode::Exploration, TaskType::Discovery) => true,
            _ => false,
        }
    }
}

impl std::str::FromStr for RunnerMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "notification" => Ok(RunnerMode::Notification),
            "exploration" => Ok(RunnerMode::Exploration),
            "hybrid" => Ok(RunnerMode::Hybrid),
            other => Err(format!("unknown runner mode: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
