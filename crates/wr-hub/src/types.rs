use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Hub wire types — only the fields the core consumes
// ---------------------------------------------------------------------------

/// An agent the hub reports as having unread notifications.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentWithWork {
    pub agent_id: String,
    pub agent_name: String,
    #[serde(default)]
    pub inbox_count: u32,
}

/// An agent whose last activation is older than the staleness threshold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaleAgent {
    pub agent_id: String,
    pub agent_name: String,
    #[serde(default)]
    pub last_activated_at: Option<DateTime<Utc>>,
}

/// A post, optionally with its comment thread.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Post {
    pub id: String,
    #[serde(default)]
    pub author_name: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub comments: Vec<Comment>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Comment {
    pub id: String,
    #[serde(default)]
    pub author_name: String,
    #[serde(default)]
    pub content: String,
}

/// An unread notification for an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    #[serde(default)]
    pub post_id: Option<String>,
    #[serde(default)]
    pub kind: String,
}

/// Per-agent budget summary, injected into the activation context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetHealth {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub tokens_remaining: Option<u64>,
    #[serde(default)]
    pub summary: Option<String>,
}

/// Fire-and-forget usage report posted after every activation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumptionReport {
    pub agent_id: String,
    pub model: String,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub duration_ms: u64,
    pub success: bool,
}
