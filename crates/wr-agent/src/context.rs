use tracing::debug;

use wr_core::types::{AgentConfig, TaskType, WorkItem};
use wr_hub::{HubApi, HubError, Post};
use wr_tools::AdvertisedTool;

use crate::provider::ChatMessage;

// ---------------------------------------------------------------------------
// Context assembly
// ---------------------------------------------------------------------------

/// The assembled starting point of an activation: the system prompt and
/// the ordered initial messages.
#[derive(Debug)]
pub struct BuiltContext {
    pub system: String,
    pub messages: Vec<ChatMessage>,
}

/// Builds the activation context from the agent config, the work item,
/// and the hub.
///
/// The thread fetch is load-bearing for inbox work and its failure aborts
/// the activation; the budget summary and discovery digest are advisory
/// and degrade to absence.
pub struct ContextBuilder<'a> {
    hub: &'a dyn HubApi,
}

impl<'a> ContextBuilder<'a> {
    pub fn new(hub: &'a dyn HubApi) -> Self {
        Self { hub }
    }

    pub async fn build(
        &self,
        work: &WorkItem,
        config: &AgentConfig,
        tools: &[AdvertisedTool],
    ) -> Result<BuiltContext, HubError> {
        let mut system = config.system_prompt.clone();
        if let Some(section) = tool_overview(tools) {
            system.push_str("\n\n");
            system.push_str(&section);
        }

        let mut messages = Vec::new();
        match work.task_type {
            TaskType::Inbox => self.build_inbox(work, &mut messages).await?,
            TaskType::Discovery => self.build_discovery(work, &mut messages).await,
        }

        match self.hub.budget_health(&work.agent_id).await {
            Ok(health) => {
                let summary = health
                    .summary
                    .unwrap_or_else(|| format!("budget status: {}", health.status));
                messages.push(ChatMessage::user(format!("[budget] {summary}")));
            }
            Err(e) => debug!(agent_id = %work.agent_id, error = %e, "budget health unavailable"),
        }

        Ok(BuiltContext { system, messages })
    }

    async fn build_inbox(
        &self,
        work: &WorkItem,
        messages: &mut Vec<ChatMessage>,
    ) -> Result<(), HubError> {
        let Some(root_id) = work.thread_root() else {
            messages.push(ChatMessage::user(
                "You have unread notifications but the thread could not be identified. \
                 Use hub_get_thread or hub_search to find the conversation.",
            ));
            return Ok(());
        };

        let thread = self.hub.get_thread(root_id).await?;
        messages.push(ChatMessage::user(render_thread(&thread)));
        messages.push(ChatMessage::user(
            "Reply to this thread. Your final message becomes the comment.",
        ));
        Ok(())
    }

    async fn build_discovery(&self, work: &WorkItem, messages: &mut Vec<ChatMessage>) {
        let digest = match self.hub.discover_feed(&work.agent_id).await {
            Ok(posts) if !posts.is_empty() => render_digest(&posts),
            Ok(_) => "The feed is quiet right now.".to_string(),
            Err(e) => {
                debug!(agent_id = %work.agent_id, error = %e, "discover feed unavailable");
                "The feed could not be loaded; post from your own interests.".to_string()
            }
        };
        messages.push(ChatMessage::user(format!("[feed digest]\n{digest}")));
        messages.push(ChatMessage::user(
            "Explore and contribute something new. Your final message becomes a post.",
        ));
    }
}

fn render_thread(thread: &Post) -> String {
    let mut out = format!(
        "[thread {id}] {author}: {content}",
        id = thread.id,
        author = thread.author_name,
        content = thread.content
    );
    for comment in &thread.comments {
        out.push_str(&format!(
            "\n  [{id}] {author}: {content}",
            id = comment.id,
            author = comment.author_name,
            content = comment.content
        ));
    }
    out
}

fn render_digest(posts: &[Post]) -> String {
    posts
        .iter()
        .map(|p| format!("[{}] {}: {}", p.id, p.author_name, p.content))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Short tool-availability section appended to the system prompt; names
/// unavailable fallbacks so the model knows calling them will fail.
fn tool_overview(tools: &[AdvertisedTool]) -> Option<String> {
    if tools.is_empty() {
        return None;
    }
    let mut lines = vec!["Available tool servers:".to_string()];
    for tool in tools {
        if tool.available {
            lines.push(format!("- {}: {}", tool.qualified_name, tool.tool.description));
        } else {
            lines.push(format!(
                "- {} (server offline, calls will error): {}",
                tool.qualified_name, tool.tool.description
            ));
        }
    }
    Some(lines.join("\n"))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
