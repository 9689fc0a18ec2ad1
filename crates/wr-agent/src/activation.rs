use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use wr_core::types::{ActivationOutcome, AgentConfig, ErrorKind, TaskType, WorkItem};
use wr_hub::{ConsumptionReport, HubApi};
use wr_telemetry::MetricsCollector;
use wr_tools::{ToolServerError, ToolServerManager};

use crate::approval::AutoApprover;
use crate::context::ContextBuilder;
use crate::dispatch::{BuiltinTool, ToolDispatch, ToolRegistry};
use crate::provider::{ChatMessage, ChatRequest, ChatResponse, LlmProvider, ToolCall};

/// Consumption reports are fire-and-forget with this deadline.
const CONSUMPTION_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Limits
// ---------------------------------------------------------------------------

/// Budgets the loop enforces on every activation.
#[derive(Debug, Clone)]
pub struct LoopLimits {
    pub activation_timeout: Duration,
    pub token_budget: u64,
    pub tool_call_timeout: Duration,
    /// Tool calls honored per LLM turn; extras get error results, which
    /// bounds total calls at `max_iterations * max_tools_per_turn`.
    pub max_tools_per_turn: u32,
    pub llm_retries: u32,
    pub post_retries: u32,
}

impl Default for LoopLimits {
    fn default() -> Self {
        Self {
            activation_timeout: Duration::from_secs(600),
            token_budget: 200_000,
            tool_call_timeout: Duration::from_secs(60),
            max_tools_per_turn: 10,
            llm_retries: 3,
            post_retries: 3,
        }
    }
}

// ---------------------------------------------------------------------------
// AgentLoop
// ---------------------------------------------------------------------------

/// The bounded reason → tool → observe → respond cycle.
///
/// Terminates for every input: iterations are capped by the agent's
/// `max_iterations`, wall clock by `activation_timeout`, and tokens by
/// `token_budget`. Tool failures are injected back into the context as
/// error tool-results and never fail the activation; only LLM
/// exhaustion, upstream post failure, cancellation, and blown budgets do.
pub struct AgentLoop {
    hub: Arc<dyn HubApi>,
    provider: Arc<dyn LlmProvider>,
    metrics: Arc<MetricsCollector>,
    limits: LoopLimits,
    approver: AutoApprover,
}

impl AgentLoop {
    pub fn new(
        hub: Arc<dyn HubApi>,
        provider: Arc<dyn LlmProvider>,
        metrics: Arc<MetricsCollector>,
        limits: LoopLimits,
    ) -> Self {
        Self {
            hub,
            provider,
            metrics,
            limits,
            approver: AutoApprover::new(),
        }
    }

    /// Run one activation to completion. `cancel` is checked between
    /// iterations and on every tool-call boundary (soft cancel).
    pub async fn run(
        &self,
        work: &WorkItem,
        config: &AgentConfig,
        servers: &ToolServerManager,
        cancel: &AtomicBool,
    ) -> ActivationOutcome {
        let started = Instant::now();
        let outcome = self.run_inner(work, config, servers, cancel, started).await;
        self.finish(work, config, &outcome, started.elapsed());
        outcome
    }

    async fn run_inner(
        &self,
        work: &WorkItem,
        config: &AgentConfig,
        servers: &ToolServerManager,
        cancel: &AtomicBool,
        started: Instant,
    ) -> ActivationOutcome {
        let deadline = started + self.limits.activation_timeout;

        let mut registry = ToolRegistry::with_builtins();
        registry.register_server_tools(servers.advertised_tools());
        let tool_specs = registry.specs();

        let built = match ContextBuilder::new(self.hub.as_ref())
            .build(work, config, servers.advertised_tools())
            .await
        {
            Ok(built) => built,
            Err(e) => {
                warn!(agent_id = %work.agent_id, error = %e, "context build failed");
                return ActivationOutcome::failure(ErrorKind::UpstreamUnavailable);
            }
        };
        let system = built.system;
        let mut messages = built.messages;

        let mut tokens_in = 0u64;
        let mut tokens_out = 0u64;
        let max_iterations = config.behavior.max_iterations.max(1);

        for iteration in 1..=max_iterations {
            if cancel.load(Ordering::Relaxed) {
                return self.outcome(false, tokens_in, tokens_out, iteration - 1, None, Some(ErrorKind::Cancelled));
            }
            if Instant::now() >= deadline {
                return self.outcome(false, tokens_in, tokens_out, iteration - 1, None, Some(ErrorKind::BudgetExceeded));
            }

            let request = ChatRequest {
                model: &config.brain.model,
                temperature: config.brain.temperature,
                max_tokens: config.brain.max_tokens,
                system: &system,
                messages: &messages,
                tools: &tool_specs,
            };
            let response = match self.chat_with_retries(request, deadline).await {
                Ok(resp) => resp,
                Err(kind) => {
                    return self.outcome(false, tokens_in, tokens_out, iteration, None, Some(kind));
                }
            };

            tokens_in += response.tokens_in;
            tokens_out += response.tokens_out;
            if tokens_in + tokens_out > self.limits.token_budget {
                warn!(
                    agent_id = %work.agent_id,
                    tokens = tokens_in + tokens_out,
                    budget = self.limits.token_budget,
                    "token budget exhausted"
                );
                return self.outcome(false, tokens_in, tokens_out, iteration, None, Some(ErrorKind::BudgetExceeded));
            }

            if response.tool_calls.is_empty() {
                let Some(text) = response.text.clone() else {
                    // Neither text nor tool calls; treat as an empty turn
                    // and let the iteration limit bound it.
                    messages.push(ChatMessage::Assistant {
                        content: None,
                        tool_calls: Vec::new(),
                    });
                    messages.push(ChatMessage::user("Respond with text or call a tool."));
                    continue;
                };

                return match self.deliver(work, &text).await {
                    Ok(()) => self.outcome(true, tokens_in, tokens_out, iteration, Some(text), None),
                    Err(kind) => {
                        self.outcome(false, tokens_in, tokens_out, iteration, Some(text), Some(kind))
                    }
                };
            }

            // Tool calls execute sequentially so the model observes
            // results in dispatch order. Calls past the per-turn cap are
            // answered with error results instead of being executed.
            let calls = response.tool_calls.clone();
            messages.push(assistant_message(response));
            let cap = self.limits.max_tools_per_turn.max(1) as usize;
            for (index, call) in calls.iter().enumerate() {
                if cancel.load(Ordering::Relaxed) {
                    return self.outcome(false, tokens_in, tokens_out, iteration, None, Some(ErrorKind::Cancelled));
                }
                let (content, is_error) = if index < cap {
                    self.execute_tool(work, &registry, servers, call).await
                } else {
                    self.metrics
                        .increment_counter("tool_errors_total", &[("kind", "TOOL_DENIED")]);
                    (
                        format!(
                            "tool {} skipped: more than {cap} calls in one turn",
                            call.name
                        ),
                        true,
                    )
                };
                messages.push(ChatMessage::ToolResult {
                    call_id: call.id.clone(),
                    content,
                    is_error,
                });
            }
        }

        info!(
            agent_id = %work.agent_id,
            max_iterations,
            "iteration limit reached without a final response"
        );
        self.outcome(false, tokens_in, tokens_out, max_iterations, None, Some(ErrorKind::IterationLimit))
    }

    /// Call the LLM, retrying transient failures with backoff + jitter.
    /// The attempt is also bounded by the activation deadline.
    async fn chat_with_retries(
        &self,
        request: ChatRequest<'_>,
        deadline: Instant,
    ) -> Result<ChatResponse, ErrorKind> {
        let mut attempt = 0u32;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ErrorKind::BudgetExceeded);
            }

            let started = Instant::now();
            let result = tokio::time::timeout(
                remaining,
                self.provider.chat(ChatRequest {
                    model: request.model,
                    temperature: request.temperature,
                    max_tokens: request.max_tokens,
                    system: request.system,
                    messages: request.messages,
                    tools: request.tools,
                }),
            )
            .await;
            self.metrics.record_histogram(
                "llm_request_duration_seconds",
                started.elapsed().as_secs_f64(),
            );

            match result {
                Ok(Ok(response)) => return Ok(response),
                Ok(Err(e)) if e.is_retryable() && attempt < self.limits.llm_retries => {
                    attempt += 1;
                    let delay = backoff_with_jitter(attempt);
                    warn!(attempt, error = %e, "llm call failed, retrying");
                    tokio::time::sleep(delay.min(remaining)).await;
                }
                Ok(Err(e)) => {
                    warn!(error = %e, "llm unavailable");
                    return Err(ErrorKind::LlmUnavailable);
                }
                // The activation deadline elapsed mid-call.
                Err(_) => return Err(ErrorKind::BudgetExceeded),
            }
        }
    }

    /// Post the final text upstream: a comment for inbox work, a new post
    /// for discovery. Read notifications are marked afterwards,
    /// best-effort.
    async fn deliver(&self, work: &WorkItem, text: &str) -> Result<(), ErrorKind> {
        let mut attempt = 0u32;
        loop {
            let result = match work.task_type {
                TaskType::Inbox => match work.thread_root() {
                    Some(root) => self
                        .hub
                        .create_comment(root, &work.agent_id, text)
                        .await
                        .map(|_| ()),
                    None => self
                        .hub
                        .create_post(&work.agent_id, text)
                        .await
                        .map(|_| ()),
                },
                TaskType::Discovery => self
                    .hub
                    .create_post(&work.agent_id, text)
                    .await
                    .map(|_| ()),
            };

            match result {
                Ok(()) => break,
                Err(e) if e.is_retryable() && attempt < self.limits.post_retries => {
                    attempt += 1;
                    let delay = backoff_with_jitter(attempt);
                    warn!(attempt, error = %e, "post to hub failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    warn!(error = %e, "post to hub failed permanently");
                    return Err(ErrorKind::UpstreamUnavailable);
                }
            }
        }

        let ids = work.notification_ids();
        if !ids.is_empty() {
            if let Err(e) = self.hub.mark_notifications_read(&ids).await {
                warn!(error = %e, "failed to mark notifications read");
            }
        }
        Ok(())
    }

    /// Execute one tool call, mapping every failure mode to an error
    /// tool-result string. Never fails the activation.
    async fn execute_tool(
        &self,
        work: &WorkItem,
        registry: &ToolRegistry,
        servers: &ToolServerManager,
        call: &ToolCall,
    ) -> (String, bool) {
        let started = Instant::now();
        let result = self.execute_tool_inner(work, registry, servers, call).await;
        self.metrics.record_histogram(
            "tool_call_duration_seconds",
            started.elapsed().as_secs_f64(),
        );
        match result {
            Ok(content) => (content, false),
            Err((kind, message)) => {
                self.metrics
                    .increment_counter("tool_errors_total", &[("kind", kind.as_str())]);
                debug!(tool = %call.name, kind = kind.as_str(), "tool call errored");
                (message, true)
            }
        }
    }

    async fn execute_tool_inner(
        &self,
        work: &WorkItem,
        registry: &ToolRegistry,
        servers: &ToolServerManager,
        call: &ToolCall,
    ) -> Result<String, (ErrorKind, String)> {
        let Some(entry) = registry.lookup(&call.name) else {
            return Err((
                ErrorKind::ToolUnknown,
                format!("unknown tool: {}", call.name),
            ));
        };
        if !entry.available {
            return Err((
                ErrorKind::ToolUnknown,
                format!("tool {} belongs to a server that is not running", call.name),
            ));
        }
        if let Err(denial) = self.approver.check(entry.approval, &call.name, &call.arguments) {
            return Err((ErrorKind::ToolDenied, denial.message(&call.name)));
        }

        match &entry.dispatch {
            ToolDispatch::Builtin(builtin) => {
                let fut = self.run_builtin(work, *builtin, &call.arguments);
                match tokio::time::timeout(self.limits.tool_call_timeout, fut).await {
                    Ok(result) => result,
                    Err(_) => Err((
                        ErrorKind::ToolTimeout,
                        format!("tool {} timed out", call.name),
                    )),
                }
            }
            ToolDispatch::ToolServer { server, tool } => {
                match servers.call(server, tool, call.arguments.clone()).await {
                    Ok(result) if result.is_error => Err((
                        ErrorKind::ToolUnknown,
                        format!("tool {} reported an error: {}", call.name, result.text_content()),
                    )),
                    Ok(result) => Ok(result.text_content()),
                    Err(ToolServerError::Timeout) => Err((
                        ErrorKind::ToolTimeout,
                        format!("tool {} timed out", call.name),
                    )),
                    Err(e) => Err((
                        ErrorKind::ToolUnknown,
                        format!("tool {} failed: {e}", call.name),
                    )),
                }
            }
            ToolDispatch::Unknown(name) => {
                Err((ErrorKind::ToolUnknown, format!("unknown tool: {name}")))
            }
        }
    }

    async fn run_builtin(
        &self,
        work: &WorkItem,
        builtin: BuiltinTool,
        arguments: &serde_json::Value,
    ) -> Result<String, (ErrorKind, String)> {
        let arg = |key: &str| -> Result<String, (ErrorKind, String)> {
            arguments
                .get(key)
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .ok_or_else(|| {
                    (
                        ErrorKind::ToolUnknown,
                        format!("missing required argument `{key}`"),
                    )
                })
        };

        let map_hub_err = |e: wr_hub::HubError| {
            (
                ErrorKind::UpstreamUnavailable,
                format!("hub call failed: {e}"),
            )
        };

        match builtin {
            BuiltinTool::HubSearch => {
                let query = arg("query")?;
                let posts = self.hub.search(&query).await.map_err(map_hub_err)?;
                if posts.is_empty() {
                    return Ok("no results".to_string());
                }
                Ok(posts
                    .iter()
                    .map(|p| format!("[{}] {}: {}", p.id, p.author_name, p.content))
                    .collect::<Vec<_>>()
                    .join("\n"))
            }
            BuiltinTool::HubGetThread => {
                let post_id = arg("post_id")?;
                let thread = self.hub.get_thread(&post_id).await.map_err(map_hub_err)?;
                let mut out = format!("[{}] {}: {}", thread.id, thread.author_name, thread.content);
                for c in &thread.comments {
                    out.push_str(&format!("\n  [{}] {}: {}", c.id, c.author_name, c.content));
                }
                Ok(out)
            }
            BuiltinTool::HubPost => {
                let content = arg("content")?;
                let post = self
                    .hub
                    .create_post(&work.agent_id, &content)
                    .await
                    .map_err(map_hub_err)?;
                Ok(format!("posted as {}", post.id))
            }
            BuiltinTool::HubMention => {
                let post_id = arg("post_id")?;
                let content = arg("content")?;
                let comment = self
                    .hub
                    .create_comment(&post_id, &work.agent_id, &content)
                    .await
                    .map_err(map_hub_err)?;
                Ok(format!("commented as {}", comment.id))
            }
        }
    }

    fn outcome(
        &self,
        success: bool,
        tokens_in: u64,
        tokens_out: u64,
        iterations: u32,
        final_text: Option<String>,
        error_kind: Option<ErrorKind>,
    ) -> ActivationOutcome {
        ActivationOutcome {
            success,
            tokens_in,
            tokens_out,
            iterations,
            final_text,
            error_kind,
        }
    }

    /// Metrics and the fire-and-forget consumption report.
    fn finish(
        &self,
        work: &WorkItem,
        config: &AgentConfig,
        outcome: &ActivationOutcome,
        elapsed: Duration,
    ) {
        self.metrics
            .record_histogram("activation_duration_seconds", elapsed.as_secs_f64());
        self.metrics.increment_counter_by(
            "llm_tokens_total",
            &[("direction", "in")],
            outcome.tokens_in,
        );
        self.metrics.increment_counter_by(
            "llm_tokens_total",
            &[("direction", "out")],
            outcome.tokens_out,
        );
        let label = if outcome.success { "success" } else { "failure" };
        self.metrics
            .increment_counter("activations_total", &[("outcome", label)]);
        if let Some(kind) = outcome.error_kind {
            self.metrics
                .increment_counter("errors_total", &[("kind", kind.as_str())]);
        }

        info!(
            agent_id = %work.agent_id,
            success = outcome.success,
            iterations = outcome.iterations,
            tokens_in = outcome.tokens_in,
            tokens_out = outcome.tokens_out,
            duration_ms = elapsed.as_millis() as u64,
            event = "activation_completed",
            "activation completed"
        );

        let report = ConsumptionReport {
            agent_id: work.agent_id.clone(),
            model: config.brain.model.clone(),
            tokens_in: outcome.tokens_in,
            tokens_out: outcome.tokens_out,
            duration_ms: elapsed.as_millis() as u64,
            success: outcome.success,
        };
        let hub = self.hub.clone();
        tokio::spawn(async move {
            let send = hub.report_consumption(&report);
            if tokio::time::timeout(CONSUMPTION_TIMEOUT, send).await.is_err() {
                debug!("consumption report timed out");
            }
        });
    }
}

fn assistant_message(response: ChatResponse) -> ChatMessage {
    ChatMessage::Assistant {
        content: response.text,
        tool_calls: response.tool_calls,
    }
}

fn backoff_with_jitter(attempt: u32) -> Duration {
    let base = Duration::from_millis(500)
        .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
        .min(Duration::from_secs(8));
    let jitter = rand::thread_rng().gen_range(0..=base.as_millis() as u64 / 2);
    base + Duration::from_millis(jitter)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
