use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use wr_agent::{AgentLoop, LlmProvider, LoopLimits};
use wr_core::config::RunnerConfig;
use wr_core::secrets::SecretsProvider;
use wr_core::shutdown::ShutdownSignal;
use wr_core::types::{AgentConfig, RunnerMode, TaskType, WorkItem};
use wr_hub::HubApi;
use wr_queue::{QueueError, WorkQueue};
use wr_telemetry::MetricsCollector;
use wr_tools::ToolServerManager;

use crate::config_cache::ConfigCache;
use crate::workspace::WorkspaceManager;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    /// The store stayed unreachable past the exit window; the process
    /// should exit non-zero and be restarted.
    #[error("store unavailable for {0:?}, exiting")]
    StoreUnavailable(Duration),
    /// A store write mid-completion failed; state may be inconsistent,
    /// so the process exits and lets TTLs self-heal.
    #[error(transparent)]
    Queue(#[from] QueueError),
}

pub type Result<T> = std::result::Result<T, RunnerError>;

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

/// The claim → activate → report loop.
///
/// One `run` call drives one worker: it blocks on the queue, filters by
/// runner mode, resolves the agent config, builds the per-activation
/// workspace and tool servers, runs the agent loop, and reports the
/// outcome back to the queue. Spawn it `max_in_flight` times for
/// concurrent activations; the per-agent invariant lives in the queue,
/// not here.
pub struct Runner {
    id: String,
    mode: RunnerMode,
    config: RunnerConfig,
    queue: Arc<WorkQueue>,
    hub: Arc<dyn HubApi>,
    agent_loop: AgentLoop,
    config_cache: Arc<ConfigCache>,
    secrets: Arc<dyn SecretsProvider>,
    workspaces: WorkspaceManager,
    metrics: Arc<MetricsCollector>,
    shutdown: ShutdownSignal,
    store_failure_exit: Duration,
    tool_call_timeout: Duration,
}

#[allow(clippy::too_many_arguments)]
impl Runner {
    pub fn new(
        id: impl Into<String>,
        mode: RunnerMode,
        config: RunnerConfig,
        queue: Arc<WorkQueue>,
        hub: Arc<dyn HubApi>,
        provider: Arc<dyn LlmProvider>,
        config_cache: Arc<ConfigCache>,
        secrets: Arc<dyn SecretsProvider>,
        metrics: Arc<MetricsCollector>,
        limits: LoopLimits,
        shutdown: ShutdownSignal,
        store_failure_exit: Duration,
    ) -> Self {
        let id = id.into();
        let tool_call_timeout = limits.tool_call_timeout;
        let workspaces = WorkspaceManager::new(config.workspace_root.clone(), &id);
        let agent_loop = AgentLoop::new(hub.clone(), provider, metrics.clone(), limits);
        Self {
            id,
            mode,
            config,
            queue,
            hub,
            agent_loop,
            config_cache,
            secrets,
            workspaces,
            metrics,
            shutdown,
            store_failure_exit,
            tool_call_timeout,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// The worker loop. With `once`, at most one claim attempt is made
    /// (the test hook behind `runner --once`).
    pub async fn run(&self, once: bool) -> Result<()> {
        let mut shutdown_rx = self.shutdown.subscribe();
        let claim_timeout = Duration::from_secs(self.config.claim_timeout_secs);
        let mut store_failing_since: Option<Instant> = None;

        info!(runner_id = %self.id, mode = ?self.mode, "runner started");
        loop {
            if self.shutdown.is_shutting_down() {
                break;
            }

            let claimed = tokio::select! {
                result = self.queue.claim(&self.id, claim_timeout) => result,
                _ = shutdown_rx.recv() => {
                    info!(runner_id = %self.id, "shutdown received, no further claims");
                    break;
                }
            };

            let work = match claimed {
                Ok(work) => {
                    store_failing_since = None;
                    work
                }
                Err(e) => {
                    let since = *store_failing_since.get_or_insert_with(Instant::now);
                    self.metrics
                        .increment_counter("errors_total", &[("kind", "STORE_UNAVAILABLE")]);
                    error!(runner_id = %self.id, error = %e, "claim failed");
                    if since.elapsed() >= self.store_failure_exit {
                        return Err(RunnerError::StoreUnavailable(self.store_failure_exit));
                    }
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    continue;
                }
            };

            let Some(work) = work else {
                if once {
                    break;
                }
                continue;
            };

            if !self.mode.accepts(work.task_type) {
                self.requeue_mismatched(&work).await?;
            } else {
                self.process(&work).await?;
            }

            if once {
                break;
            }
        }

        info!(runner_id = %self.id, "runner stopped");
        Ok(())
    }

    /// A claim this runner's mode cannot serve goes back at the same
    /// priority, completed as success so the agent gains no failure
    /// credit.
    async fn requeue_mismatched(&self, work: &WorkItem) -> Result<()> {
        debug!(
            runner_id = %self.id,
            agent_id = %work.agent_id,
            task_type = %work.task_type,
            "mode mismatch, re-enqueueing"
        );
        self.queue.complete(work, true).await?;

        let mut requeued = work.clone();
        requeued.claim_id = None;
        if !self.queue.enqueue(&requeued, false).await? {
            // Someone else already re-enqueued this agent; nothing lost.
            debug!(agent_id = %work.agent_id, "re-enqueue deduplicated");
        }
        Ok(())
    }

    /// One full activation. Queue completion errors propagate (the
    /// process exits rather than risk inconsistent state); everything
    /// else turns into an unsuccessful completion.
    async fn process(&self, work: &WorkItem) -> Result<()> {
        let agent_id = work.agent_id.clone();

        let config = match self.config_cache.get_or_load(&agent_id).await {
            Ok(config) => config,
            Err(e) => {
                warn!(agent_id = %agent_id, error = %e, "config unavailable, failing activation");
                self.metrics
                    .increment_counter("errors_total", &[("kind", "CONFIG_UNAVAILABLE")]);
                self.queue.complete(work, false).await?;
                return Ok(());
            }
        };

        if !permitted(&config, work) {
            debug!(agent_id = %agent_id, "work not permitted by agent behavior, skipping");
            self.queue.complete(work, true).await?;
            return Ok(());
        }

        let workspace = match self.workspaces.create(&agent_id).await {
            Ok(ws) => ws,
            Err(e) => {
                error!(agent_id = %agent_id, error = %e, "workspace creation failed");
                self.queue.complete(work, false).await?;
                return Ok(());
            }
        };

        if let Err(e) = self.hub.mark_activated(&agent_id).await {
            debug!(agent_id = %agent_id, error = %e, "mark_activated failed");
        }

        // Keep the claim's idle TTL fresh while the activation runs, so
        // only claims from dead runners expire.
        let heartbeat = {
            let queue = self.queue.clone();
            let agent_id = agent_id.clone();
            let interval = Duration::from_secs(self.config.heartbeat_interval_secs.max(1));
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    match queue.refresh_claim(&agent_id).await {
                        Ok(true) => {}
                        Ok(false) => {
                            warn!(agent_id = %agent_id, "claim entry vanished during activation");
                            break;
                        }
                        Err(e) => warn!(agent_id = %agent_id, error = %e, "claim refresh failed"),
                    }
                }
            })
        };

        let mut servers = ToolServerManager::new(self.tool_call_timeout);
        servers
            .start_servers(&config.capabilities, self.secrets.as_ref(), workspace.path())
            .await;

        let cancel = self.shutdown.cancel_flag();
        let outcome = self
            .agent_loop
            .run(work, &config, &servers, cancel.as_ref())
            .await;

        // Cleanup runs on every path before the completion report.
        servers.stop_servers().await;
        heartbeat.abort();
        workspace.remove().await;

        self.queue.complete(work, outcome.success).await?;
        Ok(())
    }
}

/// Behavior gate: an agent that declines mentions or replies silently
/// skips that inbox work (completed as success upstream of this call).
fn permitted(config: &AgentConfig, work: &WorkItem) -> bool {
    if work.task_type != TaskType::Inbox {
        return true;
    }
    match work.payload.get("kind").and_then(|v| v.as_str()) {
        Some("mention") => config.behavior.respond_to_mentions,
        Some("reply") => config.behavior.respond_to_replies,
        _ => true,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use wr_agent::ScriptedProvider;
    use wr_core::config_source::{ConfigSource, ConfigSourceError, Result as SourceResult};
    use wr_core::secrets::StaticSecrets;
    use wr_core::types::Priority;
    use wr_hub::{
        AgentWithWork, BudgetHealth, ConsumptionReport, Notification, Post, StaleAgent,
    };
    use wr_queue::{QueueDepths, WorkQueueConfig};
    use wr_store::MemoryStore;

    #[derive(Default)]
    struct TestHub {
        comments: Mutex<Vec<(String, String)>>,
        activated: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl HubApi for TestHub {
        async fn poll_agents_with_work(
            &self,
            _timeout: Duration,
            _batch_size: u32,
        ) -> wr_hub::Result<Vec<AgentWithWork>> {
            Ok(vec![])
        }
        async fn stale_agents(&self, _min: Duration) -> wr_hub::Result<Vec<StaleAgent>> {
            Ok(vec![])
        }
        async fn mark_activated(&self, agent_id: &str) -> wr_hub::Result<()> {
            self.activated.lock().unwrap().push(agent_id.to_string());
            Ok(())
        }
        async fn get_thread(&self, post_id: &str) -> wr_hub::Result<Post> {
            Ok(Post {
                id: post_id.to_string(),
                author_name: "human".into(),
                content: "hello".into(),
                comments: vec![],
            })
        }
        async fn create_post(&self, _agent_id: &str, content: &str) -> wr_hub::Result<Post> {
            Ok(Post {
                id: "p-new".into(),
                author_name: "agent".into(),
                content: content.to_string(),
                comments: vec![],
            })
        }
        async fn create_comment(
            &self,
            post_id: &str,
            _agent_id: &str,
            content: &str,
        ) -> wr_hub::Result<Post> {
            self.comments
                .lock()
                .unwrap()
                .push((post_id.to_string(), content.to_string()));
            Ok(Post {
                id: "c-new".into(),
                author_name: "agent".into(),
                content: content.to_string(),
                comments: vec![],
            })
        }
        async fn unread_notifications(
            &self,
            _agent_id: &str,
        ) -> wr_hub::Result<Vec<Notification>> {
            Ok(vec![])
        }
        async fn mark_notifications_read(&self, _ids: &[String]) -> wr_hub::Result<()> {
            Ok(())
        }
        async fn search(&self, _query: &str) -> wr_hub::Result<Vec<Post>> {
            Ok(vec![])
        }
        async fn discover_feed(&self, _agent_id: &str) -> wr_hub::Result<Vec<Post>> {
            Ok(vec![])
        }
        async fn budget_health(&self, _agent_id: &str) -> wr_hub::Result<BudgetHealth> {
            Ok(BudgetHealth {
                status: "ok".into(),
                tokens_remaining: None,
                summary: None,
            })
        }
        async fn report_consumption(&self, _report: &ConsumptionReport) -> wr_hub::Result<()> {
            Ok(())
        }
    }

    struct TestSource {
        fail: bool,
        respond_to_mentions: bool,
    }

    #[async_trait]
    impl ConfigSource for TestSource {
        async fn load(&self, agent_id: &str) -> SourceResult<AgentConfig> {
            if self.fail {
                return Err(ConfigSourceError::NotFound(agent_id.to_string()));
            }
            let mut config = AgentConfig {
                agent_type: "social".into(),
                behavior: Default::default(),
                capabilities: Default::default(),
                brain: Default::default(),
                cache_ttl: 300,
                system_prompt: "test".into(),
            };
            config.behavior.respond_to_mentions = self.respond_to_mentions;
            Ok(config)
        }
    }

    struct Fixture {
        runner: Runner,
        queue: Arc<WorkQueue>,
        hub: Arc<TestHub>,
    }

    fn fixture(provider: ScriptedProvider, source: TestSource) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(WorkQueue::new(store.clone(), WorkQueueConfig::default()));
        let hub = Arc::new(TestHub::default());
        let config_cache = Arc::new(ConfigCache::new(
            store,
            Arc::new(source),
            "config",
        ));
        let mut runner_config = RunnerConfig::default();
        runner_config.workspace_root = std::env::temp_dir()
            .join("warren-test-workspaces")
            .to_string_lossy()
            .into_owned();
        runner_config.claim_timeout_secs = 1;

        let runner = Runner::new(
            "runner-1",
            RunnerMode::Hybrid,
            runner_config,
            queue.clone(),
            hub.clone(),
            Arc::new(provider),
            config_cache,
            Arc::new(StaticSecrets::new()),
            Arc::new(MetricsCollector::with_defaults()),
            LoopLimits {
                activation_timeout: Duration::from_secs(10),
                ..LoopLimits::default()
            },
            ShutdownSignal::new(),
            Duration::from_secs(60),
        );
        Fixture { runner, queue, hub }
    }

    fn inbox(agent: &str) -> WorkItem {
        WorkItem::new(agent, agent, TaskType::Inbox)
            .with_payload("thread_root", serde_json::json!("p1"))
    }

    #[tokio::test]
    async fn single_activation_end_to_end() {
        let f = fixture(
            ScriptedProvider::new().push_text("hello back"),
            TestSource {
                fail: false,
                respond_to_mentions: true,
            },
        );
        assert!(f.queue.enqueue(&inbox("alice"), false).await.unwrap());

        f.runner.run(true).await.unwrap();

        assert_eq!(
            f.hub.comments.lock().unwrap().as_slice(),
            &[("p1".to_string(), "hello back".to_string())]
        );
        assert_eq!(f.hub.activated.lock().unwrap().as_slice(), &["alice".to_string()]);
        assert_eq!(f.queue.failures("alice").await.unwrap(), 0);
        assert!(f.queue.backoff_until("alice").await.unwrap().is_none());
        assert_eq!(f.queue.active_count().await.unwrap(), 0);
        assert_eq!(f.queue.depth(Priority::High).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn config_unavailable_counts_as_failure() {
        let f = fixture(
            ScriptedProvider::new(),
            TestSource {
                fail: true,
                respond_to_mentions: true,
            },
        );
        assert!(f.queue.enqueue(&inbox("carol"), false).await.unwrap());

        f.runner.run(true).await.unwrap();

        assert_eq!(f.queue.failures("carol").await.unwrap(), 1);
        assert_eq!(f.queue.active_count().await.unwrap(), 0);
        assert!(f.hub.comments.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unpermitted_work_completes_as_success() {
        let f = fixture(
            ScriptedProvider::new().push_text("never used"),
            TestSource {
                fail: false,
                respond_to_mentions: false,
            },
        );
        let work = inbox("dave").with_payload("kind", serde_json::json!("mention"));
        assert!(f.queue.enqueue(&work, false).await.unwrap());

        f.runner.run(true).await.unwrap();

        assert_eq!(f.queue.failures("dave").await.unwrap(), 0);
        assert_eq!(f.queue.active_count().await.unwrap(), 0);
        assert!(f.hub.comments.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn mode_mismatch_requeues_without_fail_credit() {
        let f = fixture(
            ScriptedProvider::new(),
            TestSource {
                fail: false,
                respond_to_mentions: true,
            },
        );
        // Rebuild the runner as notification-only.
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(WorkQueue::new(store.clone(), WorkQueueConfig::default()));
        let hub = Arc::new(TestHub::default());
        let mut runner_config = RunnerConfig::default();
        runner_config.workspace_root = std::env::temp_dir()
            .join("warren-test-workspaces")
            .to_string_lossy()
            .into_owned();
        runner_config.claim_timeout_secs = 1;
        let runner = Runner::new(
            "runner-n",
            RunnerMode::Notification,
            runner_config,
            queue.clone(),
            hub,
            Arc::new(ScriptedProvider::new()),
            Arc::new(ConfigCache::new(
                store,
                Arc::new(TestSource {
                    fail: false,
                    respond_to_mentions: true,
                }),
                "config",
            )),
            Arc::new(StaticSecrets::new()),
            Arc::new(MetricsCollector::with_defaults()),
            LoopLimits::default(),
            ShutdownSignal::new(),
            Duration::from_secs(60),
        );
        drop(f);

        let work = WorkItem::new("erin", "Erin", TaskType::Discovery);
        assert!(queue.enqueue(&work, false).await.unwrap());

        runner.run(true).await.unwrap();

        // Back in the normal queue, no failure credit.
        assert_eq!(queue.depth(Priority::Normal).await.unwrap(), 1);
        assert_eq!(queue.failures("erin").await.unwrap(), 0);
        let requeued = queue
            .claim("other", Duration::from_millis(100))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(requeued.agent_id, "erin");
    }

    #[tokio::test]
    async fn shutdown_before_claim_stops_immediately() {
        let f = fixture(
            ScriptedProvider::new(),
            TestSource {
                fail: false,
                respond_to_mentions: true,
            },
        );
        f.runner.shutdown.trigger();
        f.runner.run(false).await.unwrap();
    }

    #[tokio::test]
    async fn repeated_failures_arm_circuit_breaker() {
        let f = fixture(
            ScriptedProvider::new(),
            TestSource {
                fail: true,
                respond_to_mentions: true,
            },
        );

        for _ in 0..5 {
            // The negative config cache would mask later attempts; force
            // enqueue around the growing backoff instead.
            assert!(f.queue.enqueue(&inbox("carol"), true).await.unwrap());
            f.runner.run(true).await.unwrap();
        }

        assert_eq!(f.queue.failures("carol").await.unwrap(), 5);
        let until = f.queue.backoff_until("carol").await.unwrap().unwrap();
        assert!(until > chrono_now());
        // The 6th unforced enqueue bounces off the breaker.
        assert!(!f.queue.enqueue(&inbox("carol"), false).await.unwrap());
    }

    fn chrono_now() -> i64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs() as i64
    }
}
