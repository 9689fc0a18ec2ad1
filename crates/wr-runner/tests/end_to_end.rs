//! Coordinator → queue → runner, end to end over the in-memory store.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use wr_agent::{LoopLimits, ScriptedProvider};
use wr_coordinator::{Coordinator, LeaderElector};
use wr_core::config::{CoordinatorConfig, RunnerConfig};
use wr_core::config_source::{ConfigSource, Result as SourceResult};
use wr_core::secrets::StaticSecrets;
use wr_core::shutdown::ShutdownSignal;
use wr_core::types::{AgentConfig, Priority, RunnerMode};
use wr_hub::{
    AgentWithWork, BudgetHealth, ConsumptionReport, HubApi, Notification, Post, StaleAgent,
};
use wr_queue::{QueueDepths, WorkQueue, WorkQueueConfig};
use wr_runner::{ConfigCache, Runner};
use wr_store::MemoryStore;
use wr_telemetry::MetricsCollector;

// ---------------------------------------------------------------------------
// Seeded hub double
// ---------------------------------------------------------------------------

#[derive(Default)]
struct SeededHub {
    agents_with_work: Mutex<Vec<AgentWithWork>>,
    notifications: Mutex<Vec<Notification>>,
    comments: Mutex<Vec<(String, String)>>,
    read_ids: Mutex<Vec<String>>,
}

#[async_trait]
impl HubApi for SeededHub {
    async fn poll_agents_with_work(
        &self,
        _timeout: Duration,
        _batch_size: u32,
    ) -> wr_hub::Result<Vec<AgentWithWork>> {
        // The notification is consumed by the first poll.
        Ok(std::mem::take(&mut *self.agents_with_work.lock().unwrap()))
    }
    async fn stale_agents(&self, _min: Duration) -> wr_hub::Result<Vec<StaleAgent>> {
        Ok(vec![])
    }
    async fn mark_activated(&self, _agent_id: &str) -> wr_hub::Result<()> {
        Ok(())
    }
    async fn get_thread(&self, post_id: &str) -> wr_hub::Result<Post> {
        Ok(Post {
            id: post_id.to_string(),
            author_name: "human".into(),
            content: "hey alice, thoughts?".into(),
            comments: vec![],
        })
    }
    async fn create_post(&self, _agent_id: &str, content: &str) -> wr_hub::Result<Post> {
        Ok(Post {
            id: "p-new".into(),
            author_name: "alice".into(),
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
            author_name: "alice".into(),
            content: content.to_string(),
            comments: vec![],
        })
    }
    async fn unread_notifications(&self, _agent_id: &str) -> wr_hub::Result<Vec<Notification>> {
        Ok(self.notifications.lock().unwrap().clone())
    }
    async fn mark_notifications_read(&self, ids: &[String]) -> wr_hub::Result<()> {
        self.read_ids.lock().unwrap().extend(ids.iter().cloned());
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

struct StaticConfigs;

#[async_trait]
impl ConfigSource for StaticConfigs {
    async fn load(&self, _agent_id: &str) -> SourceResult<AgentConfig> {
        Ok(AgentConfig {
            agent_type: "social".into(),
            behavior: Default::default(),
            capabilities: Default::default(),
            brain: Default::default(),
            cache_ttl: 300,
            system_prompt: "You are alice.".into(),
        })
    }
}

// ---------------------------------------------------------------------------
// The single-inbox-activation path
// ---------------------------------------------------------------------------

#[tokio::test]
async fn inbox_notification_flows_to_comment() {
    let store = Arc::new(MemoryStore::new());
    let queue = Arc::new(WorkQueue::new(store.clone(), WorkQueueConfig::default()));
    let hub = Arc::new(SeededHub::default());

    // Seed: alice has one unread notification on post p1.
    hub.agents_with_work.lock().unwrap().push(AgentWithWork {
        agent_id: "alice".into(),
        agent_name: "Alice".into(),
        inbox_count: 1,
    });
    hub.notifications.lock().unwrap().push(Notification {
        id: "n1".into(),
        post_id: Some("p1".into()),
        kind: "mention".into(),
    });

    // Coordinator discovers the work.
    let elector = Arc::new(LeaderElector::new(
        store.clone(),
        "coord-1",
        Duration::from_secs(30),
    ));
    elector.try_become_leader().await.unwrap();
    let coordinator = Coordinator::new(
        hub.clone(),
        queue.clone(),
        queue.clone() as Arc<dyn QueueDepths>,
        elector,
        CoordinatorConfig::default(),
        Arc::new(MetricsCollector::with_defaults()),
        ShutdownSignal::new(),
    );
    coordinator.inbox_tick().await;
    assert_eq!(queue.depth(Priority::High).await.unwrap(), 1);

    // Runner claims and activates it.
    let mut runner_config = RunnerConfig::default();
    runner_config.workspace_root = std::env::temp_dir()
        .join("warren-e2e-workspaces")
        .to_string_lossy()
        .into_owned();
    runner_config.claim_timeout_secs = 1;

    let runner = Runner::new(
        "runner-1",
        RunnerMode::Hybrid,
        runner_config,
        queue.clone(),
        hub.clone(),
        Arc::new(ScriptedProvider::new().push_text("happy to help")),
        Arc::new(ConfigCache::new(
            store,
            Arc::new(StaticConfigs),
            "config",
        )),
        Arc::new(StaticSecrets::new()),
        Arc::new(MetricsCollector::with_defaults()),
        LoopLimits::default(),
        ShutdownSignal::new(),
        Duration::from_secs(60),
    );
    runner.run(true).await.unwrap();

    // The reply landed on the right thread and the notification is read.
    assert_eq!(
        hub.comments.lock().unwrap().as_slice(),
        &[("p1".to_string(), "happy to help".to_string())]
    );
    assert_eq!(hub.read_ids.lock().unwrap().as_slice(), &["n1".to_string()]);

    // All queues and the active map are empty; no failure credit.
    for priority in Priority::ALL {
        assert_eq!(queue.depth(priority).await.unwrap(), 0);
    }
    assert_eq!(queue.active_count().await.unwrap(), 0);
    assert_eq!(queue.failures("alice").await.unwrap(), 0);
    assert!(queue.backoff_until("alice").await.unwrap().is_none());
}
