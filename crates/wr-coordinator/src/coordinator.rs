use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use wr_core::config::CoordinatorConfig;
use wr_core::shutdown::ShutdownSignal;
use wr_core::types::{Priority, TaskType, WorkItem};
use wr_hub::{HubApi, HubError};
use wr_queue::{QueueDepths, WorkQueue};
use wr_telemetry::MetricsCollector;

use crate::leader::LeaderElector;

/// Upstream long-poll window.
const LONG_POLL: Duration = Duration::from_secs(30);
/// Gauge refresh cadence.
const METRICS_INTERVAL: Duration = Duration::from_secs(15);

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

/// Discovers work upstream and enqueues it, but only while this instance
/// holds leadership.
///
/// Two discovery tasks share one event loop: the inbox poll (jittered
/// `poll_interval`) and the staleness sweep (`sweep_interval`). Each tick
/// collects its full batch from the hub first and then enqueues in one
/// burst. Queue-depth gauges refresh through the narrow [`QueueDepths`]
/// view rather than the full queue surface.
pub struct Coordinator {
    hub: Arc<dyn HubApi>,
    queue: Arc<WorkQueue>,
    depths: Arc<dyn QueueDepths>,
    elector: Arc<LeaderElector>,
    config: CoordinatorConfig,
    metrics: Arc<MetricsCollector>,
    shutdown: ShutdownSignal,
}

impl Coordinator {
    pub fn new(
        hub: Arc<dyn HubApi>,
        queue: Arc<WorkQueue>,
        depths: Arc<dyn QueueDepths>,
        elector: Arc<LeaderElector>,
        config: CoordinatorConfig,
        metrics: Arc<MetricsCollector>,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            hub,
            queue,
            depths,
            elector,
            config,
            metrics,
            shutdown,
        }
    }

    /// The coordinator event loop. Runs until shutdown, then releases
    /// leadership.
    pub async fn run(&self) {
        let mut shutdown_rx = self.shutdown.subscribe();
        let mut heartbeat = tokio::time::interval(Duration::from_secs(
            self.config.leader_heartbeat_secs.max(1),
        ));
        let mut sweep = tokio::time::interval(Duration::from_secs(
            self.config.sweep_interval_secs.max(1),
        ));
        let mut metrics_tick = tokio::time::interval(METRICS_INTERVAL);
        // The heartbeat fires immediately so leadership is contested at
        // startup; the other loops wait one full period.
        sweep.tick().await;
        metrics_tick.tick().await;

        let mut next_poll = Instant::now() + self.jittered_poll_interval();

        info!(
            instance_id = %self.elector.instance_id(),
            poll_secs = self.config.poll_interval_secs,
            sweep_secs = self.config.sweep_interval_secs,
            "coordinator event loop starting"
        );

        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    if let Err(e) = self.elector.try_become_leader().await {
                        warn!(error = %e, "leader heartbeat failed");
                        self.metrics
                            .increment_counter("errors_total", &[("kind", "STORE_UNAVAILABLE")]);
                    }
                    self.metrics
                        .set_gauge("is_leader", self.elector.is_leader() as i64);
                }
                _ = tokio::time::sleep_until(next_poll) => {
                    next_poll = Instant::now() + self.jittered_poll_interval();
                    self.inbox_tick().await;
                }
                _ = sweep.tick() => {
                    self.sweep_tick().await;
                }
                _ = metrics_tick.tick() => {
                    self.refresh_metrics().await;
                }
                _ = shutdown_rx.recv() => {
                    info!("shutdown received, stopping coordinator");
                    break;
                }
            }
        }

        if let Err(e) = self.elector.release().await {
            error!(error = %e, "failed to release leadership on shutdown");
        }
    }

    fn jittered_poll_interval(&self) -> Duration {
        let base = self.config.poll_interval_secs.max(1) as f64;
        let factor = rand::thread_rng().gen_range(0.8..=1.2);
        Duration::from_secs_f64(base * factor)
    }

    /// Inbox poll: agents with unread notifications become HIGH-priority
    /// inbox work.
    pub async fn inbox_tick(&self) {
        if !self.elector.is_leader() {
            debug!(event = "not_leader_skipping_poll", "not leader, skipping inbox poll");
            return;
        }

        let agents = match self
            .hub
            .poll_agents_with_work(LONG_POLL, self.config.poll_batch_size)
            .await
        {
            Ok(agents) => agents,
            // A long-poll timeout simply means no work arrived.
            Err(HubError::Timeout) => {
                debug!("inbox poll timed out, no work");
                return;
            }
            Err(e) => {
                warn!(error = %e, "inbox poll failed, skipping this cycle");
                self.metrics
                    .increment_counter("errors_total", &[("kind", "UPSTREAM_UNAVAILABLE")]);
                return;
            }
        };
        if agents.is_empty() {
            return;
        }

        // Collect the whole batch before touching the queue, so the
        // enqueues land as one burst.
        let mut items = Vec::new();
        for agent in agents {
            if self.backing_off(&agent.agent_id).await {
                continue;
            }
            items.push(self.build_inbox_item(agent.agent_id, agent.agent_name).await);
        }
        self.enqueue_burst(items, "inbox").await;
    }

    async fn build_inbox_item(&self, agent_id: String, agent_name: String) -> WorkItem {
        let mut work = WorkItem::new(agent_id, agent_name, TaskType::Inbox);
        match self.hub.unread_notifications(&work.agent_id).await {
            Ok(notifications) if !notifications.is_empty() => {
                let ids: Vec<String> = notifications.iter().map(|n| n.id.clone()).collect();
                work = work.with_payload("notification_ids", serde_json::json!(ids));
                if let Some(root) = notifications.iter().find_map(|n| n.post_id.clone()) {
                    work = work.with_payload("thread_root", serde_json::json!(root));
                }
                if let Some(kind) = notifications.first().map(|n| n.kind.clone()) {
                    if !kind.is_empty() {
                        work = work.with_payload("kind", serde_json::json!(kind));
                    }
                }
            }
            Ok(_) => {}
            Err(e) => {
                debug!(agent_id = %work.agent_id, error = %e, "could not fetch notification detail");
            }
        }
        work
    }

    /// Staleness sweep: long-idle agents get NORMAL-priority discovery
    /// work.
    pub async fn sweep_tick(&self) {
        if !self.elector.is_leader() {
            debug!(event = "not_leader_skipping_poll", "not leader, skipping staleness sweep");
            return;
        }

        let stale = match self
            .hub
            .stale_agents(Duration::from_secs(self.config.min_staleness_secs))
            .await
        {
            Ok(stale) => stale,
            Err(e) => {
                warn!(error = %e, "staleness sweep failed, skipping this cycle");
                self.metrics
                    .increment_counter("errors_total", &[("kind", "UPSTREAM_UNAVAILABLE")]);
                return;
            }
        };
        if stale.is_empty() {
            return;
        }

        let mut items = Vec::new();
        for agent in stale {
            if self.backing_off(&agent.agent_id).await {
                continue;
            }
            items.push(WorkItem::new(
                agent.agent_id,
                agent.agent_name,
                TaskType::Discovery,
            ));
        }
        self.enqueue_burst(items, "discovery").await;
    }

    /// Agents inside their backoff window are filtered here as well as
    /// at enqueue, to avoid pointless notification fetches.
    async fn backing_off(&self, agent_id: &str) -> bool {
        match self.queue.backoff_until(agent_id).await {
            Ok(Some(until)) => {
                let now = chrono_now();
                if until > now {
                    debug!(agent_id, backoff_until = until, "agent backing off, skipped");
                    return true;
                }
                false
            }
            Ok(None) => false,
            Err(e) => {
                warn!(agent_id, error = %e, "backoff lookup failed");
                false
            }
        }
    }

    async fn enqueue_burst(&self, items: Vec<WorkItem>, source: &str) {
        let total = items.len();
        let mut enqueued = 0usize;
        for item in &items {
            match self.queue.enqueue(item, false).await {
                Ok(true) => {
                    enqueued += 1;
                    self.metrics.increment_counter(
                        "work_enqueued_total",
                        &[("task_type", &item.task_type.to_string())],
                    );
                }
                Ok(false) => {
                    self.metrics
                        .increment_counter("work_dedup_rejected_total", &[]);
                }
                Err(e) => {
                    error!(agent_id = %item.agent_id, error = %e, "enqueue failed");
                    self.metrics
                        .increment_counter("errors_total", &[("kind", "STORE_UNAVAILABLE")]);
                }
            }
        }
        info!(source, total, enqueued, "enqueue burst complete");
    }

    /// Queue-depth and leadership gauges for the metrics endpoint.
    pub async fn refresh_metrics(&self) {
        for (priority, gauge) in [
            (Priority::High, "queue_depth_high"),
            (Priority::Normal, "queue_depth_normal"),
            (Priority::Low, "queue_depth_low"),
        ] {
            match self.depths.depth(priority).await {
                Ok(depth) => self.metrics.set_gauge(gauge, depth as i64),
                Err(e) => warn!(error = %e, "queue depth read failed"),
            }
        }
        if let Ok(active) = self.depths.active_count().await {
            self.metrics.set_gauge("active_tasks", active as i64);
        }
        if let Ok(backing_off) = self.depths.backoff_count().await {
            self.metrics.set_gauge("backoff_agents", backing_off as i64);
        }
        self.metrics
            .set_gauge("is_leader", self.elector.is_leader() as i64);
    }
}

fn chrono_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use wr_hub::{
        AgentWithWork, BudgetHealth, ConsumptionReport, Notification, Post, StaleAgent,
    };
    use wr_queue::WorkQueueConfig;
    use wr_store::{KvStore, MemoryStore};

    #[derive(Default)]
    struct FakeHub {
        with_work: Mutex<Vec<AgentWithWork>>,
        stale: Mutex<Vec<StaleAgent>>,
        notifications: Mutex<Vec<Notification>>,
    }

    #[async_trait]
    impl HubApi for FakeHub {
        async fn poll_agents_with_work(
            &self,
            _timeout: Duration,
            _batch_size: u32,
        ) -> wr_hub::Result<Vec<AgentWithWork>> {
            Ok(self.with_work.lock().unwrap().clone())
        }
        async fn stale_agents(&self, _min: Duration) -> wr_hub::Result<Vec<StaleAgent>> {
            Ok(self.stale.lock().unwrap().clone())
        }
        async fn mark_activated(&self, _agent_id: &str) -> wr_hub::Result<()> {
            Ok(())
        }
        async fn get_thread(&self, _post_id: &str) -> wr_hub::Result<Post> {
            unimplemented!()
        }
        async fn create_post(&self, _agent_id: &str, _content: &str) -> wr_hub::Result<Post> {
            unimplemented!()
        }
        async fn create_comment(
            &self,
            _post_id: &str,
            _agent_id: &str,
            _content: &str,
        ) -> wr_hub::Result<Post> {
            unimplemented!()
        }
        async fn unread_notifications(
            &self,
            _agent_id: &str,
        ) -> wr_hub::Result<Vec<Notification>> {
            Ok(self.notifications.lock().unwrap().clone())
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

    struct Fixture {
        coordinator: Coordinator,
        queue: Arc<WorkQueue>,
        hub: Arc<FakeHub>,
        elector: Arc<LeaderElector>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(WorkQueue::new(
            store.clone() as Arc<dyn KvStore>,
            WorkQueueConfig::default(),
        ));
        let hub = Arc::new(FakeHub::default());
        let elector = Arc::new(LeaderElector::new(
            store as Arc<dyn KvStore>,
            "coord-1",
            Duration::from_secs(30),
        ));
        let coordinator = Coordinator::new(
            hub.clone(),
            queue.clone(),
            queue.clone() as Arc<dyn QueueDepths>,
            elector.clone(),
            CoordinatorConfig::default(),
            Arc::new(MetricsCollector::with_defaults()),
            ShutdownSignal::new(),
        );
        Fixture {
            coordinator,
            queue,
            hub,
            elector,
        }
    }

    fn agent(id: &str) -> AgentWithWork {
        AgentWithWork {
            agent_id: id.to_string(),
            agent_name: id.to_string(),
            inbox_count: 1,
        }
    }

    #[tokio::test]
    async fn inbox_tick_enqueues_high_priority_work() {
        let f = fixture();
        f.elector.try_become_leader().await.unwrap();
        f.hub.with_work.lock().unwrap().push(agent("alice"));
        f.hub.notifications.lock().unwrap().push(Notification {
            id: "n1".into(),
            post_id: Some("p1".into()),
            kind: "mention".into(),
        });

        f.coordinator.inbox_tick().await;

        assert_eq!(f.queue.depth(Priority::High).await.unwrap(), 1);
        let work = f
            .queue
            .claim("r", Duration::from_millis(100))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(work.agent_id, "alice");
        assert_eq!(work.task_type, TaskType::Inbox);
        assert_eq!(work.thread_root(), Some("p1"));
        assert_eq!(work.notification_ids(), vec!["n1".to_string()]);
    }

    #[tokio::test]
    async fn inbox_tick_skips_when_not_leader() {
        let f = fixture();
        f.hub.with_work.lock().unwrap().push(agent("alice"));

        f.coordinator.inbox_tick().await;

        assert_eq!(f.queue.depth(Priority::High).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn repeated_ticks_deduplicate() {
        let f = fixture();
        f.elector.try_become_leader().await.unwrap();
        f.hub.with_work.lock().unwrap().push(agent("alice"));

        f.coordinator.inbox_tick().await;
        f.coordinator.inbox_tick().await;

        assert_eq!(f.queue.depth(Priority::High).await.unwrap(), 1);
        assert_eq!(f.queue.active_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn backing_off_agents_are_filtered() {
        let f = fixture();
        f.elector.try_become_leader().await.unwrap();
        f.hub.with_work.lock().unwrap().push(agent("carol"));

        // Arm the circuit breaker for carol.
        let work = WorkItem::new("carol", "carol", TaskType::Inbox);
        for _ in 0..5 {
            f.queue.complete(&work, false).await.unwrap();
        }

        f.coordinator.inbox_tick().await;
        assert_eq!(f.queue.depth(Priority::High).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn sweep_tick_enqueues_discovery_work() {
        let f = fixture();
        f.elector.try_become_leader().await.unwrap();
        f.hub.stale.lock().unwrap().push(StaleAgent {
            agent_id: "bob".into(),
            agent_name: "Bob".into(),
            last_activated_at: None,
        });

        f.coordinator.sweep_tick().await;

        assert_eq!(f.queue.depth(Priority::Normal).await.unwrap(), 1);
        let work = f
            .queue
            .claim("r", Duration::from_millis(100))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(work.task_type, TaskType::Discovery);
        assert_eq!(work.priority, Priority::Normal);
    }

    #[tokio::test]
    async fn refresh_metrics_sets_gauges() {
        let f = fixture();
        f.elector.try_become_leader().await.unwrap();
        f.queue
            .enqueue(&WorkItem::new("a", "a", TaskType::Inbox), false)
            .await
            .unwrap();

        f.coordinator.refresh_metrics().await;

        assert_eq!(f.coordinator.metrics.get_gauge("queue_depth_high"), 1);
        assert_eq!(f.coordinator.metrics.get_gauge("active_tasks"), 1);
        assert_eq!(f.coordinator.metrics.get_gauge("is_leader"), 1);
    }

    #[tokio::test]
    async fn jitter_stays_within_twenty_percent() {
        let f = fixture();
        for _ in 0..50 {
            let d = f.coordinator.jittered_poll_interval();
            assert!(d >= Duration::from_secs(24));
            assert!(d <= Duration::from_secs(36));
        }
    }
}
