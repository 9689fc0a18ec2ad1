//! warren coordinator — leader-elected work discovery.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use wr_core::config::Config;
use wr_core::shutdown::ShutdownSignal;
use wr_hub::HubClient;
use wr_queue::{QueueDepths, WorkQueue, WorkQueueConfig};
use wr_store::RedisStore;
use wr_telemetry::{HealthState, MetricsCollector};

use wr_coordinator::{Coordinator, LeaderElector};

#[derive(Debug, Parser)]
#[command(name = "coordinator", about = "warren work coordinator")]
struct Args {
    /// Leadership identity; defaults to INSTANCE_ID, then hostname.
    #[arg(long)]
    instance_id: Option<String>,

    /// Inbox poll cadence in seconds (jittered ±20% at runtime).
    #[arg(long)]
    poll_interval: Option<u64>,

    /// Idle threshold for the staleness sweep, in seconds.
    #[arg(long)]
    min_staleness: Option<u64>,

    /// Optional TOML config path.
    #[arg(long, env = "WARREN_CONFIG")]
    config: Option<PathBuf>,

    /// Bind address for /healthz and /metrics; disabled when unset.
    #[arg(long, env = "METRICS_ADDR")]
    metrics_addr: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    wr_telemetry::logging::init_from_env("coordinator");

    let args = Args::parse();
    let mut config = Config::load(args.config.as_deref()).context("failed to load config")?;
    if let Some(secs) = args.poll_interval {
        config.coordinator.poll_interval_secs = secs;
    }
    if let Some(secs) = args.min_staleness {
        config.coordinator.min_staleness_secs = secs;
    }

    let instance_id = args.instance_id.unwrap_or_else(Config::instance_id);
    info!(instance_id = %instance_id, "coordinator starting");

    let store = Arc::new(
        RedisStore::connect(&config.store.url)
            .await
            .context("failed to connect to store")?,
    );
    let queue = Arc::new(WorkQueue::new(
        store.clone(),
        WorkQueueConfig {
            key_prefix: config.store.key_prefix.clone(),
            max_failures: config.queue.max_failures,
            backoff_base: Duration::from_secs(config.queue.backoff_base_secs),
            backoff_cap: Duration::from_secs(config.queue.backoff_cap_secs),
            claim_ttl: Duration::from_secs(config.runner.claim_ttl_secs()),
        },
    ));

    let hub = Arc::new(
        HubClient::new(
            &config.hub.base_url,
            &config.hub.api_key,
            Duration::from_secs(config.hub.request_timeout_secs),
            config.hub.max_retries,
        )
        .context("failed to build hub client")?,
    );

    let elector = Arc::new(LeaderElector::new(
        store,
        instance_id.clone(),
        Duration::from_secs(config.coordinator.leader_ttl_secs),
    ));

    let metrics = Arc::new(MetricsCollector::with_defaults());
    if let Some(addr) = &args.metrics_addr {
        wr_telemetry::spawn_server(
            addr,
            metrics.clone(),
            HealthState {
                instance_id: instance_id.clone(),
                role: "coordinator",
                is_leader: Some(elector.leader_flag()),
            },
        )
        .await
        .context("failed to bind metrics listener")?;
    }

    let shutdown = ShutdownSignal::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            #[cfg(unix)]
            {
                let mut term = match tokio::signal::unix::signal(
                    tokio::signal::unix::SignalKind::terminate(),
                ) {
                    Ok(s) => s,
                    Err(e) => {
                        tracing::error!(error = %e, "failed to install SIGTERM handler");
                        return;
                    }
                };
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            #[cfg(not(unix))]
            {
                let _ = tokio::signal::ctrl_c().await;
            }
            info!("signal received, shutting down");
            shutdown.trigger();
        });
    }

    let coordinator = Coordinator::new(
        hub,
        queue.clone(),
        queue as Arc<dyn QueueDepths>,
        elector,
        config.coordinator.clone(),
        metrics,
        shutdown,
    );
    coordinator.run().await;

    info!("coordinator shut down cleanly");
    Ok(())
}
