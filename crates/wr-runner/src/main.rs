//! warren runner — claims work from the shared queue and executes agent
//! activations until told to stop.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

use wr_agent::{AnthropicProvider, LoopLimits};
use wr_core::config::Config;
use wr_core::config_source::FsConfigSource;
use wr_core::secrets::EnvSecrets;
use wr_core::shutdown::ShutdownSignal;
use wr_core::types::RunnerMode;
use wr_hub::HubClient;
use wr_queue::{WorkQueue, WorkQueueConfig};
use wr_store::RedisStore;
use wr_telemetry::{HealthState, MetricsCollector};

use wr_runner::config_cache::ConfigCache;
use wr_runner::runner::Runner;

#[derive(Debug, Parser)]
#[command(name = "runner", about = "warren agent runner")]
struct Args {
    /// Which task types to accept: notification, exploration, or hybrid.
    #[arg(long, default_value = "hybrid")]
    mode: String,

    /// Concurrent activations in this process.
    #[arg(long)]
    max_in_flight: Option<u32>,

    /// Per-activation wall-clock budget, in seconds.
    #[arg(long)]
    activation_timeout: Option<u64>,

    /// Claim at most one item, run it, then exit (test hook).
    #[arg(long)]
    once: bool,

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
    wr_telemetry::logging::init_from_env("runner");

    let args = Args::parse();
    let mode: RunnerMode = args
        .mode
        .parse()
        .map_err(|e: String| anyhow::anyhow!(e))?;

    let mut config = Config::load(args.config.as_deref()).context("failed to load config")?;
    if let Some(n) = args.max_in_flight {
        config.runner.max_in_flight = n.max(1);
    }
    if let Some(secs) = args.activation_timeout {
        config.runner.activation_timeout_secs = secs;
    }

    let instance_id = Config::instance_id();
    info!(instance_id = %instance_id, mode = %args.mode, "runner starting");

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

    let api_key = std::env::var("ANTHROPIC_API_KEY").unwrap_or_default();
    let provider = Arc::new(AnthropicProvider::new(api_key));

    let config_cache = Arc::new(ConfigCache::new(
        store.clone(),
        Arc::new(FsConfigSource::new(&config.runner.agent_config_dir)),
        "config",
    ));

    let metrics = Arc::new(MetricsCollector::with_defaults());
    if let Some(addr) = &args.metrics_addr {
        wr_telemetry::spawn_server(
            addr,
            metrics.clone(),
            HealthState {
                instance_id: instance_id.clone(),
                role: "runner",
                is_leader: None,
            },
        )
        .await
        .context("failed to bind metrics listener")?;
    }

    let shutdown = ShutdownSignal::new();
    spawn_signal_handler(shutdown.clone());

    let limits = LoopLimits {
        activation_timeout: Duration::from_secs(config.runner.activation_timeout_secs),
        token_budget: config.agent.token_budget,
        tool_call_timeout: Duration::from_secs(config.agent.tool_call_timeout_secs),
        max_tools_per_turn: config.agent.max_tools_per_turn,
        llm_retries: config.agent.llm_retries,
        post_retries: config.agent.post_retries,
    };

    let runner = Arc::new(Runner::new(
        instance_id,
        mode,
        config.runner.clone(),
        queue,
        hub,
        provider,
        config_cache,
        Arc::new(EnvSecrets::new()),
        metrics,
        limits,
        shutdown.clone(),
        Duration::from_secs(config.store.failure_exit_secs),
    ));

    let workers = if args.once {
        1
    } else {
        config.runner.max_in_flight.max(1)
    };
    let mut handles = Vec::new();
    for _ in 0..workers {
        let runner = runner.clone();
        let once = args.once;
        handles.push(tokio::spawn(async move { runner.run(once).await }));
    }

    let mut failed = false;
    for handle in handles {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(error = %e, "runner worker exited with error");
                failed = true;
            }
            Err(e) => {
                error!(error = %e, "runner worker panicked");
                failed = true;
            }
        }
    }

    if failed {
        anyhow::bail!("runner exited abnormally");
    }
    info!("runner shut down cleanly");
    Ok(())
}

/// First signal starts graceful shutdown; a second one force-cancels the
/// in-flight activation.
fn spawn_signal_handler(shutdown: ShutdownSignal) {
    tokio::spawn(async move {
        #[cfg(unix)]
        let mut term = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                return;
            }
        };

        loop {
            #[cfg(unix)]
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
            #[cfg(not(unix))]
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }

            if shutdown.is_shutting_down() {
                info!("second signal, cancelling in-flight activation");
                shutdown.force_cancel();
            } else {
                info!("signal received, draining");
                shutdown.trigger();
            }
        }
    });
}
