mod daemon;

use anyhow::Context;
use judgekit_builder::metrics::PoolMetrics;
use judgekit_builder::pool::SubmissionPool;
use judgekit_builder::tester::{Judge, TesterRegistry};
use judgekit_common::config::BuilderConfig;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};

const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 30;
const HEALTH_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr; stdout carries results.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .init();

    info!("judgekit worker booting...");

    let config_path = std::env::var("JUDGEKIT_CONFIG").ok().map(PathBuf::from);
    let config = BuilderConfig::from_env(config_path.as_deref())
        .map_err(|e| {
            error!("Failed to load configuration: {}", e);
            e
        })?;
    let grace = std::env::var("JUDGEKIT_SHUTDOWN_GRACE_SECS")
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(Duration::from_secs(DEFAULT_SHUTDOWN_GRACE_SECS));

    if !config.sandbox_enabled {
        warn!("sandbox disabled, submissions run without resource limits or syscall filtering");
    }

    let registry = TesterRegistry::load(config.testers_path.as_deref())
        .context("invalid tester mapping")?;
    for (problem_type, steps) in registry.sequences() {
        info!(problem_type = %problem_type, steps = ?steps, "tester ready");
    }

    let config = Arc::new(config);
    let judge = Arc::new(Judge::new(Arc::new(registry), Arc::clone(&config)));
    let metrics_registry = prometheus::Registry::new();
    let metrics = Arc::new(PoolMetrics::new(&metrics_registry).context("failed to register metrics")?);
    let (pool, results) = SubmissionPool::start(judge, &config, Arc::clone(&metrics));

    info!(
        pool_size = config.pool_size,
        queue_capacity = config.queue_capacity,
        test_timeout_ms = config.test_timeout_ms,
        total_timeout_ms = ?config.total_timeout_ms,
        "worker ready, reading submissions from stdin"
    );

    let writer = tokio::spawn(daemon::write_results(results, tokio::io::stdout()));
    let health = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(HEALTH_INTERVAL);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let snapshot = metrics.snapshot();
            info!(
                queue_depth = snapshot.queue_depth,
                in_flight = snapshot.in_flight,
                max_queue_depth_5m = snapshot.max_queue_depth_5m,
                completed = snapshot.completed,
                "pool health"
            );
        }
    });

    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    tokio::select! {
        read = daemon::read_requests(stdin, &pool) => {
            if let Err(e) = read {
                error!(error = %e, "stopped reading submissions");
            }
        }
        _ = signal::ctrl_c() => {
            warn!("Received shutdown signal, draining queue...");
        }
    }

    pool.shutdown(grace).await;
    health.abort();
    drop(pool);

    match writer.await {
        Ok(Ok(written)) => info!(results = written, "worker shutdown complete"),
        Ok(Err(e)) => error!(error = %e, "failed to publish results"),
        Err(e) => error!(error = %e, "result writer failed"),
    }
    Ok(())
}
