use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use realm_taskd::config::SchedulerConfig;
use realm_taskd::managers::TaskManagers;
use realm_taskd::metrics::Metrics;
use realm_taskd::sim::{self, LogMailStore, SimWorld};
use realm_taskd::task::TokioScheduler;
use realm_taskd::util::clock::SystemClock;

/// Interval of the summary log line
const SUMMARY_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize logging, RUST_LOG overrides the default level
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    info!("Realm Task Scheduler v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = SchedulerConfig::load_or_default();
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;
    info!(
        "Configuration loaded: movement={}ms/{}ms, attack={}ms, think={}ms",
        config.movement.players.period_ms,
        config.movement.npcs.period_ms,
        config.attack.period_ms,
        config.think.period_ms
    );

    let metrics = Arc::new(Metrics::new());

    #[cfg(feature = "metrics_http")]
    {
        let metrics_clone = metrics.clone();
        let metrics_port = config.metrics_port;
        tokio::spawn(async move {
            if let Err(e) = realm_taskd::metrics::start_metrics_server(metrics_clone, metrics_port).await {
                error!("Metrics server error: {}", e);
            }
        });
    }

    let scheduler = Arc::new(TokioScheduler::current()?);
    let managers: Arc<SimWorld> = Arc::new(TaskManagers::new(
        &config,
        scheduler.clone(),
        Arc::new(SystemClock::new()),
        metrics.clone(),
        Arc::new(LogMailStore),
    ));
    managers.start();

    let bots = if config.sim_bots > 0 {
        let bots = sim::spawn_bots(&managers, 1, config.sim_bots);
        info!("Simulating {} bots", bots.len());
        bots
    } else {
        Vec::new()
    };

    let summary = {
        let metrics = metrics.clone();
        async move {
            let mut interval = tokio::time::interval(SUMMARY_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                info!(
                    "Scheduling {} subjects in {} pools, game tick {}",
                    metrics.total_subjects(),
                    metrics.total_pools(),
                    metrics.game_ticks.load(std::sync::atomic::Ordering::Relaxed)
                );
            }
        }
    };

    // Shutdown signal handler
    let shutdown = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
        info!("Shutdown signal received");
    };

    tokio::select! {
        _ = summary => {}
        _ = shutdown => {
            info!("Shutting down...");
        }
    }

    // Cleanup
    managers.shutdown();
    scheduler.shutdown();
    drop(bots);
    info!("Scheduler stopped");

    Ok(())
}
