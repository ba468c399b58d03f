mod config;
mod enforcement;
mod error;
mod infraction;
mod metrics;
mod orchestrator;
mod provider;
mod scorer;
mod store;
mod tier;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::orchestrator::HealthCheckRunner;
use crate::store::file::{FileInfractionSink, FileMetricsSource, FileProviderStore};
use crate::store::StaticTierRuleSource;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "fleet_health=info".into());
    if std::env::var("FLEET_HEALTH_LOG_FORMAT").as_deref() == Ok("json") {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    info!("🩺 fleet-health v{} starting...", env!("CARGO_PKG_VERSION"));

    // Load config
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "fleet-health.toml".to_string());

    let config = Config::load(&config_path)?;
    info!("Config loaded from {} ({} tier rules)", config_path, config.tiers.len());

    let providers = FileProviderStore::open(&config.data.providers_path).await?;
    let runner = HealthCheckRunner::new(
        Arc::new(FileMetricsSource::new(&config.data.orders_path)),
        Arc::new(StaticTierRuleSource::from_config(&config.tiers)),
        Arc::new(providers),
        Arc::new(FileInfractionSink::new(&config.data.infractions_path)),
        config.engine.clone(),
    );

    // Ctrl-C stops dispatch; in-flight providers still persist
    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, finishing in-flight providers");
            let _ = cancel_tx.send(true);
        }
    });

    if !config.schedule.enabled {
        let stats = runner.run_health_check_at(Utc::now(), cancel_rx).await?;
        info!("Run stats: {}", serde_json::to_string(&stats)?);
        return Ok(());
    }

    let interval = Duration::from_secs(config.schedule.interval_secs);
    info!("Health check scheduler started (interval: {:?})", interval);
    loop {
        match runner.run_health_check_at(Utc::now(), cancel_rx.clone()).await {
            Ok(stats) => info!("Run stats: {}", serde_json::to_string(&stats)?),
            // Fatal for this run only; the next tick tries again
            Err(e) => error!("Health check run failed (fatal={}): {}", e.is_fatal(), e),
        }
        if *cancel_rx.borrow() {
            break;
        }
        let mut cancel = cancel_rx.clone();
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            Ok(()) = cancel.changed() => break,
        }
    }
    info!("🩺 fleet-health stopped");
    Ok(())
}
