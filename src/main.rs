use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::EnvFilter;

use wide_telemetry_engine::alert_manager::AlertManager;
use wide_telemetry_engine::baseline;
use wide_telemetry_engine::bus_consumer;
use wide_telemetry_engine::config::Config;
use wide_telemetry_engine::detector::{self, Baselines};
use wide_telemetry_engine::investigator::Investigator;
use wide_telemetry_engine::store::Store;
use wide_telemetry_engine::threshold::ThresholdManager;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("wide_telemetry_engine=debug")
        }))
        .init();

    let _ = dotenvy::dotenv();

    let cfg = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::error!("configuration error: {e}");
            std::process::exit(1);
        }
    };

    let store = Arc::new(Store::new(&cfg.store));
    if let Err(e) = store.bootstrap(&cfg.store).await {
        tracing::error!("failed to bootstrap clickhouse schema: {e}");
        std::process::exit(1);
    }
    tracing::info!("clickhouse schema ready at {}", cfg.store.url);

    let shutdown: bus_consumer::Shutdown = Arc::new(AtomicBool::new(false));
    let rt_handle = tokio::runtime::Handle::current();

    let ingest_handle = {
        let cfg = cfg.clone();
        let store = store.clone();
        let shutdown = shutdown.clone();
        tokio::task::spawn_blocking(move || bus_consumer::run(cfg, store, shutdown, rt_handle))
    };

    let detection_handle = tokio::spawn(detection_loop(cfg.clone(), store.clone()));

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received, draining ingest buffers");
    shutdown.store(true, Ordering::Relaxed);
    detection_handle.abort();

    match ingest_handle.await {
        Ok(Ok(())) => tracing::info!("ingest loop stopped cleanly"),
        Ok(Err(e)) => tracing::error!("ingest loop exited with error: {e}"),
        Err(e) => tracing::error!("ingest task panicked: {e}"),
    }

    Ok(())
}

/// Drives baseline recomputation and anomaly detection on their own
/// independent cadences for as long as the process runs.
async fn detection_loop(cfg: Config, store: Arc<Store>) {
    let mut threshold_mgr = ThresholdManager::new(&cfg.thresholds, &cfg.root_cause);
    let mut alert_mgr = AlertManager::load(&store).await;
    let investigator = Investigator::new(cfg.llm.clone());

    let mut baseline_interval = tokio::time::interval(Duration::from_secs(cfg.detection.baseline_interval_secs));
    let mut detection_interval = tokio::time::interval(Duration::from_secs(cfg.detection.detection_interval_secs));
    baseline_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    detection_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = baseline_interval.tick() => {
                if let Err(e) = baseline::run(&store, &cfg.detection, &cfg.thresholds).await {
                    tracing::error!("baseline computation failed: {e}");
                }
                threshold_mgr.learn_from_alert_history(&store, cfg.root_cause.adaptive_thresholds_enabled).await;
            }
            _ = detection_interval.tick() => {
                let baselines = Baselines::load(&store).await;
                match detector::run(&store, &baselines, &cfg.thresholds, &threshold_mgr, &cfg.root_cause).await {
                    Ok(findings) => {
                        let new_alerts = alert_mgr.apply_findings(&store, &findings, cfg.thresholds.alert_cooldown_minutes).await;
                        alert_mgr.auto_resolve_missing(&store, &findings).await;
                        for alert in &new_alerts {
                            investigator.investigate(&store, alert).await;
                        }
                    }
                    Err(e) => tracing::error!("detection pass failed: {e}"),
                }
            }
        }
    }
}
