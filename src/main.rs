use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use deskbook::clock::SystemClock;
use deskbook::config::Settings;
use deskbook::effects::Collaborators;
use deskbook::engine::Engine;
use deskbook::scheduler;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = Settings::from_env()?;
    deskbook::observability::init(settings.metrics_port)?;

    std::fs::create_dir_all(&settings.data_dir)?;

    let engine = Arc::new(Engine::new(
        settings.wal_path(),
        settings.policy.clone(),
        Collaborators::logging(),
        Arc::new(SystemClock),
    )?);

    info!("deskbook started");
    info!("  data_dir: {}", settings.data_dir.display());
    info!("  sweep_interval: {:?}", settings.sweep_interval);
    info!("  billing: {:?}", settings.policy.billing);
    info!(
        "  metrics: {}",
        settings
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    let sweeps = tokio::spawn(scheduler::run_scheduler(engine.clone(), settings.sweep_interval));
    let compactor = tokio::spawn(scheduler::run_compactor(engine.clone(), settings.compact_threshold));

    // Graceful shutdown: stop background work on SIGTERM/ctrl-c, then snapshot the WAL.
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await?;
    }

    info!("shutdown signal received");
    sweeps.abort();
    compactor.abort();

    if let Err(e) = engine.compact_wal().await {
        tracing::warn!("final compaction failed: {e}");
    }
    info!("deskbook stopped");
    Ok(())
}
