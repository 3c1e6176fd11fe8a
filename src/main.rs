use std::sync::Arc;

use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use parkledger::config::LedgerConfig;
use parkledger::gateway::{LogSink, NotificationSink, run_dispatcher};
use parkledger::ledger::Ledger;
use parkledger::notify::NotifyHub;
use parkledger::sweeper::{SweepState, Sweeper, run_compactor, run_sweeper};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parkledger=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = LedgerConfig::from_env();
    parkledger::observability::init(config.metrics_port)?;

    std::fs::create_dir_all(&config.data_dir)?;

    let notify = Arc::new(NotifyHub::new());
    let sinks: Vec<Arc<dyn NotificationSink>> = vec![Arc::new(LogSink)];
    let dispatcher = tokio::spawn(run_dispatcher(notify.subscribe_all(), sinks));

    let ledger = Arc::new(Ledger::open(config.wal_path(), notify)?.with_tariff(config.tariff.clone()));

    let sweeper = Sweeper::new(ledger.clone(), config.sweep, SweepState::default());
    let sweep_task = tokio::spawn(run_sweeper(sweeper, config.sweep_interval));
    let compact_task = tokio::spawn(run_compactor(ledger.clone(), config.compact_threshold));

    info!("parkledger started");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  zones: {}, spots: {}, reservations: {}", ledger.list_zones().len(), ledger.spot_count(), ledger.reservation_count());
    info!("  sweep every {:?}, no-show grace {} min", config.sweep_interval, config.sweep.no_show_grace.num_minutes());
    info!("  metrics: {}", config.metrics_port.map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics")));

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
        ctrl_c.await.ok();
    }

    info!("shutdown signal received");
    sweep_task.abort();
    compact_task.abort();
    dispatcher.abort();
    info!("parkledger stopped");
    Ok(())
}
