//! Retz scheduler entry point.
//!
//! Wires the store, admin bootstrap, status reporting and retention GC,
//! then idles until shutdown. The broker driver connects to the scheduler
//! core through [`retz_server::Dispatcher`].

use retz_adapters::{Store, StoreError};
use retz_core::User;
use retz_server::config::ServerConfig;
use retz_server::gc::RetentionGc;
use retz_server::status::{OfferSnapshot, StatusReporter};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = ServerConfig::load()?;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&config.logging.filter)?)
        .init();
    info!("starting retz scheduler {}", env!("CARGO_PKG_VERSION"));

    let store = Store::connect(&config.database.url, config.database.max_connections).await?;
    ensure_admin_user(&store, &config).await?;

    let offers = OfferSnapshot::new();
    let status = StatusReporter::new(store.clone(), offers.clone());
    let gc = RetentionGc::new(
        store.clone(),
        config.retention.leeway(),
        config.retention.interval(),
    );
    let gc_task = tokio::spawn(gc.run());

    let summary = status.report().await?;
    info!(
        "scheduler ready with planner '{}': {} queued, {} running",
        config.planner.strategy, summary.queue_length, summary.running_length
    );

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    gc_task.abort();
    store.stop().await;
    Ok(())
}

async fn ensure_admin_user(store: &Store, config: &ServerConfig) -> Result<(), StoreError> {
    if store.get_user(&config.admin.access_key).await?.is_some() {
        info!("admin user is {}", config.admin.access_key);
        return Ok(());
    }
    info!("no admin user found: creating {}", config.admin.access_key);
    let user = User::new(
        config.admin.access_key.clone(),
        config.admin.secret.clone(),
        true,
        config.admin.info.clone(),
    );
    store.add_user(&user).await
}
