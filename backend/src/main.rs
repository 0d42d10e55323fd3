use std::sync::Arc;

use backend::{config::AppConfig, core::Core};
use common::logger::init_tracing;
use provider::HttpVoiceProvider;
use tokio::sync::watch;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    sqlx::any::install_default_drivers();

    let cfg = AppConfig::from_env();
    init_tracing(cfg.json_logs);

    tracing::info!("Starting dialcast backend...");

    let provider = Arc::new(HttpVoiceProvider::new(
        cfg.provider_base_url.clone(),
        cfg.provider_api_key.clone(),
        cfg.provider_timeout,
    )?);

    let core = Core::init(cfg, provider).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles = core.spawn_loops(shutdown_rx);

    tracing::info!(
        system_limit = core.cfg.system_limit,
        default_user_limit = core.cfg.default_user_limit,
        "Backend started; waiting for shutdown signal"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");

    let _ = shutdown_tx.send(true);
    for handle in handles {
        let _ = handle.await;
    }

    tracing::info!("Backend stopped");

    Ok(())
}
