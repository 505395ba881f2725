use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use aprs2_catalog::ConfigManager;
use aprs2_metrics::Graphite;
use aprs2_poller::settings::PollerSettings;
use aprs2_poller::{PollerCtx, api, orchestrator};
use aprs2_store::{Db, RedisStore};
use clap::Parser;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, env = "APRS2_CONFIG", default_value = "poller.conf")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let cli = Cli::parse();
    let settings = PollerSettings::load(&cli.config)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        site = %settings.site_descr,
        "aprs2net poller starting up"
    );

    let store = RedisStore::connect(&settings.redis_url)
        .await
        .context("Failed to connect to the store")?;
    let db = Db::new(Arc::new(store));

    db.set_web_config(&serde_json::json!({ "site_descr": settings.site_descr }))
        .await
        .context("Failed to store web UI config")?;

    let config_manager = ConfigManager::new(
        db.clone(),
        settings.portal_rotates_url.clone(),
        settings.portal_credentials(),
    )
    .context("Failed to set up the portal config manager")?;
    tokio::spawn(config_manager.run());

    let listener = tokio::net::TcpListener::bind(settings.listen)
        .await
        .with_context(|| format!("Failed to bind API listener on {}", settings.listen))?;
    tracing::info!("Serving status API on {}", settings.listen);
    let api = api::router(db.clone());
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, api).await {
            tracing::error!("API server failed: {e}");
        }
    });

    let graphite = match &settings.graphite_server {
        Some(addr) => Graphite::spawn(addr.clone()),
        None => Graphite::disabled(),
    };

    let ctx = Arc::new(PollerCtx::new(db, graphite, settings)?);

    tokio::select! {
        result = orchestrator::run(ctx) => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal, exiting");
            Ok(())
        }
    }
}
