mod broadcaster_cache;
mod color;
mod config;
mod error;
mod events;
mod fleet;
mod helix;
mod identity;
mod palette;
mod reconcile;
mod router;
mod supervisor;
mod token;
mod util;
mod ws;

use std::sync::Arc;

use anyhow::Context;
use broadcaster_cache::BroadcasterCache;
use config::ConfigStore;
use fleet::FleetManager;
use helix::HelixClient;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,twitch_color_cycler=debug".into()),
        )
        .init();

    if std::env::args().any(|a| a == "--health-check") {
        return health_check().await;
    }

    let conf_path = std::env::var("TWITCH_CONF_FILE").unwrap_or_else(|_| "config/users.json".into());
    let cache_path = std::env::var("TWITCH_BROADCASTER_CACHE").unwrap_or_else(|_| {
        let mut p = std::path::PathBuf::from(&conf_path);
        p.set_file_name("broadcaster_cache.json");
        p.to_string_lossy().into_owned()
    });

    let config = Arc::new(ConfigStore::new(&conf_path));
    let broadcaster_cache = BroadcasterCache::load(&cache_path).await;
    let helix = Arc::new(HelixClient::new());

    let fleet = Arc::new(FleetManager::new(config.clone(), broadcaster_cache, helix));

    fleet
        .start()
        .await
        .with_context(|| format!("failed to load identities from {conf_path}"))?;
    info!(path = %conf_path, "fleet manager started");

    {
        let config = config.clone();
        tokio::spawn(async move {
            config.run_flusher().await;
        });
    }

    let mut config_changes = config.clone().watch();
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("failed to install SIGTERM handler")?;

    let mut signalled = false;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received SIGINT, shutting down");
                signalled = true;
                break;
            }
            _ = sigterm.recv() => {
                info!("received SIGTERM, shutting down");
                signalled = true;
                break;
            }
            changed = config_changes.recv() => {
                match changed {
                    Some(()) => match config.load().await {
                        Ok(list) => fleet.reload(list).await,
                        Err(e) => tracing::warn!(error = %e, "failed to reload config after external edit"),
                    },
                    None => tracing::warn!("config watch channel closed"),
                }
            }
        }
    }

    fleet.shutdown().await;
    info!("shutdown complete");

    if signalled {
        std::process::exit(2);
    }
    Ok(())
}

/// `--health-check`: load the config file and exit 0/1 without
/// starting any supervisors or network activity. Intended for
/// container healthchecks and CI smoke tests.
async fn health_check() -> anyhow::Result<()> {
    let conf_path = std::env::var("TWITCH_CONF_FILE").unwrap_or_else(|_| "config/users.json".into());
    let store = ConfigStore::new(&conf_path);
    match store.load().await {
        Ok(list) => {
            println!("ok: {} identities configured", list.len());
            Ok(())
        }
        Err(e) => {
            eprintln!("health check failed: {e}");
            std::process::exit(1);
        }
    }
}
