mod app;
mod codec;
mod config;
mod engine;
mod routes;
mod services;
mod state;
mod store;
mod store_migrations;
mod upstream;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use crate::config::{Config, SourceConfig};
use crate::state::{AppState, Source};
use crate::store::{CheckpointMode, StoreError, TileStore};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config_path = config::config_path();
    tracing::info!(path = %config_path.display(), "loading configuration");
    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "failed to load configuration");
            return;
        }
    };
    if config.sources.is_empty() {
        tracing::warn!("no sources configured; only the admin surface will be useful");
    }

    let data_dir = config::data_dir();
    let cancel = CancellationToken::new();
    let mut sources = HashMap::new();
    let mut tasks = Vec::new();

    for (name, source_config) in config.sources {
        let source = match open_source(&name, source_config, &data_dir).await {
            Ok(source) => Arc::new(source),
            Err(e) => {
                tracing::error!(source = %name, error = %e, "failed to open source");
                return;
            }
        };

        if source.config.autoscan.enabled {
            tasks.push(tokio::spawn(services::scanner::run(
                source.clone(),
                cancel.child_token(),
            )));
        }
        if source.config.gap_filling.enabled {
            tasks.push(tokio::spawn(services::reconstructor::run(
                source.clone(),
                cancel.child_token(),
            )));
        }
        tasks.push(tokio::spawn(services::checkpointer::run(
            source.clone(),
            cancel.child_token(),
        )));

        tracing::info!(source = %name, "source ready");
        sources.insert(name, source);
    }

    let state = AppState::new(sources);
    let app = app::build_app(state.clone());

    let addr = format!("0.0.0.0:{}", config::server_port());
    tracing::info!("Strata tile proxy listening on {addr}");
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(error = %e, %addr, "failed to bind TCP listener");
            return;
        }
    };
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        tracing::error!(error = %e, "server failed");
    }

    // Cooperative shutdown: cancel every background task, join each with a
    // small budget, then fold the WAL back into the main files.
    cancel.cancel();
    for task in tasks {
        if tokio::time::timeout(config::SHUTDOWN_JOIN_TIMEOUT, task)
            .await
            .is_err()
        {
            tracing::warn!("background task did not stop within the shutdown budget");
        }
    }
    for (name, source) in state.sources.iter() {
        if let Err(e) = source.store.checkpoint(CheckpointMode::Truncate).await {
            tracing::warn!(source = %name, error = %e, "final checkpoint failed");
        }
        source.store.close().await;
    }

    tracing::info!("Server shut down gracefully");
}

async fn open_source(
    name: &str,
    source_config: SourceConfig,
    data_dir: &std::path::Path,
) -> Result<Source, Box<dyn std::error::Error>> {
    let path = source_config.mbtiles_path(name, data_dir);
    tracing::info!(source = %name, path = %path.display(), "opening tile store");
    let store = TileStore::open(&path).await?;

    sync_metadata(&store, name, &source_config).await?;

    if source_config.cleanup_out_of_bounds {
        if let Some(bounds) = source_config
            .metadata
            .bounds
            .as_deref()
            .and_then(strata_shared::LngLatBounds::parse)
        {
            let deleted = store
                .cleanup_out_of_bounds(&bounds, source_config.minzoom, source_config.maxzoom)
                .await?;
            if deleted > 0 {
                tracing::info!(source = %name, deleted, "out-of-bounds cleanup finished");
            }
        } else {
            tracing::warn!(source = %name, "cleanup_out_of_bounds set but metadata.bounds missing");
        }
    }

    store.reset_interrupted_scans(name).await?;

    Ok(Source::new(name, source_config, store)?)
}

/// Keep the per-source metadata table in sync with the configuration, so
/// the file stays readable by standard MBTiles tooling.
async fn sync_metadata(
    store: &TileStore,
    name: &str,
    config: &SourceConfig,
) -> Result<(), StoreError> {
    store.set_metadata("name", name).await?;
    store.set_metadata("format", &config.metadata.format).await?;
    store
        .set_metadata("tileSize", &config.metadata.tile_size.to_string())
        .await?;
    store
        .set_metadata("minzoom", &config.minzoom.to_string())
        .await?;
    store
        .set_metadata("maxzoom", &config.maxzoom.to_string())
        .await?;
    store
        .set_metadata("type", &config.metadata.layer_type)
        .await?;
    store
        .set_metadata("encoding", &config.metadata.encoding)
        .await?;
    if let Some(bounds) = &config.metadata.bounds {
        store.set_metadata("bounds", bounds).await?;
    }
    if let Some(center) = &config.metadata.center {
        store.set_metadata("center", center).await?;
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                return;
            }
        };
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
