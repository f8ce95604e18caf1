use anyhow::{Context, Result};
use signage::cache::{spawn_sweeper, CacheEngine};
use signage::catalog::CatalogClient;
use signage::config::Settings;
use signage::mirror::{spawn_scheduled_sync, CatalogMirror};
use signage::player::PlaylistFeeder;
use signage::query::MediaQuery;
use signage::renderer::LogSurface;
use signage::scheduler::{Scheduler, SchedulerConfig};
use signage::server::{start_server, AppState, DeviceRegistry};
use signage::store::MediaStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,signage=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let settings = Settings::load()?;
    let client = reqwest::Client::new();
    let cancel = CancellationToken::new();
    let mut tasks = Vec::new();

    if settings.server.enabled {
        let store = MediaStore::open(&settings.database.path)
            .await
            .context("Failed to open mirror database")?;
        let catalog = CatalogClient::new(client.clone(), &settings.catalog);
        let mirror =
            Arc::new(CatalogMirror::new(catalog, store, settings.catalog.clone()).await?);

        tasks.push(spawn_scheduled_sync(
            mirror.clone(),
            Duration::from_secs(settings.catalog.sync_interval_secs.max(1)),
            cancel.clone(),
        ));

        let state = AppState {
            query: MediaQuery::new(mirror),
            devices: Arc::new(DeviceRegistry::new(
                Duration::from_secs(settings.server.device_ttl_secs),
                Duration::from_secs(settings.server.device_retention_secs),
            )),
        };
        let server = settings.server.clone();
        let server_cancel = cancel.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) =
                start_server(state, &server.bind_address, server.port, server_cancel).await
            {
                tracing::error!("HTTP server failed: {:#}", e);
            }
        }));
    }

    if settings.player.enabled {
        let cache = Arc::new(CacheEngine::open(&settings.cache, client.clone())?);
        tasks.push(spawn_sweeper(
            cache.clone(),
            Duration::from_secs(settings.cache.sweep_interval_secs.max(1)),
            cancel.clone(),
        ));

        let (playlist_tx, playlist_rx) = watch::channel(Vec::new());
        let feeder = PlaylistFeeder::new(client.clone(), &settings.player, cache.clone(), playlist_tx);
        tasks.push(feeder.spawn(cancel.clone()));

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let surface = LogSurface::new(
            events_tx,
            settings.player.video_runtime(),
        );
        let scheduler = Scheduler::new(
            cache,
            surface,
            events_rx,
            playlist_rx,
            SchedulerConfig::from(&settings.player),
            cancel.clone(),
        );
        tasks.push(tokio::spawn(async move {
            scheduler.run().await;
        }));
    }

    if tasks.is_empty() {
        tracing::warn!("Neither server nor player role is enabled, exiting");
        return Ok(());
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutting down");
    cancel.cancel();

    for task in tasks {
        let _ = task.await;
    }
    Ok(())
}
