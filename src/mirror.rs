//! Catalog mirror.
//!
//! Pages through the remote catalog and replaces the local mirror with the
//! result. Only one sync body runs at a time per mirror: a call that finds
//! another sync in flight returns [`SyncOutcome::Skipped`] instead of waiting.

use crate::catalog::CatalogClient;
use crate::config::{CatalogSettings, ReplaceStrategy};
use crate::error::{StoreError, SyncError};
use crate::media::{MediaRecord, RemoteMedia};
use crate::store::{MediaStore, Table};
use chrono::{DateTime, Utc};
use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, MutexGuard, RwLock};
use tokio_util::sync::CancellationToken;

/// Summary of a completed sync pass.
#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub fetched: usize,
    /// Catalog items dropped as malformed before storage.
    pub skipped: usize,
    pub inserted: usize,
    pub failed: usize,
    pub pages: usize,
    pub duration_ms: u64,
    pub finished_at: DateTime<Utc>,
}

/// Result of [`CatalogMirror::trigger_sync`].
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SyncOutcome {
    /// The mirror was replaced.
    Completed(SyncReport),
    /// Another sync was already running; nothing was done.
    Skipped,
}

/// Freshness snapshot for the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct SyncStatus {
    pub last_sync_at: Option<DateTime<Utc>>,
    pub sync_in_progress: bool,
    pub stale: bool,
    pub last_report: Option<SyncReport>,
}

/// Mirrors the remote catalog into a [`MediaStore`].
pub struct CatalogMirror {
    client: CatalogClient,
    store: MediaStore,
    settings: CatalogSettings,
    /// Single-flight guard. Held for the whole sync body.
    in_flight: Mutex<()>,
    syncing: AtomicBool,
    last_sync_at: RwLock<Option<DateTime<Utc>>>,
    last_report: RwLock<Option<SyncReport>>,
}

impl CatalogMirror {
    /// Build a mirror, restoring the persisted freshness timestamp.
    pub async fn new(
        client: CatalogClient,
        store: MediaStore,
        settings: CatalogSettings,
    ) -> Result<Self, StoreError> {
        let last_sync_at = store
            .last_sync_at()
            .await?
            .and_then(DateTime::<Utc>::from_timestamp_millis);

        Ok(Self {
            client,
            store,
            settings,
            in_flight: Mutex::new(()),
            syncing: AtomicBool::new(false),
            last_sync_at: RwLock::new(last_sync_at),
            last_report: RwLock::new(None),
        })
    }

    pub fn store(&self) -> &MediaStore {
        &self.store
    }

    pub async fn last_sync_at(&self) -> Option<DateTime<Utc>> {
        *self.last_sync_at.read().await
    }

    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::SeqCst)
    }

    /// True when there is no prior sync or the last one is older than the
    /// freshness window.
    pub async fn should_sync(&self) -> bool {
        match *self.last_sync_at.read().await {
            None => true,
            Some(last) => {
                let age = Utc::now().signed_duration_since(last);
                age.to_std().map_or(false, |age| age > self.settings.freshness())
            }
        }
    }

    pub async fn status(&self) -> SyncStatus {
        SyncStatus {
            last_sync_at: self.last_sync_at().await,
            sync_in_progress: self.is_syncing(),
            stale: self.should_sync().await,
            last_report: self.last_report.read().await.clone(),
        }
    }

    /// Run one sync pass unless another is already running.
    pub async fn trigger_sync(&self) -> Result<SyncOutcome, SyncError> {
        let Ok(lock) = self.in_flight.try_lock() else {
            tracing::info!("Sync already in progress, skipping request");
            return Ok(SyncOutcome::Skipped);
        };
        let _guard = SyncGuard::new(lock, &self.syncing);

        let started = Instant::now();
        tracing::info!("Catalog sync started");

        let Fetched {
            records,
            pages,
            skipped,
        } = self.fetch_all().await?;
        if records.is_empty() {
            tracing::warn!("Catalog sync fetched no items, keeping existing mirror");
            return Err(SyncError::EmptyCatalog);
        }

        let fetched = records.len();
        let (inserted, failed) = self.replace_all(records).await?;

        let finished_at = Utc::now();
        self.store.set_last_sync_at(finished_at.timestamp_millis()).await?;
        *self.last_sync_at.write().await = Some(finished_at);

        let report = SyncReport {
            fetched,
            skipped,
            inserted,
            failed,
            pages,
            duration_ms: started.elapsed().as_millis() as u64,
            finished_at,
        };
        *self.last_report.write().await = Some(report.clone());

        tracing::info!(
            "Catalog sync finished: {} fetched, {} skipped, {} stored, {} failed in {} ms",
            report.fetched,
            report.skipped,
            report.inserted,
            report.failed,
            report.duration_ms
        );
        Ok(SyncOutcome::Completed(report))
    }

    /// Page through the catalog. Errors after the first page stop paging but
    /// keep what was already fetched.
    async fn fetch_all(&self) -> Result<Fetched, SyncError> {
        let mut items: Vec<RemoteMedia> = Vec::new();
        let mut skipped = 0;

        let first = self.client.fetch_page(0).await.map_err(|e| {
            tracing::error!("Failed to fetch first catalog page: {}", e);
            SyncError::Remote(e)
        })?;
        let total = first.total;
        let mut offset = first.medias.len() as u64;
        let mut pages = 1;
        let (decoded, rejected) = first.into_items();
        items.extend(decoded);
        skipped += rejected;
        tracing::debug!("Catalog reports {} items", total);

        while offset < total {
            tokio::time::sleep(self.settings.page_delay()).await;

            match self.client.fetch_page(offset).await {
                Ok(page) if page.medias.is_empty() => {
                    tracing::debug!("Empty catalog page at offset {}", offset);
                    break;
                }
                Ok(page) => {
                    pages += 1;
                    offset += page.medias.len() as u64;
                    let (decoded, rejected) = page.into_items();
                    items.extend(decoded);
                    skipped += rejected;
                }
                Err(e) => {
                    tracing::warn!(
                        "Catalog page at offset {} failed, keeping {} items: {}",
                        offset,
                        items.len(),
                        e
                    );
                    break;
                }
            }
        }

        let records = items
            .into_iter()
            .enumerate()
            .map(|(i, item)| item.into_record(i as i64))
            .collect();
        Ok(Fetched {
            records,
            pages,
            skipped,
        })
    }

    /// Replace the mirror contents. Returns (inserted, failed) row counts.
    async fn replace_all(&self, records: Vec<MediaRecord>) -> Result<(usize, usize), StoreError> {
        let table = match self.settings.replace_strategy {
            ReplaceStrategy::ClearThenInsert => Table::Live,
            ReplaceStrategy::Staged => Table::Staging,
        };
        let cleared = self.store.clear(table).await?;
        tracing::debug!("Cleared {} rows before insert", cleared);

        let batch_size = self.settings.batch_size.max(1);
        let parallelism = self.settings.batch_parallelism.max(1);
        let mut inserted = 0;
        let mut failed = 0;

        for batch in records.chunks(batch_size) {
            let results: Vec<_> = stream::iter(batch.to_vec())
                .map(|record| {
                    let store = self.store.clone();
                    async move {
                        store
                            .upsert(table, &record)
                            .await
                            .map_err(|e| (record.external_id.clone(), e))
                    }
                })
                .buffer_unordered(parallelism)
                .collect()
                .await;

            for result in results {
                match result {
                    Ok(()) => inserted += 1,
                    Err((id, e)) => {
                        failed += 1;
                        tracing::warn!("Failed to store media {}: {}", id, e);
                    }
                }
            }
        }

        if table == Table::Staging {
            self.store.promote_staging().await?;
        }

        Ok((inserted, failed))
    }
}

struct Fetched {
    records: Vec<MediaRecord>,
    pages: usize,
    skipped: usize,
}

/// Holds the single-flight lock and mirrors it into the `syncing` flag.
struct SyncGuard<'a> {
    _lock: MutexGuard<'a, ()>,
    flag: &'a AtomicBool,
}

impl<'a> SyncGuard<'a> {
    fn new(lock: MutexGuard<'a, ()>, flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self { _lock: lock, flag }
    }
}

impl Drop for SyncGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// Run `trigger_sync` on a fixed interval until cancelled.
pub fn spawn_scheduled_sync(
    mirror: Arc<CatalogMirror>,
    interval: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = mirror.trigger_sync().await {
                        tracing::error!("Scheduled sync failed: {}", e);
                    }
                }
            }
        }
        tracing::debug!("Scheduled sync stopped");
    })
}
