//! On-device asset cache.
//!
//! Stores downloaded media as files named by the SHA-256 of their canonical
//! URL, with a JSON index of per-entry metadata. Entries expire after
//! `max_age` and are also dropped once they have been idle for `max_age`.
//! The size ceiling is enforced by an opportunistic sweep after writes, so it
//! is a soft bound unless `hard_ceiling` is set.
//!
//! Public operations never fail: network and storage errors are logged and
//! resolve to a safe default.

use crate::config::CacheSettings;
use crate::media::{MediaKind, MediaRecord};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use url::Url;
use walkdir::WalkDir;

const INDEX_FILE: &str = "index.json";
const INDEX_TMP_FILE: &str = "index.json.tmp";
const PLAYLIST_FILE: &str = "playlist.json";

/// Metadata for a cached asset.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheEntry {
    url: String,
    kind: MediaKind,
    file: String,
    size: u64,
    last_accessed_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl CacheEntry {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    fn is_idle(&self, now: DateTime<Utc>, max_age: chrono::Duration) -> bool {
        now.signed_duration_since(self.last_accessed_at) > max_age
    }
}

/// In-memory view of the index. Iteration order of `entries` is recency.
struct CacheIndex {
    entries: LruCache<String, CacheEntry>,
    total_size: u64,
}

impl CacheIndex {
    fn new() -> Self {
        Self {
            entries: LruCache::unbounded(),
            total_size: 0,
        }
    }

    fn insert(&mut self, key: String, entry: CacheEntry) {
        self.total_size += entry.size;
        if let Some(old) = self.entries.put(key, entry) {
            self.total_size = self.total_size.saturating_sub(old.size);
        }
    }

    fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let entry = self.entries.pop(key)?;
        self.total_size = self.total_size.saturating_sub(entry.size);
        Some(entry)
    }
}

/// A cached payload on disk.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedBlob {
    pub url: String,
    pub kind: MediaKind,
    pub path: PathBuf,
    pub size: u64,
}

impl CachedBlob {
    pub async fn read(&self) -> std::io::Result<Vec<u8>> {
        tokio::fs::read(&self.path).await
    }
}

/// What a caller should render: a local blob, or the original URL when the
/// asset could not be cached.
#[derive(Debug, Clone, PartialEq)]
pub enum CachedMedia {
    Blob(CachedBlob),
    Remote(String),
}

/// Cache statistics.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub item_count: usize,
    pub current_size: u64,
    pub max_size: u64,
}

/// Result of a sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub removed: usize,
    pub freed: u64,
}

/// Local blob store keyed by asset URL.
pub struct CacheEngine {
    cache_dir: PathBuf,
    client: reqwest::Client,
    max_size: u64,
    max_age: chrono::Duration,
    hard_ceiling: bool,
    request_timeout: Duration,
    index: Mutex<CacheIndex>,
    tmp_counter: AtomicU64,
}

impl CacheEngine {
    /// Open the cache in `settings.dir`, restoring the persisted index and
    /// removing payload files the index does not know about.
    pub fn open(settings: &CacheSettings, client: reqwest::Client) -> Result<Self> {
        fs::create_dir_all(&settings.dir).context("Failed to create cache directory")?;
        let max_age = chrono::Duration::from_std(settings.max_age())
            .context("Cache max age out of range")?;

        let (index, index_readable) = load_index(&settings.dir);
        let engine = Self {
            cache_dir: settings.dir.clone(),
            client,
            max_size: settings.max_size_bytes(),
            max_age,
            hard_ceiling: settings.hard_ceiling,
            request_timeout: Duration::from_millis(settings.request_timeout_ms),
            index: Mutex::new(index),
            tmp_counter: AtomicU64::new(0),
        };
        if index_readable {
            engine.remove_orphans();
        } else {
            tracing::warn!("Cache index unreadable, keeping payload files until it is rewritten");
        }

        let stats = engine.stats_blocking();
        tracing::info!(
            "Cache initialized: {} items, {:.2} MB / {:.2} MB used",
            stats.item_count,
            stats.current_size as f64 / 1024.0 / 1024.0,
            stats.max_size as f64 / 1024.0 / 1024.0
        );
        Ok(engine)
    }

    /// Return the cached blob for `url`, fetching and storing it on a miss.
    /// Falls back to the original URL when the fetch fails.
    pub async fn cache_media(&self, url: &str, kind: MediaKind) -> CachedMedia {
        self.cache_media_with_cancel(url, kind, &CancellationToken::new())
            .await
    }

    /// Like [`cache_media`](Self::cache_media), but a cancelled token aborts an
    /// in-flight fetch and resolves to the original URL.
    pub async fn cache_media_with_cancel(
        &self,
        url: &str,
        kind: MediaKind,
        cancel: &CancellationToken,
    ) -> CachedMedia {
        let key = canonical_url(url);
        let now = Utc::now();

        if let Some(blob) = self.lookup_fresh(&key, now).await {
            return CachedMedia::Blob(blob);
        }

        let bytes = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::debug!("Fetch of {} cancelled", url);
                return CachedMedia::Remote(url.to_string());
            }
            result = self.download(url) => match result {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::warn!("Failed to cache {}, streaming directly: {:#}", url, e);
                    return CachedMedia::Remote(url.to_string());
                }
            }
        };

        match self.store(key, url, kind, &bytes).await {
            Ok(blob) => CachedMedia::Blob(blob),
            Err(e) => {
                tracing::warn!("Failed to store {} in cache: {:#}", url, e);
                CachedMedia::Remote(url.to_string())
            }
        }
    }

    /// Pure lookup. Never fetches and does not touch access times.
    pub async fn get_media_blob(&self, url: &str) -> Option<CachedBlob> {
        let key = canonical_url(url);
        let index = self.index.lock().await;
        let entry = index.entries.peek(&key)?;
        let path = self.cache_dir.join(&entry.file);
        path.exists().then(|| blob_from(entry, path))
    }

    /// Remove expired and idle entries.
    pub async fn cleanup(&self) -> CleanupReport {
        self.cleanup_at(Utc::now()).await
    }

    pub(crate) async fn cleanup_at(&self, now: DateTime<Utc>) -> CleanupReport {
        let mut index = self.index.lock().await;
        let report = self.sweep(&mut index, now);
        self.persist(&index).await;
        report
    }

    /// Delete every cached asset.
    pub async fn clear_all(&self) {
        let mut index = self.index.lock().await;
        let count = index.entries.len();
        for (_, entry) in index.entries.iter() {
            self.remove_file(&entry.file);
        }
        index.entries.clear();
        index.total_size = 0;
        self.persist(&index).await;
        tracing::info!("Cleared {} cached assets", count);
    }

    pub async fn stats(&self) -> CacheStats {
        let index = self.index.lock().await;
        CacheStats {
            item_count: index.entries.len(),
            current_size: index.total_size,
            max_size: self.max_size,
        }
    }

    fn stats_blocking(&self) -> CacheStats {
        match self.index.try_lock() {
            Ok(index) => CacheStats {
                item_count: index.entries.len(),
                current_size: index.total_size,
                max_size: self.max_size,
            },
            Err(_) => CacheStats {
                item_count: 0,
                current_size: 0,
                max_size: self.max_size,
            },
        }
    }

    /// Save the current playlist for offline use.
    pub fn save_playlist(&self, playlist: &[MediaRecord]) {
        let path = self.cache_dir.join(PLAYLIST_FILE);
        let result = serde_json::to_string_pretty(playlist)
            .context("Failed to serialize playlist")
            .and_then(|json| fs::write(&path, json).context("Failed to write playlist"));
        match result {
            Ok(()) => tracing::debug!("Saved playlist with {} items", playlist.len()),
            Err(e) => tracing::warn!("{:#}", e),
        }
    }

    /// Load the last saved playlist, or an empty one.
    pub fn load_playlist(&self) -> Vec<MediaRecord> {
        let path = self.cache_dir.join(PLAYLIST_FILE);
        if !path.exists() {
            return Vec::new();
        }
        let result = fs::read_to_string(&path)
            .context("Failed to read playlist")
            .and_then(|json| {
                serde_json::from_str::<Vec<MediaRecord>>(&json).context("Failed to parse playlist")
            });
        match result {
            Ok(playlist) => {
                tracing::info!("Loaded cached playlist with {} items", playlist.len());
                playlist
            }
            Err(e) => {
                tracing::warn!("{:#}", e);
                Vec::new()
            }
        }
    }

    async fn lookup_fresh(&self, key: &str, now: DateTime<Utc>) -> Option<CachedBlob> {
        let mut index = self.index.lock().await;
        let (file, expired) = index
            .entries
            .get(key)
            .map(|e| (e.file.clone(), e.is_expired(now)))?;
        if expired {
            return None;
        }

        let path = self.cache_dir.join(file);
        if !path.exists() {
            tracing::debug!("Cached file for {} is missing, refetching", key);
            index.remove(key);
            self.persist(&index).await;
            return None;
        }

        // Access times reach disk with the next write or sweep.
        let entry = index.entries.get_mut(key)?;
        entry.last_accessed_at = now;
        Some(blob_from(entry, path))
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>> {
        tracing::debug!("Downloading {}", url);
        let response = self
            .client
            .get(url)
            .timeout(self.request_timeout)
            .send()
            .await
            .context("Failed to send request")?
            .error_for_status()
            .context("Server returned error")?;
        let bytes = response.bytes().await.context("Failed to read response")?;
        Ok(bytes.to_vec())
    }

    async fn store(
        &self,
        key: String,
        url: &str,
        kind: MediaKind,
        bytes: &[u8],
    ) -> Result<CachedBlob> {
        let file = file_name(&key, kind);
        let path = self.cache_dir.join(&file);
        let tmp = self.cache_dir.join(format!(
            "{}.{}.part",
            file,
            self.tmp_counter.fetch_add(1, Ordering::Relaxed)
        ));

        tokio::fs::write(&tmp, bytes)
            .await
            .context("Failed to write cache file")?;
        tokio::fs::rename(&tmp, &path)
            .await
            .context("Failed to move cache file into place")?;

        let now = Utc::now();
        let entry = CacheEntry {
            url: url.to_string(),
            kind,
            file,
            size: bytes.len() as u64,
            last_accessed_at: now,
            expires_at: now + self.max_age,
        };
        let blob = blob_from(&entry, path);

        let mut index = self.index.lock().await;
        index.insert(key.clone(), entry);
        tracing::debug!(
            "Cached {} ({:.2} KB), total: {:.2} MB",
            url,
            blob.size as f64 / 1024.0,
            index.total_size as f64 / 1024.0 / 1024.0
        );
        if index.total_size > self.max_size {
            let report = self.sweep(&mut index, now);
            tracing::debug!(
                "Cache over ceiling, swept {} entries ({} bytes)",
                report.removed,
                report.freed
            );
        }
        self.persist(&index).await;

        if !index.entries.contains(&key) {
            anyhow::bail!("Asset larger than the cache ceiling");
        }
        Ok(blob)
    }

    fn sweep(&self, index: &mut CacheIndex, now: DateTime<Utc>) -> CleanupReport {
        let stale: Vec<String> = index
            .entries
            .iter()
            .filter(|(_, e)| e.is_expired(now) || e.is_idle(now, self.max_age))
            .map(|(k, _)| k.clone())
            .collect();

        let mut report = CleanupReport::default();
        for key in stale {
            if let Some(entry) = index.remove(&key) {
                self.remove_file(&entry.file);
                report.removed += 1;
                report.freed += entry.size;
            }
        }

        if self.hard_ceiling {
            while index.total_size > self.max_size {
                let Some((key, entry)) = index.entries.pop_lru() else {
                    break;
                };
                tracing::debug!("Evicting least recently used {}", key);
                index.total_size = index.total_size.saturating_sub(entry.size);
                self.remove_file(&entry.file);
                report.removed += 1;
                report.freed += entry.size;
            }
        }

        if report.removed > 0 {
            tracing::info!(
                "Cache cleanup removed {} entries ({:.2} MB)",
                report.removed,
                report.freed as f64 / 1024.0 / 1024.0
            );
        }
        report
    }

    fn remove_file(&self, file: &str) {
        let path = self.cache_dir.join(file);
        if path.exists() {
            if let Err(e) = fs::remove_file(&path) {
                tracing::warn!("Failed to remove cached file {:?}: {}", path, e);
            }
        }
    }

    /// Write the index next to the payloads and rename it into place.
    async fn persist(&self, index: &CacheIndex) {
        let path = self.cache_dir.join(INDEX_FILE);
        let tmp = self.cache_dir.join(INDEX_TMP_FILE);
        let result = async {
            let json = index_json(index)?;
            tokio::fs::write(&tmp, json)
                .await
                .context("Failed to write cache index")?;
            tokio::fs::rename(&tmp, &path)
                .await
                .context("Failed to move cache index into place")
        }
        .await;
        if let Err(e) = result {
            tracing::warn!("{:#}", e);
        }
    }

    fn persist_blocking(&self, index: &CacheIndex) {
        let path = self.cache_dir.join(INDEX_FILE);
        let tmp = self.cache_dir.join(INDEX_TMP_FILE);
        let result = index_json(index)
            .and_then(|json| fs::write(&tmp, json).context("Failed to write cache index"))
            .and_then(|()| fs::rename(&tmp, &path).context("Failed to move cache index into place"));
        if let Err(e) = result {
            tracing::warn!("{:#}", e);
        }
    }

    /// Drop index entries without a payload and payload files without an
    /// index entry.
    fn remove_orphans(&self) {
        let Ok(mut index) = self.index.try_lock() else {
            return;
        };

        let missing: Vec<String> = index
            .entries
            .iter()
            .filter(|(_, e)| !self.cache_dir.join(&e.file).exists())
            .map(|(k, _)| k.clone())
            .collect();
        for key in &missing {
            index.remove(key);
        }

        let known: HashSet<&str> = index.entries.iter().map(|(_, e)| e.file.as_str()).collect();
        let mut orphans = 0;
        for entry in WalkDir::new(&self.cache_dir)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
        {
            let Some(name) = entry.file_name().to_str() else {
                continue;
            };
            if name == INDEX_FILE || name == PLAYLIST_FILE || known.contains(name) {
                continue;
            }
            tracing::debug!("Removing orphaned cache file: {}", name);
            if fs::remove_file(entry.path()).is_ok() {
                orphans += 1;
            }
        }

        if !missing.is_empty() || orphans > 0 {
            tracing::info!(
                "Cache reconciled: {} missing payloads, {} orphaned files",
                missing.len(),
                orphans
            );
            self.persist_blocking(&index);
        }
    }
}

/// Run [`CacheEngine::cleanup`] on a fixed interval until cancelled.
pub fn spawn_sweeper(
    engine: Arc<CacheEngine>,
    interval: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    engine.cleanup().await;
                }
            }
        }
    })
}

/// Normalize an asset URL into its cache key. Unparseable URLs are used as is.
pub fn canonical_url(url: &str) -> String {
    match Url::parse(url.trim()) {
        Ok(mut parsed) => {
            parsed.set_fragment(None);
            parsed.to_string()
        }
        Err(_) => url.to_string(),
    }
}

fn file_name(key: &str, kind: MediaKind) -> String {
    let digest = Sha256::digest(key.as_bytes());
    let extension = match kind {
        MediaKind::Image => "img",
        MediaKind::Video => "mp4",
    };
    format!("{:x}.{}", digest, extension)
}

fn blob_from(entry: &CacheEntry, path: PathBuf) -> CachedBlob {
    CachedBlob {
        url: entry.url.clone(),
        kind: entry.kind,
        path,
        size: entry.size,
    }
}

/// Entries oldest first, so reloading with `put` restores recency order.
fn index_json(index: &CacheIndex) -> Result<Vec<u8>> {
    let entries: Vec<&CacheEntry> = index.entries.iter().rev().map(|(_, e)| e).collect();
    serde_json::to_vec(&entries).context("Failed to serialize cache index")
}

/// Read the persisted index. The flag is false when an index file exists but
/// could not be parsed.
fn load_index(dir: &Path) -> (CacheIndex, bool) {
    let mut index = CacheIndex::new();
    let path = dir.join(INDEX_FILE);
    if !path.exists() {
        return (index, true);
    }

    let entries = fs::read(&path)
        .context("Failed to read cache index")
        .and_then(|bytes| {
            serde_json::from_slice::<Vec<CacheEntry>>(&bytes).context("Failed to parse cache index")
        });
    match entries {
        Ok(entries) => {
            for entry in entries {
                index.insert(canonical_url(&entry.url), entry);
            }
            (index, true)
        }
        Err(e) => {
            tracing::warn!("{:#}, starting with an empty cache", e);
            (index, false)
        }
    }
}
