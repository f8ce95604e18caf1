//! Player-side playlist feeder.
//!
//! Polls the server for the device's playlist, publishes it to the scheduler
//! through a watch channel and keeps a copy in the cache directory so the
//! device keeps playing when the server is unreachable.

use crate::cache::CacheEngine;
use crate::config::PlayerSettings;
use crate::media::MediaRecord;
use crate::server::PlaylistResponse;
use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, Local, TimeZone};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

pub struct PlaylistFeeder {
    client: reqwest::Client,
    server_url: String,
    group_key: String,
    device_id: Option<String>,
    cache: Arc<CacheEngine>,
    refresh: Duration,
    heartbeat: Duration,
    playlist: watch::Sender<Vec<MediaRecord>>,
}

impl PlaylistFeeder {
    pub fn new(
        client: reqwest::Client,
        settings: &PlayerSettings,
        cache: Arc<CacheEngine>,
        playlist: watch::Sender<Vec<MediaRecord>>,
    ) -> Self {
        Self {
            client,
            server_url: settings.server_url.trim_end_matches('/').to_string(),
            group_key: settings.group_key.clone(),
            device_id: settings.device_id.clone(),
            cache,
            refresh: Duration::from_secs(settings.refresh_secs.max(1)),
            heartbeat: Duration::from_secs(settings.heartbeat_secs.max(1)),
            playlist,
        }
    }

    /// Fetch the playlist valid at `now` from the server. The weekday is the
    /// one on the device's wall clock; the timestamp is absolute.
    pub async fn fetch_playlist<Tz: TimeZone>(
        &self,
        now: DateTime<Tz>,
    ) -> Result<Vec<MediaRecord>> {
        let url = format!(
            "{}/media/{}",
            self.server_url,
            urlencoding::encode(&self.group_key)
        );
        let response = self
            .client
            .get(&url)
            .query(&[
                ("day", now.weekday().num_days_from_sunday().to_string()),
                ("timestamp", now.timestamp_millis().to_string()),
            ])
            .send()
            .await
            .context("Playlist request failed")?
            .error_for_status()
            .context("Server rejected playlist request")?;

        let body: PlaylistResponse = response
            .json()
            .await
            .context("Failed to parse playlist response")?;
        Ok(body.medias)
    }

    /// Refresh once. On failure the saved offline playlist is published if
    /// nothing is playing yet. Returns the number of items now published.
    pub async fn refresh(&self) -> usize {
        let items = match self.fetch_playlist(Local::now()).await {
            Ok(items) => {
                tracing::debug!("Fetched playlist with {} items", items.len());
                self.cache.save_playlist(&items);
                items
            }
            Err(e) => {
                tracing::warn!("Playlist refresh failed: {:#}", e);
                let playing = self.playlist.borrow().len();
                if playing > 0 {
                    return playing;
                }
                self.cache.load_playlist()
            }
        };

        let count = items.len();
        self.playlist.send_if_modified(|current| {
            if *current == items {
                return false;
            }
            *current = items;
            true
        });
        count
    }

    pub async fn send_heartbeat(&self) -> Result<()> {
        let Some(device_id) = &self.device_id else {
            return Ok(());
        };
        let url = format!(
            "{}/devices/{}/heartbeat",
            self.server_url,
            urlencoding::encode(device_id)
        );
        self.client
            .post(&url)
            .json(&serde_json::json!({ "group_key": self.group_key }))
            .send()
            .await
            .context("Heartbeat request failed")?
            .error_for_status()
            .context("Server rejected heartbeat")?;
        Ok(())
    }

    /// Refresh and heartbeat on their intervals until cancelled.
    pub fn spawn(self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut refresh = tokio::time::interval(self.refresh);
            let mut heartbeat = tokio::time::interval(self.heartbeat);
            refresh.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = refresh.tick() => {
                        self.refresh().await;
                    }
                    _ = heartbeat.tick() => {
                        if let Err(e) = self.send_heartbeat().await {
                            tracing::debug!("{:#}", e);
                        }
                    }
                }
            }
            tracing::debug!("Playlist feeder stopped");
        })
    }
}
