//! Playback scheduler.
//!
//! Drives a [`Surface`] from the current playlist. While one slot is visible
//! the next playlist item is fetched through the [`CacheEngine`] into the
//! other slot; the swap waits for that load to resolve, so the screen never
//! goes blank between items. Images advance on a timer, videos on the
//! surface's playback-ended event.

use crate::cache::{CacheEngine, CachedMedia};
use crate::config::{PlayerSettings, MAX_PLAYBACK_SECS};
use crate::media::MediaRecord;
use crate::playback::{DoubleBuffer, Playlist, SlotId};
use crate::renderer::{LoadedMedia, Surface, SurfaceEvent, Transition};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Display time for images without their own duration.
    pub image_duration: Duration,
    pub transition: Transition,
    pub transition_ms: u32,
}

impl From<&PlayerSettings> for SchedulerConfig {
    fn from(settings: &PlayerSettings) -> Self {
        Self {
            image_duration: settings.image_duration(),
            transition: settings.transition,
            transition_ms: settings.transition_ms,
        }
    }
}

/// Counters returned when the scheduler stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlaybackStats {
    pub swaps: u64,
    pub load_errors: u64,
}

struct PendingLoad {
    generation: u64,
    slot: SlotId,
    token: CancellationToken,
}

struct LoadDone {
    generation: u64,
    slot: SlotId,
    record: MediaRecord,
    source: CachedMedia,
}

enum Step {
    Advanced,
    Empty,
    Stop,
}

pub struct Scheduler<S: Surface> {
    cache: Arc<CacheEngine>,
    surface: S,
    surface_events: mpsc::UnboundedReceiver<SurfaceEvent>,
    events_open: bool,
    playlist_rx: watch::Receiver<Vec<MediaRecord>>,
    playlist_open: bool,
    playlist: Playlist,
    buffers: DoubleBuffer,
    config: SchedulerConfig,
    cancel: CancellationToken,
    load_tx: mpsc::UnboundedSender<LoadDone>,
    load_rx: mpsc::UnboundedReceiver<LoadDone>,
    pending: Option<PendingLoad>,
    generation: u64,
    failed: [bool; 2],
    stats: PlaybackStats,
}

impl<S: Surface> Scheduler<S> {
    pub fn new(
        cache: Arc<CacheEngine>,
        surface: S,
        surface_events: mpsc::UnboundedReceiver<SurfaceEvent>,
        playlist_rx: watch::Receiver<Vec<MediaRecord>>,
        config: SchedulerConfig,
        cancel: CancellationToken,
    ) -> Self {
        let (load_tx, load_rx) = mpsc::unbounded_channel();
        Self {
            cache,
            surface,
            surface_events,
            events_open: true,
            playlist_rx,
            playlist_open: true,
            playlist: Playlist::default(),
            buffers: DoubleBuffer::new(),
            config,
            cancel,
            load_tx,
            load_rx,
            pending: None,
            generation: 0,
            failed: [false; 2],
            stats: PlaybackStats::default(),
        }
    }

    /// Run until the cancellation token fires.
    pub async fn run(mut self) -> PlaybackStats {
        let initial = self.playlist_rx.borrow_and_update().clone();
        self.playlist = Playlist::new(initial);
        tracing::info!("Playback starting with {} items", self.playlist.len());

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            if self.playlist.is_empty() {
                if !self.wait_for_content().await {
                    break;
                }
                continue;
            }

            let Some(active) = self.buffers.active() else {
                if !self.show_first().await {
                    break;
                }
                continue;
            };

            match self.play_active(active).await {
                Step::Advanced => {}
                Step::Empty => continue,
                Step::Stop => break,
            }
        }

        self.teardown();
        self.stats
    }

    /// Load the item under the cursor and show it straight away.
    async fn show_first(&mut self) -> bool {
        if let Some(record) = self.playlist.current().cloned() {
            self.start_load(record);
        }
        if !self.finish_pending().await {
            return false;
        }
        if !self.present() {
            tokio::select! {
                _ = self.cancel.cancelled() => return false,
                _ = sleep(self.config.image_duration) => {}
            }
        }
        true
    }

    /// Keep `active` on screen until its advance trigger fires, preloading
    /// the next item meanwhile, then swap.
    async fn play_active(&mut self, active: SlotId) -> Step {
        let mut deadline = self.advance_deadline(active);
        if let Some(next) = self.playlist.peek_next().cloned() {
            self.start_load(next);
        }

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Step::Stop,
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => break,
                event = self.surface_events.recv(), if self.events_open => match event {
                    Some(SurfaceEvent::PlaybackEnded { slot }) if slot == active => break,
                    Some(SurfaceEvent::LoadError { slot, message }) if slot == active => {
                        tracing::warn!("Slot {} failed to load: {}", slot, message);
                        self.stats.load_errors += 1;
                        if deadline.is_none() {
                            deadline = Some(Instant::now() + self.config.image_duration);
                        }
                    }
                    Some(_) => {}
                    None => self.events_open = false,
                },
                Some(done) = self.load_rx.recv() => self.on_load_done(done),
                changed = self.playlist_rx.changed(), if self.playlist_open => {
                    if changed.is_err() {
                        self.playlist_open = false;
                        continue;
                    }
                    let items = self.playlist_rx.borrow_and_update().clone();
                    tracing::info!("Playlist updated: {} items", items.len());
                    self.abort_pending();
                    self.playlist.replace(items);
                    if self.playlist.is_empty() {
                        return Step::Empty;
                    }
                    if let Some(next) = self.playlist.peek_next().cloned() {
                        self.start_load(next);
                    }
                }
            }
        }

        // A slow fetch stalls here with the current item still visible.
        if !self.finish_pending().await {
            return Step::Stop;
        }
        if self.present() {
            self.playlist.advance();
        }
        Step::Advanced
    }

    /// Show the placeholder until a non-empty playlist arrives.
    async fn wait_for_content(&mut self) -> bool {
        self.abort_pending();
        self.buffers.reset();
        self.surface.clear(SlotId::A);
        self.surface.clear(SlotId::B);
        self.surface.show_placeholder();

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return false,
                changed = self.playlist_rx.changed(), if self.playlist_open => {
                    if changed.is_err() {
                        self.playlist_open = false;
                        continue;
                    }
                    let items = self.playlist_rx.borrow_and_update().clone();
                    self.playlist.replace(items);
                    if !self.playlist.is_empty() {
                        tracing::info!("Content arrived: {} items", self.playlist.len());
                        return true;
                    }
                }
            }
        }
    }

    fn advance_deadline(&self, slot: SlotId) -> Option<Instant> {
        let Some(media) = self.buffers.media(slot) else {
            return Some(Instant::now() + self.config.image_duration);
        };
        if media.record.is_video() && !self.failed[slot.index()] {
            return None;
        }
        Some(Instant::now() + self.display_time(&media.record))
    }

    fn display_time(&self, record: &MediaRecord) -> Duration {
        record
            .duration_secs
            .filter(|secs| *secs > 0.0)
            .map(|secs| secs.min(MAX_PLAYBACK_SECS))
            .map(Duration::from_secs_f64)
            .unwrap_or(self.config.image_duration)
    }

    /// Begin fetching `record` into the inactive slot.
    fn start_load(&mut self, record: MediaRecord) {
        let slot = match self.buffers.begin_load() {
            Ok(slot) => slot,
            Err(e) => {
                tracing::warn!("Cannot load {}: {}", record.name, e);
                return;
            }
        };

        self.generation += 1;
        let generation = self.generation;
        let token = self.cancel.child_token();
        let fetch_token = token.clone();
        let cache = self.cache.clone();
        let tx = self.load_tx.clone();
        tracing::debug!("Loading {} into slot {}", record.name, slot);

        tokio::spawn(async move {
            let source = cache
                .cache_media_with_cancel(&record.url, record.kind, &fetch_token)
                .await;
            let _ = tx.send(LoadDone {
                generation,
                slot,
                record,
                source,
            });
        });

        self.pending = Some(PendingLoad {
            generation,
            slot,
            token,
        });
    }

    fn on_load_done(&mut self, done: LoadDone) {
        match &self.pending {
            Some(pending) if pending.generation == done.generation => {}
            _ => return,
        }
        self.pending = None;

        let media = LoadedMedia {
            record: done.record,
            source: done.source,
        };
        self.failed[done.slot.index()] = match self.surface.prepare(done.slot, &media) {
            Ok(()) => false,
            Err(message) => {
                tracing::warn!(
                    "Load error for {} in slot {}: {}",
                    media.record.name,
                    done.slot,
                    message
                );
                self.stats.load_errors += 1;
                true
            }
        };
        self.buffers.finish_load(done.slot, media);
    }

    /// Wait for the pending load, if any. Returns false when cancelled.
    async fn finish_pending(&mut self) -> bool {
        while self.pending.is_some() {
            tokio::select! {
                _ = self.cancel.cancelled() => return false,
                Some(done) = self.load_rx.recv() => self.on_load_done(done),
            }
        }
        true
    }

    fn abort_pending(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.token.cancel();
            self.buffers.cancel_load(pending.slot);
        }
    }

    fn present(&mut self) -> bool {
        match self.buffers.swap() {
            Ok(slot) => {
                self.stats.swaps += 1;
                if let Some(media) = self.buffers.media(slot) {
                    self.surface
                        .show(slot, media, self.config.transition, self.config.transition_ms);
                }
                true
            }
            Err(e) => {
                tracing::warn!("Swap refused: {}", e);
                false
            }
        }
    }

    fn teardown(&mut self) {
        self.abort_pending();
        self.surface.clear(SlotId::A);
        self.surface.clear(SlotId::B);
        self.buffers.reset();
        tracing::info!(
            "Playback stopped after {} swaps ({} load errors)",
            self.stats.swaps,
            self.stats.load_errors
        );
    }
}
