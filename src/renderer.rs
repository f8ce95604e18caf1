//! Rendering surface for the playback scheduler.
//!
//! The scheduler talks to a [`Surface`]: it prepares media into the hidden
//! slot, makes a slot visible with a transition, and receives playback events
//! back on a channel. [`LogSurface`] is the headless implementation used on
//! devices without a display stack and in tests.

use crate::cache::CachedMedia;
use crate::media::MediaRecord;
use crate::playback::SlotId;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Transition types supported by the renderer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transition {
    /// Instant switch, no transition effect.
    #[default]
    Cut,
    /// Fade from black to image.
    Fade,
    /// Crossfade between current and next image.
    Crossfade,
}

/// A playlist item resolved to something the surface can display.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedMedia {
    pub record: MediaRecord,
    pub source: CachedMedia,
}

impl LoadedMedia {
    /// Human-readable location, for logs.
    pub fn location(&self) -> String {
        match &self.source {
            CachedMedia::Blob(blob) => blob.path.display().to_string(),
            CachedMedia::Remote(url) => url.clone(),
        }
    }
}

/// Events a surface reports back to the scheduler.
#[derive(Debug, Clone, PartialEq)]
pub enum SurfaceEvent {
    /// The video in `slot` played to completion.
    PlaybackEnded { slot: SlotId },
    /// The element in `slot` failed to load its media.
    LoadError { slot: SlotId, message: String },
}

/// A double-buffered display target.
pub trait Surface: Send {
    /// Decode `media` into the hidden `slot` so it can be shown without a
    /// blank frame. On error the scheduler logs it, counts a load error and
    /// still swaps the slot in; a failed video then advances on the display
    /// timer instead of waiting for [`SurfaceEvent::PlaybackEnded`]. Nothing
    /// is retried.
    fn prepare(&mut self, slot: SlotId, media: &LoadedMedia) -> Result<(), String>;

    /// Make `slot` visible, hiding the other one.
    fn show(&mut self, slot: SlotId, media: &LoadedMedia, transition: Transition, duration_ms: u32);

    /// Show the "awaiting content" placeholder.
    fn show_placeholder(&mut self);

    /// Stop any playback in `slot` and release what it holds.
    fn clear(&mut self, slot: SlotId);
}

/// Headless surface that validates media and logs what it would display.
///
/// Images are validated by reading their header. Videos are reported as
/// finished after `video_runtime`.
pub struct LogSurface {
    events: mpsc::UnboundedSender<SurfaceEvent>,
    video_runtime: Duration,
    playing: [Option<JoinHandle<()>>; 2],
    dimensions: [Option<(u32, u32)>; 2],
}

impl LogSurface {
    pub fn new(events: mpsc::UnboundedSender<SurfaceEvent>, video_runtime: Duration) -> Self {
        Self {
            events,
            video_runtime,
            playing: [None, None],
            dimensions: [None, None],
        }
    }

    fn stop_playback(&mut self, slot: SlotId) {
        if let Some(handle) = self.playing[slot.index()].take() {
            handle.abort();
        }
    }
}

impl Surface for LogSurface {
    fn prepare(&mut self, slot: SlotId, media: &LoadedMedia) -> Result<(), String> {
        self.dimensions[slot.index()] = None;
        if media.record.is_video() {
            return Ok(());
        }
        // Remote sources are streamed by the display element itself.
        if let CachedMedia::Blob(blob) = &media.source {
            let (w, h) = image_size(&blob.path)?;
            self.dimensions[slot.index()] = Some((w, h));
        }
        Ok(())
    }

    fn show(&mut self, slot: SlotId, media: &LoadedMedia, transition: Transition, duration_ms: u32) {
        let other = slot.other();
        self.stop_playback(other);

        match self.dimensions[slot.index()] {
            Some((w, h)) => tracing::info!(
                "Showing {} in slot {} ({}x{}, {:?} {} ms) from {}",
                media.record.name,
                slot,
                w,
                h,
                transition,
                duration_ms,
                media.location()
            ),
            None => tracing::info!(
                "Showing {} in slot {} ({:?} {} ms) from {}",
                media.record.name,
                slot,
                transition,
                duration_ms,
                media.location()
            ),
        }

        if media.record.is_video() {
            self.stop_playback(slot);
            let events = self.events.clone();
            let runtime = self.video_runtime;
            self.playing[slot.index()] = Some(tokio::spawn(async move {
                tokio::time::sleep(runtime).await;
                let _ = events.send(SurfaceEvent::PlaybackEnded { slot });
            }));
        }
    }

    fn show_placeholder(&mut self) {
        self.stop_playback(SlotId::A);
        self.stop_playback(SlotId::B);
        tracing::info!("Awaiting content");
    }

    fn clear(&mut self, slot: SlotId) {
        self.stop_playback(slot);
        self.dimensions[slot.index()] = None;
    }
}

impl Drop for LogSurface {
    fn drop(&mut self) {
        self.stop_playback(SlotId::A);
        self.stop_playback(SlotId::B);
    }
}

/// Read image dimensions from a file header. Cached files carry no useful
/// extension, so the format is sniffed from the content.
fn image_size(path: &Path) -> Result<(u32, u32), String> {
    image::ImageReader::open(path)
        .and_then(|reader| reader.with_guessed_format())
        .map_err(|e| format!("Failed to open image: {}", e))?
        .into_dimensions()
        .map_err(|e| format!("Failed to decode image: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CachedBlob;
    use crate::media::{MediaKind, RemoteMedia};

    fn loaded(kind: &str, source: CachedMedia) -> LoadedMedia {
        let json = format!(
            r#"{{"id": "1", "name": "Item", "url": "https://cdn.example.com/x", "type": "{}", "group": "g"}}"#,
            kind
        );
        LoadedMedia {
            record: serde_json::from_str::<RemoteMedia>(&json)
                .unwrap()
                .into_record(0),
            source,
        }
    }

    #[tokio::test]
    async fn prepare_reads_image_dimensions() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("frame.png");
        image::RgbaImage::new(4, 3).save(&path).unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut surface = LogSurface::new(tx, Duration::from_secs(1));
        let media = loaded(
            "image",
            CachedMedia::Blob(CachedBlob {
                url: "https://cdn.example.com/x".into(),
                kind: MediaKind::Image,
                path,
                size: 0,
            }),
        );

        surface.prepare(SlotId::A, &media).unwrap();
        assert_eq!(surface.dimensions[0], Some((4, 3)));
    }

    #[tokio::test]
    async fn prepare_rejects_undecodable_image() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("broken.img");
        std::fs::write(&path, b"not an image").unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut surface = LogSurface::new(tx, Duration::from_secs(1));
        let media = loaded(
            "image",
            CachedMedia::Blob(CachedBlob {
                url: "https://cdn.example.com/x".into(),
                kind: MediaKind::Image,
                path,
                size: 12,
            }),
        );

        assert!(surface.prepare(SlotId::B, &media).is_err());
    }

    #[tokio::test]
    async fn video_reports_playback_end() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut surface = LogSurface::new(tx, Duration::from_millis(20));
        let media = loaded("video", CachedMedia::Remote("https://cdn.example.com/x".into()));

        surface.prepare(SlotId::B, &media).unwrap();
        surface.show(SlotId::B, &media, Transition::Cut, 0);

        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap();
        assert_eq!(event, Some(SurfaceEvent::PlaybackEnded { slot: SlotId::B }));
    }

    #[tokio::test]
    async fn clearing_a_slot_cancels_its_completion() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut surface = LogSurface::new(tx, Duration::from_millis(20));
        let media = loaded("video", CachedMedia::Remote("https://cdn.example.com/x".into()));

        surface.show(SlotId::A, &media, Transition::Fade, 100);
        surface.clear(SlotId::A);

        let event = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(event.is_err());
    }
}
