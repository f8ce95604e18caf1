//! Two-slot playback buffer and playlist cursor.
//!
//! Each slot moves through `Idle -> Loading -> Ready -> Active -> Idle`.
//! Exactly one slot is active once playback has started, and [`DoubleBuffer::swap`]
//! only promotes a slot that has finished loading, so a swap never shows a
//! blank frame.

use crate::error::ScheduleError;
use crate::media::MediaRecord;
use crate::renderer::LoadedMedia;
use std::fmt;

/// One of the two playback slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotId {
    A,
    B,
}

impl SlotId {
    pub fn other(self) -> Self {
        match self {
            SlotId::A => SlotId::B,
            SlotId::B => SlotId::A,
        }
    }

    pub fn index(self) -> usize {
        match self {
            SlotId::A => 0,
            SlotId::B => 1,
        }
    }

    fn name(self) -> &'static str {
        match self {
            SlotId::A => "A",
            SlotId::B => "B",
        }
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Lifecycle of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Idle,
    Loading,
    Ready,
    Active,
}

#[derive(Debug)]
struct Slot {
    state: SlotState,
    media: Option<LoadedMedia>,
}

impl Slot {
    fn idle() -> Self {
        Self {
            state: SlotState::Idle,
            media: None,
        }
    }
}

/// The two playback slots and which of them is visible.
#[derive(Debug)]
pub struct DoubleBuffer {
    slots: [Slot; 2],
    active: Option<SlotId>,
}

impl Default for DoubleBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl DoubleBuffer {
    pub fn new() -> Self {
        Self {
            slots: [Slot::idle(), Slot::idle()],
            active: None,
        }
    }

    pub fn active(&self) -> Option<SlotId> {
        self.active
    }

    /// The slot that is not visible. Before playback starts this is A.
    pub fn inactive(&self) -> SlotId {
        match self.active {
            Some(slot) => slot.other(),
            None => SlotId::A,
        }
    }

    pub fn state(&self, slot: SlotId) -> SlotState {
        self.slots[slot.index()].state
    }

    pub fn is_loading(&self, slot: SlotId) -> bool {
        self.state(slot) == SlotState::Loading
    }

    pub fn media(&self, slot: SlotId) -> Option<&LoadedMedia> {
        self.slots[slot.index()].media.as_ref()
    }

    pub fn active_media(&self) -> Option<&LoadedMedia> {
        self.active.and_then(|slot| self.media(slot))
    }

    /// Start loading into the inactive slot.
    pub fn begin_load(&mut self) -> Result<SlotId, ScheduleError> {
        let slot = self.inactive();
        let entry = &mut self.slots[slot.index()];
        match entry.state {
            SlotState::Idle | SlotState::Ready => {
                entry.state = SlotState::Loading;
                entry.media = None;
                Ok(slot)
            }
            SlotState::Loading | SlotState::Active => Err(ScheduleError::SlotBusy(slot.name())),
        }
    }

    /// Finish a load started with [`begin_load`](Self::begin_load).
    pub fn finish_load(&mut self, slot: SlotId, media: LoadedMedia) {
        let entry = &mut self.slots[slot.index()];
        if entry.state == SlotState::Loading {
            entry.state = SlotState::Ready;
            entry.media = Some(media);
        }
    }

    /// Abandon a load, returning the slot to idle.
    pub fn cancel_load(&mut self, slot: SlotId) {
        let entry = &mut self.slots[slot.index()];
        if entry.state == SlotState::Loading {
            *entry = Slot::idle();
        }
    }

    /// Promote the inactive slot to active and demote the old active slot to
    /// idle. Fails unless the inactive slot is ready.
    pub fn swap(&mut self) -> Result<SlotId, ScheduleError> {
        let next = self.inactive();
        match self.state(next) {
            SlotState::Ready => {}
            SlotState::Loading => return Err(ScheduleError::StillLoading(next.name())),
            SlotState::Idle | SlotState::Active => {
                return Err(ScheduleError::NotReady(next.name()))
            }
        }

        if let Some(previous) = self.active {
            self.slots[previous.index()] = Slot::idle();
        }
        self.slots[next.index()].state = SlotState::Active;
        self.active = Some(next);
        Ok(next)
    }

    /// Return both slots to idle.
    pub fn reset(&mut self) {
        self.slots = [Slot::idle(), Slot::idle()];
        self.active = None;
    }
}

/// Ordered playlist with a wrapping cursor.
#[derive(Debug, Clone, Default)]
pub struct Playlist {
    items: Vec<MediaRecord>,
    cursor: usize,
}

impl Playlist {
    pub fn new(items: Vec<MediaRecord>) -> Self {
        Self { items, cursor: 0 }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn current(&self) -> Option<&MediaRecord> {
        self.items.get(self.cursor)
    }

    /// The item after the cursor, wrapping.
    pub fn peek_next(&self) -> Option<&MediaRecord> {
        if self.items.is_empty() {
            return None;
        }
        self.items.get((self.cursor + 1) % self.items.len())
    }

    pub fn advance(&mut self) {
        if !self.items.is_empty() {
            self.cursor = (self.cursor + 1) % self.items.len();
        }
    }

    /// Swap in a new item list. The cursor stays on the same record when it
    /// is still present, otherwise it is clamped into range.
    pub fn replace(&mut self, items: Vec<MediaRecord>) {
        let current_id = self.current().map(|r| r.external_id.clone());
        self.items = items;
        self.cursor = match current_id
            .and_then(|id| self.items.iter().position(|r| r.external_id == id))
        {
            Some(pos) => pos,
            None if self.items.is_empty() => 0,
            None => self.cursor.min(self.items.len() - 1),
        };
    }
}
