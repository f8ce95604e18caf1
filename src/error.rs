//! Error types for the signage pipeline.

use thiserror::Error;

/// Errors from the local mirror store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt row {id}: {reason}")]
    CorruptRow { id: String, reason: String },
}

/// Errors that end a sync pass. `Remote` and `EmptyCatalog` leave the mirror
/// untouched. `Store` can fire after the live table was cleared under the
/// clear-then-insert strategy, leaving it partially filled until the next
/// pass.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Catalog request failed: {0}")]
    Remote(#[from] reqwest::Error),

    #[error("Catalog returned no items, keeping existing mirror")]
    EmptyCatalog,

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Errors raised by the playback double buffer.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("Slot {0} is still loading")]
    StillLoading(&'static str),

    #[error("Slot {0} has nothing loaded")]
    NotReady(&'static str),

    #[error("Slot {0} is busy")]
    SlotBusy(&'static str),
}
