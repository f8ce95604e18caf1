//! Playlist query service over the catalog mirror.

use crate::error::StoreError;
use crate::media::MediaRecord;
use crate::mirror::CatalogMirror;
use crate::store::{MediaFilter, MirrorStats};
use chrono::Weekday;
use std::sync::Arc;

/// Answers playlist queries, refreshing the mirror first when it is stale.
#[derive(Clone)]
pub struct MediaQuery {
    mirror: Arc<CatalogMirror>,
}

impl MediaQuery {
    pub fn new(mirror: Arc<CatalogMirror>) -> Self {
        Self { mirror }
    }

    pub fn mirror(&self) -> &Arc<CatalogMirror> {
        &self.mirror
    }

    /// Enabled records for `group_key`, optionally limited to a weekday and to
    /// records whose active window contains `reference_ms`, ordered by sort
    /// order. A failed refresh is logged and the existing mirror is queried.
    pub async fn get_filtered_media(
        &self,
        group_key: &str,
        day: Option<Weekday>,
        reference_ms: Option<i64>,
    ) -> Result<Vec<MediaRecord>, StoreError> {
        if self.mirror.should_sync().await {
            tracing::debug!("Mirror is stale, syncing before query");
            if let Err(e) = self.mirror.trigger_sync().await {
                tracing::warn!("Refresh before query failed: {}", e);
            }
        }

        let filter = MediaFilter {
            group_key: group_key.to_string(),
            day,
            reference_ms,
        };
        let records = self.mirror.store().query(&filter).await?;
        tracing::debug!("Query for group {} returned {} items", group_key, records.len());
        Ok(records)
    }

    pub async fn stats(&self) -> Result<MirrorStats, StoreError> {
        self.mirror.store().stats().await
    }
}
