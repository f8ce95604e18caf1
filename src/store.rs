//! SQLite-backed authoritative media mirror.
//!
//! Holds the `media` table the catalog mirror replaces on every sync, a
//! `media_staging` table used by the staged replace strategy, and the
//! persisted sync freshness timestamp.

use crate::error::StoreError;
use crate::media::{day_bit, DaySet, MediaKind, MediaRecord};
use chrono::Weekday;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

pub type Result<T> = std::result::Result<T, StoreError>;

const MEDIA_COLUMNS: &str = "external_id, name, url, kind, sort_order, position, volume, \
     duration_secs, active_from, active_until, days_mask, enabled, group_key, collection, \
     created_at, updated_at";

/// Which table a write goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    Live,
    Staging,
}

impl Table {
    fn name(&self) -> &'static str {
        match self {
            Table::Live => "media",
            Table::Staging => "media_staging",
        }
    }
}

/// Filters applied by the query service.
#[derive(Debug, Clone, Default)]
pub struct MediaFilter {
    pub group_key: String,
    pub day: Option<Weekday>,
    pub reference_ms: Option<i64>,
}

/// Record counts for the stats endpoint.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MirrorStats {
    pub total: i64,
    pub enabled: i64,
    pub images: i64,
    pub videos: i64,
    pub by_group: BTreeMap<String, i64>,
}

/// Handle to the mirror database.
#[derive(Clone)]
pub struct MediaStore {
    pool: SqlitePool,
}

impl MediaStore {
    /// Open (creating if needed) the mirror database at `path`.
    pub async fn open(path: &Path) -> Result<Self> {
        let newly_created = !path.exists();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;

        if newly_created {
            info!("Initialized new mirror database: {}", path.display());
        } else {
            info!("Opened existing mirror database: {}", path.display());
        }

        let store = Self { pool };
        store.create_schema().await?;
        Ok(store)
    }

    /// In-memory database on a single connection, for tests and dry runs.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.create_schema().await?;
        Ok(store)
    }

    async fn create_schema(&self) -> Result<()> {
        for table in [Table::Live, Table::Staging] {
            let sql = format!(
                r#"
                CREATE TABLE IF NOT EXISTS {} (
                    external_id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    url TEXT NOT NULL,
                    kind TEXT NOT NULL,
                    sort_order INTEGER NOT NULL DEFAULT 0,
                    position INTEGER NOT NULL DEFAULT 0,
                    volume REAL NOT NULL DEFAULT 1.0,
                    duration_secs REAL,
                    active_from INTEGER,
                    active_until INTEGER,
                    days_mask INTEGER NOT NULL DEFAULT 127,
                    enabled INTEGER NOT NULL DEFAULT 1,
                    group_key TEXT NOT NULL,
                    collection TEXT,
                    created_at INTEGER,
                    updated_at INTEGER,
                    CHECK (active_from IS NULL OR active_until IS NULL
                        OR active_from <= active_until)
                )
                "#,
                table.name()
            );
            sqlx::query(&sql).execute(&self.pool).await?;
        }

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_media_group_order ON media(group_key, sort_order, position)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sync_state (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                last_sync_at INTEGER
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Delete every row of `table`.
    pub async fn clear(&self, table: Table) -> Result<u64> {
        let sql = format!("DELETE FROM {}", table.name());
        let result = sqlx::query(&sql).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    /// Insert or overwrite one record keyed by external id.
    pub async fn upsert(&self, table: Table, record: &MediaRecord) -> Result<()> {
        let sql = format!(
            r#"
            INSERT INTO {} ({})
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(external_id) DO UPDATE SET
                name = excluded.name,
                url = excluded.url,
                kind = excluded.kind,
                sort_order = excluded.sort_order,
                position = excluded.position,
                volume = excluded.volume,
                duration_secs = excluded.duration_secs,
                active_from = excluded.active_from,
                active_until = excluded.active_until,
                days_mask = excluded.days_mask,
                enabled = excluded.enabled,
                group_key = excluded.group_key,
                collection = excluded.collection,
                created_at = excluded.created_at,
                updated_at = excluded.updated_at
            "#,
            table.name(),
            MEDIA_COLUMNS
        );

        sqlx::query(&sql)
            .bind(&record.external_id)
            .bind(&record.name)
            .bind(&record.url)
            .bind(record.kind.as_str())
            .bind(record.sort_order)
            .bind(record.position)
            .bind(record.volume as f64)
            .bind(record.duration_secs)
            .bind(record.active_from)
            .bind(record.active_until)
            .bind(record.days.mask() as i64)
            .bind(record.enabled)
            .bind(&record.group_key)
            .bind(&record.collection)
            .bind(record.created_at)
            .bind(record.updated_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Replace the live table with the staging table in one transaction.
    pub async fn promote_staging(&self) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM media").execute(&mut *tx).await?;
        let copied = sqlx::query(&format!(
            "INSERT INTO media ({cols}) SELECT {cols} FROM media_staging",
            cols = MEDIA_COLUMNS
        ))
        .execute(&mut *tx)
        .await?
        .rows_affected();
        sqlx::query("DELETE FROM media_staging")
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(copied)
    }

    pub async fn count(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM media")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Enabled records for a group, narrowed by the optional filters and
    /// ordered by sort order then sync position.
    pub async fn query(&self, filter: &MediaFilter) -> Result<Vec<MediaRecord>> {
        let mut sql = format!(
            "SELECT {} FROM media WHERE enabled = 1 AND group_key = ?",
            MEDIA_COLUMNS
        );
        if filter.reference_ms.is_some() {
            sql.push_str(
                " AND (active_from IS NULL OR active_from <= ?) \
                 AND (active_until IS NULL OR active_until >= ?)",
            );
        }
        if filter.day.is_some() {
            sql.push_str(" AND (days_mask & ?) != 0");
        }
        sql.push_str(" ORDER BY sort_order ASC, position ASC");

        let mut query = sqlx::query(&sql).bind(&filter.group_key);
        if let Some(ts) = filter.reference_ms {
            query = query.bind(ts).bind(ts);
        }
        if let Some(day) = filter.day {
            query = query.bind(day_bit(day) as i64);
        }

        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(record_from_row).collect()
    }

    pub async fn stats(&self) -> Result<MirrorStats> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS total,
                   COALESCE(SUM(enabled), 0) AS enabled,
                   COALESCE(SUM(CASE WHEN kind = 'image' THEN 1 ELSE 0 END), 0) AS images,
                   COALESCE(SUM(CASE WHEN kind = 'video' THEN 1 ELSE 0 END), 0) AS videos
            FROM media
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let groups = sqlx::query(
            "SELECT group_key, COUNT(*) AS n FROM media GROUP BY group_key ORDER BY group_key",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut by_group = BTreeMap::new();
        for group in groups {
            by_group.insert(group.try_get::<String, _>("group_key")?, group.try_get("n")?);
        }

        Ok(MirrorStats {
            total: row.try_get("total")?,
            enabled: row.try_get("enabled")?,
            images: row.try_get("images")?,
            videos: row.try_get("videos")?,
            by_group,
        })
    }

    pub async fn last_sync_at(&self) -> Result<Option<i64>> {
        let value: Option<Option<i64>> =
            sqlx::query_scalar("SELECT last_sync_at FROM sync_state WHERE id = 1")
                .fetch_optional(&self.pool)
                .await?;
        Ok(value.flatten())
    }

    pub async fn set_last_sync_at(&self, timestamp_ms: i64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_state (id, last_sync_at) VALUES (1, ?)
            ON CONFLICT(id) DO UPDATE SET last_sync_at = excluded.last_sync_at
            "#,
        )
        .bind(timestamp_ms)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn record_from_row(row: &SqliteRow) -> Result<MediaRecord> {
    let external_id: String = row.try_get("external_id")?;
    let days_mask: i64 = row.try_get("days_mask")?;
    let days_mask = u8::try_from(days_mask).map_err(|_| StoreError::CorruptRow {
        id: external_id.clone(),
        reason: format!("days mask {} out of range", days_mask),
    })?;
    let kind: String = row.try_get("kind")?;
    let volume: f64 = row.try_get("volume")?;

    Ok(MediaRecord {
        name: row.try_get("name")?,
        url: row.try_get("url")?,
        kind: MediaKind::from_str(&kind),
        sort_order: row.try_get("sort_order")?,
        position: row.try_get("position")?,
        volume: volume as f32,
        duration_secs: row.try_get("duration_secs")?,
        active_from: row.try_get("active_from")?,
        active_until: row.try_get("active_until")?,
        days: DaySet::from_mask(days_mask),
        enabled: row.try_get("enabled")?,
        group_key: row.try_get("group_key")?,
        collection: row.try_get("collection")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        external_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, group: &str, order: i64) -> MediaRecord {
        MediaRecord {
            external_id: id.into(),
            name: format!("Media {}", id),
            url: format!("https://cdn.example.com/{}.jpg", id),
            kind: MediaKind::Image,
            sort_order: order,
            position: 0,
            volume: 1.0,
            duration_secs: Some(8.0),
            active_from: None,
            active_until: None,
            days: DaySet::ALL,
            enabled: true,
            group_key: group.into(),
            collection: None,
            created_at: None,
            updated_at: None,
        }
    }

    #[tokio::test]
    async fn upsert_keeps_one_row_per_external_id() {
        let store = MediaStore::in_memory().await.unwrap();
        let mut item = record("a", "g", 1);
        store.upsert(Table::Live, &item).await.unwrap();
        item.name = "Renamed".into();
        store.upsert(Table::Live, &item).await.unwrap();

        assert_eq!(store.count().await.unwrap(), 1);
        let rows = store
            .query(&MediaFilter {
                group_key: "g".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(rows[0].name, "Renamed");
    }

    #[tokio::test]
    async fn query_breaks_sort_ties_by_position() {
        let store = MediaStore::in_memory().await.unwrap();
        for (i, id) in ["c", "a", "b"].iter().enumerate() {
            let mut item = record(id, "g", 5);
            item.position = i as i64;
            store.upsert(Table::Live, &item).await.unwrap();
        }
        store.upsert(Table::Live, &record("z", "g", 1)).await.unwrap();

        let ids: Vec<String> = store
            .query(&MediaFilter {
                group_key: "g".into(),
                ..Default::default()
            })
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.external_id)
            .collect();
        assert_eq!(ids, vec!["z", "c", "a", "b"]);
    }

    #[tokio::test]
    async fn day_filter_uses_mask() {
        let store = MediaStore::in_memory().await.unwrap();
        let mut weekend = record("weekend", "g", 1);
        weekend.days = DaySet::from_numbers([0, 6]);
        store.upsert(Table::Live, &weekend).await.unwrap();
        store.upsert(Table::Live, &record("daily", "g", 2)).await.unwrap();

        let monday = store
            .query(&MediaFilter {
                group_key: "g".into(),
                day: Some(Weekday::Mon),
                reference_ms: None,
            })
            .await
            .unwrap();
        assert_eq!(monday.len(), 1);
        assert_eq!(monday[0].external_id, "daily");
    }

    #[tokio::test]
    async fn promote_staging_swaps_tables() {
        let store = MediaStore::in_memory().await.unwrap();
        store.upsert(Table::Live, &record("old", "g", 1)).await.unwrap();
        store.upsert(Table::Staging, &record("new1", "g", 1)).await.unwrap();
        store.upsert(Table::Staging, &record("new2", "g", 2)).await.unwrap();

        assert_eq!(store.promote_staging().await.unwrap(), 2);
        assert_eq!(store.count().await.unwrap(), 2);
        assert_eq!(store.clear(Table::Staging).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn last_sync_at_round_trips() {
        let store = MediaStore::in_memory().await.unwrap();
        assert_eq!(store.last_sync_at().await.unwrap(), None);
        store.set_last_sync_at(1_700_000_000_000).await.unwrap();
        store.set_last_sync_at(1_700_000_100_000).await.unwrap();
        assert_eq!(store.last_sync_at().await.unwrap(), Some(1_700_000_100_000));
    }

    #[tokio::test]
    async fn stats_count_by_group_and_kind() {
        let store = MediaStore::in_memory().await.unwrap();
        let mut video = record("v", "g1", 1);
        video.kind = MediaKind::Video;
        video.enabled = false;
        store.upsert(Table::Live, &video).await.unwrap();
        store.upsert(Table::Live, &record("i", "g2", 1)).await.unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.enabled, 1);
        assert_eq!(stats.videos, 1);
        assert_eq!(stats.by_group.get("g1"), Some(&1));
    }
}
