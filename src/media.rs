//! Media records shared by the mirror, the query service and the player.
//!
//! Remote catalog items arrive as [`RemoteMedia`] and are normalized into
//! [`MediaRecord`] rows before they reach the store.

use chrono::{DateTime, Utc, Weekday};
use serde::{Deserialize, Deserializer, Serialize};

/// Kind of asset a record points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Image => "image",
            MediaKind::Video => "video",
        }
    }

    /// Parse a stored or remote kind. Anything that is not a video is shown
    /// as an image.
    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "video" | "mp4" | "webm" => MediaKind::Video,
            _ => MediaKind::Image,
        }
    }
}

/// Set of weekdays a record is shown on, as a 7-bit mask (bit 0 = Sunday).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DaySet(u8);

impl DaySet {
    pub const ALL: DaySet = DaySet(0b0111_1111);

    pub fn from_mask(mask: u8) -> Self {
        DaySet(mask & Self::ALL.0)
    }

    pub fn mask(&self) -> u8 {
        self.0
    }

    /// Build from day numbers where 0 is Sunday. Out of range numbers are ignored.
    pub fn from_numbers<I: IntoIterator<Item = u8>>(days: I) -> Self {
        let mut mask = 0u8;
        for day in days {
            if day < 7 {
                mask |= 1 << day;
            }
        }
        DaySet(mask)
    }

    pub fn contains(&self, day: Weekday) -> bool {
        self.0 & day_bit(day) != 0
    }
}

/// Mask bit for a weekday, Sunday first.
pub fn day_bit(day: Weekday) -> u8 {
    1 << day.num_days_from_sunday()
}

/// Parse a weekday from a number (0 = Sunday) or an English name.
pub fn parse_weekday(s: &str) -> Option<Weekday> {
    let s = s.trim();
    if let Ok(n) = s.parse::<u8>() {
        return weekday_from_number(n);
    }
    s.parse::<Weekday>().ok()
}

pub fn weekday_from_number(n: u8) -> Option<Weekday> {
    match n {
        0 => Some(Weekday::Sun),
        1 => Some(Weekday::Mon),
        2 => Some(Weekday::Tue),
        3 => Some(Weekday::Wed),
        4 => Some(Weekday::Thu),
        5 => Some(Weekday::Fri),
        6 => Some(Weekday::Sat),
        _ => None,
    }
}

/// Parse a reference timestamp given as Unix milliseconds or RFC 3339.
pub fn parse_timestamp(s: &str) -> Option<i64> {
    let s = s.trim();
    if let Ok(ms) = s.parse::<i64>() {
        return Some(ms);
    }
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|t| t.timestamp_millis())
}

/// One row of the authoritative mirror.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaRecord {
    pub external_id: String,
    pub name: String,
    pub url: String,
    pub kind: MediaKind,
    pub sort_order: i64,
    /// Position in the synced batch, used to break sort order ties.
    pub position: i64,
    pub volume: f32,
    /// Nominal display time in seconds. Only meaningful for images.
    pub duration_secs: Option<f64>,
    pub active_from: Option<i64>,
    pub active_until: Option<i64>,
    pub days: DaySet,
    pub enabled: bool,
    pub group_key: String,
    pub collection: Option<String>,
    pub created_at: Option<i64>,
    pub updated_at: Option<i64>,
}

impl MediaRecord {
    pub fn is_video(&self) -> bool {
        self.kind == MediaKind::Video
    }

    /// Whether the active window contains `timestamp_ms`, bounds inclusive.
    /// A missing bound is open on that side.
    pub fn is_active_at(&self, timestamp_ms: i64) -> bool {
        self.active_from.map_or(true, |start| start <= timestamp_ms)
            && self.active_until.map_or(true, |end| timestamp_ms <= end)
    }
}

/// Media item as returned by the remote catalog. Scalar fields sent as
/// `null` take their default.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RemoteMedia {
    #[serde(deserialize_with = "id_as_string")]
    pub id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub name: String,
    pub url: String,
    #[serde(
        rename = "type",
        default = "default_kind",
        deserialize_with = "kind_or_default"
    )]
    pub media_type: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub order: i64,
    #[serde(default = "default_volume", deserialize_with = "volume_or_default")]
    pub volume: f32,
    #[serde(default)]
    pub duration: Option<f64>,
    #[serde(default)]
    pub start_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub days: Option<Vec<u8>>,
    #[serde(default = "default_enabled", deserialize_with = "enabled_or_default")]
    pub enabled: bool,
    #[serde(default, deserialize_with = "null_as_default")]
    pub group: String,
    #[serde(default)]
    pub collection: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

fn default_kind() -> String {
    "image".into()
}

fn default_volume() -> f32 {
    1.0
}

fn default_enabled() -> bool {
    true
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn kind_or_default<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(Option::deserialize(deserializer)?.unwrap_or_else(default_kind))
}

fn volume_or_default<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f32, D::Error> {
    Ok(Option::deserialize(deserializer)?.unwrap_or_else(default_volume))
}

fn enabled_or_default<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    Ok(Option::deserialize(deserializer)?.unwrap_or_else(default_enabled))
}

/// Catalog ids show up as both numbers and strings.
fn id_as_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "unsupported media id: {}",
            other
        ))),
    }
}

impl RemoteMedia {
    /// Normalize into a mirror row. A missing `days` list means every day.
    pub fn into_record(self, position: i64) -> MediaRecord {
        let days = match self.days {
            Some(days) => DaySet::from_numbers(days),
            None => DaySet::ALL,
        };
        MediaRecord {
            external_id: self.id,
            name: self.name,
            kind: MediaKind::from_str(&self.media_type),
            url: self.url,
            sort_order: self.order,
            position,
            volume: self.volume.clamp(0.0, 1.0),
            duration_secs: self.duration.filter(|d| *d > 0.0),
            active_from: self.start_date.map(|t| t.timestamp_millis()),
            active_until: self.end_date.map(|t| t.timestamp_millis()),
            days,
            enabled: self.enabled,
            group_key: self.group,
            collection: self.collection,
            created_at: self.created_at.map(|t| t.timestamp_millis()),
            updated_at: self.updated_at.map(|t| t.timestamp_millis()),
        }
    }
}

/// One page of the remote catalog. Items stay raw until [`into_items`]
/// so one malformed item cannot reject the whole page.
///
/// [`into_items`]: CatalogPage::into_items
#[derive(Debug, Deserialize, Serialize)]
pub struct CatalogPage {
    #[serde(default, deserialize_with = "null_as_default")]
    pub medias: Vec<serde_json::Value>,
    #[serde(rename = "qtd_medias", default, deserialize_with = "null_as_default")]
    pub total: u64,
}

impl CatalogPage {
    /// Decode the page items. Returns the decoded items and the number of
    /// items that were skipped as malformed.
    pub fn into_items(self) -> (Vec<RemoteMedia>, usize) {
        let mut items = Vec::with_capacity(self.medias.len());
        let mut skipped = 0;
        for raw in self.medias {
            let id = raw.get("id").cloned().unwrap_or_default();
            match serde_json::from_value::<RemoteMedia>(raw) {
                Ok(item) => items.push(item),
                Err(e) => {
                    skipped += 1;
                    tracing::warn!("Skipping malformed catalog item {}: {}", id, e);
                }
            }
        }
        (items, skipped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn day_set_uses_sunday_first_bits() {
        let days = DaySet::from_numbers([0, 6, 9]);
        assert!(days.contains(Weekday::Sun));
        assert!(days.contains(Weekday::Sat));
        assert!(!days.contains(Weekday::Mon));
        assert_eq!(days.mask(), 0b0100_0001);
    }

    #[test]
    fn parses_weekdays_by_number_and_name() {
        assert_eq!(parse_weekday("3"), Some(Weekday::Wed));
        assert_eq!(parse_weekday("friday"), Some(Weekday::Fri));
        assert_eq!(parse_weekday("7"), None);
    }

    #[test]
    fn parses_timestamps_in_both_forms() {
        assert_eq!(parse_timestamp("1700000000000"), Some(1_700_000_000_000));
        assert_eq!(
            parse_timestamp("2024-01-01T00:00:00Z"),
            Some(1_704_067_200_000)
        );
        assert_eq!(parse_timestamp("yesterday"), None);
    }

    #[test]
    fn remote_item_normalizes_into_record() {
        let json = r#"{
            "id": 42,
            "name": "Promo",
            "url": "https://cdn.example.com/promo.mp4",
            "type": "video",
            "order": 3,
            "volume": 1.5,
            "start_date": "2024-01-01T00:00:00Z",
            "days": [1, 2],
            "group": "store-7",
            "extra": "ignored"
        }"#;
        let remote: RemoteMedia = serde_json::from_str(json).unwrap();
        let record = remote.into_record(9);

        assert_eq!(record.external_id, "42");
        assert!(record.is_video());
        assert_eq!(record.volume, 1.0);
        assert_eq!(record.position, 9);
        assert!(record.enabled);
        assert_eq!(record.active_until, None);
        assert!(record.days.contains(Weekday::Mon));
        assert!(!record.days.contains(Weekday::Sun));
    }

    #[test]
    fn null_scalars_take_defaults() {
        let json = r#"{"id": 7, "url": "u", "name": null, "type": null, "order": null,
            "volume": null, "enabled": null, "group": null}"#;
        let record = serde_json::from_str::<RemoteMedia>(json)
            .unwrap()
            .into_record(0);

        assert_eq!(record.name, "");
        assert_eq!(record.kind, MediaKind::Image);
        assert_eq!(record.sort_order, 0);
        assert_eq!(record.volume, 1.0);
        assert!(record.enabled);
        assert_eq!(record.group_key, "");
    }

    #[test]
    fn malformed_items_are_skipped_not_fatal() {
        let json = r#"{"qtd_medias": 3, "medias": [
            {"id": 1, "url": "https://cdn.example.com/1.jpg", "group": "g"},
            {"id": 2, "url": "https://cdn.example.com/2.jpg", "start_date": "next week"},
            {"id": 3, "url": "https://cdn.example.com/3.jpg", "name": null}
        ]}"#;
        let page: CatalogPage = serde_json::from_str(json).unwrap();
        assert_eq!(page.total, 3);

        let (items, skipped) = page.into_items();
        assert_eq!(skipped, 1);
        let ids: Vec<&str> = items.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "3"]);
    }

    #[test]
    fn active_window_is_inclusive() {
        let json = r#"{"id": "a", "url": "u", "group": "g",
            "start_date": "2024-01-01T00:00:00Z", "end_date": "2024-01-02T00:00:00Z"}"#;
        let record = serde_json::from_str::<RemoteMedia>(json)
            .unwrap()
            .into_record(0);
        let start = record.active_from.unwrap();
        let end = record.active_until.unwrap();

        assert!(record.is_active_at(start));
        assert!(record.is_active_at(end));
        assert!(!record.is_active_at(start - 1));
        assert!(!record.is_active_at(end + 1));
    }
}
