//! Runtime configuration.
//!
//! Settings are layered from built-in defaults, an optional TOML file and
//! `SIGNAGE__SECTION__KEY` environment variables, in that order.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::renderer::Transition;

/// Environment variable naming the config file.
pub const CONFIG_PATH_ENV: &str = "SIGNAGE_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "signage.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub catalog: CatalogSettings,
    #[serde(default)]
    pub database: DatabaseSettings,
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub cache: CacheSettings,
    #[serde(default)]
    pub player: PlayerSettings,
}

/// How the mirror table is replaced after a successful fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplaceStrategy {
    /// Delete every row, then insert the new set. Readers may briefly see an
    /// empty table.
    #[default]
    ClearThenInsert,
    /// Insert into a staging table and swap it in inside one transaction.
    Staged,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogSettings {
    #[serde(default = "default_catalog_url")]
    pub url: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_page_size")]
    pub page_size: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_page_delay_ms")]
    pub page_delay_ms: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_batch_parallelism")]
    pub batch_parallelism: usize,
    #[serde(default = "default_freshness_secs")]
    pub freshness_secs: u64,
    #[serde(default = "default_sync_interval_secs")]
    pub sync_interval_secs: u64,
    #[serde(default)]
    pub replace_strategy: ReplaceStrategy,
}

fn default_catalog_url() -> String {
    "http://localhost:8080/medias".into()
}
fn default_page_size() -> u64 {
    100
}
fn default_request_timeout_ms() -> u64 {
    30_000
}
fn default_page_delay_ms() -> u64 {
    2_000
}
fn default_batch_size() -> usize {
    50
}
fn default_batch_parallelism() -> usize {
    8
}
fn default_freshness_secs() -> u64 {
    3_600
}
fn default_sync_interval_secs() -> u64 {
    3_600
}

impl Default for CatalogSettings {
    fn default() -> Self {
        Self {
            url: default_catalog_url(),
            token: None,
            page_size: default_page_size(),
            request_timeout_ms: default_request_timeout_ms(),
            page_delay_ms: default_page_delay_ms(),
            batch_size: default_batch_size(),
            batch_parallelism: default_batch_parallelism(),
            freshness_secs: default_freshness_secs(),
            sync_interval_secs: default_sync_interval_secs(),
            replace_strategy: ReplaceStrategy::default(),
        }
    }
}

impl CatalogSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn page_delay(&self) -> Duration {
        Duration::from_millis(self.page_delay_ms)
    }

    pub fn freshness(&self) -> Duration {
        Duration::from_secs(self.freshness_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSettings {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("data/mirror.sqlite")
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Seconds without a heartbeat before a device reads as offline.
    #[serde(default = "default_device_ttl_secs")]
    pub device_ttl_secs: u64,
    /// Seconds without a heartbeat before a device is dropped from the list.
    #[serde(default = "default_device_retention_secs")]
    pub device_retention_secs: u64,
}

fn default_true() -> bool {
    true
}
fn default_bind_address() -> String {
    "127.0.0.1".into()
}
fn default_port() -> u16 {
    3000
}
fn default_device_ttl_secs() -> u64 {
    30
}
fn default_device_retention_secs() -> u64 {
    24 * 60 * 60
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: default_bind_address(),
            port: default_port(),
            device_ttl_secs: default_device_ttl_secs(),
            device_retention_secs: default_device_retention_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    #[serde(default = "default_cache_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_max_size_mb")]
    pub max_size_mb: u64,
    #[serde(default = "default_max_age_secs")]
    pub max_age_secs: u64,
    /// Also evict least recently used entries until under the ceiling.
    #[serde(default)]
    pub hard_ceiling: bool,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("data/cache")
}
fn default_max_size_mb() -> u64 {
    500
}
fn default_max_age_secs() -> u64 {
    7 * 24 * 3_600
}
fn default_sweep_interval_secs() -> u64 {
    3_600
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            dir: default_cache_dir(),
            max_size_mb: default_max_size_mb(),
            max_age_secs: default_max_age_secs(),
            hard_ceiling: false,
            sweep_interval_secs: default_sweep_interval_secs(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl CacheSettings {
    pub fn max_size_bytes(&self) -> u64 {
        self.max_size_mb * 1024 * 1024
    }

    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_server_url")]
    pub server_url: String,
    #[serde(default)]
    pub group_key: String,
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default = "default_refresh_secs")]
    pub refresh_secs: u64,
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    #[serde(default = "default_image_duration_secs")]
    pub image_duration_secs: f64,
    #[serde(default)]
    pub transition: Transition,
    #[serde(default = "default_transition_ms")]
    pub transition_ms: u32,
    /// Runtime the headless surface reports for a video before it ends.
    #[serde(default = "default_video_runtime_secs")]
    pub video_runtime_secs: f64,
}

fn default_server_url() -> String {
    "http://127.0.0.1:3000".into()
}
fn default_refresh_secs() -> u64 {
    60
}
fn default_heartbeat_secs() -> u64 {
    10
}
fn default_image_duration_secs() -> f64 {
    8.0
}
fn default_transition_ms() -> u32 {
    500
}
fn default_video_runtime_secs() -> f64 {
    15.0
}

impl Default for PlayerSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            server_url: default_server_url(),
            group_key: String::new(),
            device_id: None,
            refresh_secs: default_refresh_secs(),
            heartbeat_secs: default_heartbeat_secs(),
            image_duration_secs: default_image_duration_secs(),
            transition: Transition::default(),
            transition_ms: default_transition_ms(),
            video_runtime_secs: default_video_runtime_secs(),
        }
    }
}

/// Longest display time or video runtime the player will wait on.
pub const MAX_PLAYBACK_SECS: f64 = 24.0 * 60.0 * 60.0;

impl PlayerSettings {
    pub fn image_duration(&self) -> Duration {
        playback_secs(self.image_duration_secs, default_image_duration_secs())
    }

    pub fn video_runtime(&self) -> Duration {
        playback_secs(self.video_runtime_secs, default_video_runtime_secs())
    }
}

/// Clamp a configured number of seconds into `0.1..=MAX_PLAYBACK_SECS`,
/// using `fallback` when it is not a number.
fn playback_secs(secs: f64, fallback: f64) -> Duration {
    let secs = if secs.is_nan() { fallback } else { secs };
    Duration::from_secs_f64(secs.clamp(0.1, MAX_PLAYBACK_SECS))
}

impl Settings {
    /// Load settings from the file named by `SIGNAGE_CONFIG` (or
    /// `signage.toml`) and the environment.
    pub fn load() -> Result<Self> {
        let path =
            std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(&path)
    }

    /// Load settings from a specific file. A missing file is not an error.
    pub fn load_from(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(
                config::Environment::with_prefix("SIGNAGE")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?;

        settings
            .try_deserialize()
            .context("Failed to parse configuration")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_documented_values() {
        let settings = Settings::default();
        assert_eq!(settings.catalog.page_size, 100);
        assert_eq!(settings.catalog.batch_size, 50);
        assert_eq!(settings.catalog.request_timeout(), Duration::from_secs(30));
        assert_eq!(settings.catalog.page_delay(), Duration::from_secs(2));
        assert_eq!(settings.catalog.freshness(), Duration::from_secs(3600));
        assert_eq!(settings.cache.max_size_bytes(), 500 * 1024 * 1024);
        assert_eq!(settings.cache.max_age(), Duration::from_secs(7 * 86_400));
        assert_eq!(settings.player.image_duration_secs, 8.0);
        assert_eq!(settings.server.device_ttl_secs, 30);
        assert_eq!(settings.server.device_retention_secs, 86_400);
    }

    #[test]
    fn out_of_range_playback_times_are_clamped() {
        let player = PlayerSettings {
            image_duration_secs: 1e20,
            video_runtime_secs: f64::NAN,
            ..PlayerSettings::default()
        };
        assert_eq!(
            player.image_duration(),
            Duration::from_secs_f64(MAX_PLAYBACK_SECS)
        );
        assert_eq!(player.video_runtime(), Duration::from_secs(15));

        let player = PlayerSettings {
            image_duration_secs: f64::NEG_INFINITY,
            ..PlayerSettings::default()
        };
        assert_eq!(player.image_duration(), Duration::from_millis(100));
    }

    #[test]
    fn file_values_override_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[catalog]
url = "https://catalog.example.com/api/medias"
page_delay_ms = 10
replace_strategy = "staged"

[player]
enabled = true
group_key = "store-12"
transition = "crossfade"
"#
        )
        .unwrap();

        let settings = Settings::load_from(file.path().to_str().unwrap()).unwrap();
        assert_eq!(settings.catalog.url, "https://catalog.example.com/api/medias");
        assert_eq!(settings.catalog.page_delay_ms, 10);
        assert_eq!(settings.catalog.replace_strategy, ReplaceStrategy::Staged);
        assert_eq!(settings.catalog.page_size, 100);
        assert!(settings.player.enabled);
        assert_eq!(settings.player.group_key, "store-12");
        assert_eq!(settings.player.transition, Transition::Crossfade);
    }
}
