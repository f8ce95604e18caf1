//! Local HTTP surface for the query service and device registry.

use crate::media::{parse_timestamp, parse_weekday, MediaRecord};
use crate::mirror::{SyncOutcome, SyncStatus};
use crate::query::MediaQuery;
use crate::store::MirrorStats;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct AppState {
    pub query: MediaQuery,
    pub devices: Arc<DeviceRegistry>,
}

/// Playlist body returned by `GET /media/:group_key`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaylistResponse {
    pub group_key: String,
    pub count: usize,
    pub medias: Vec<MediaRecord>,
}

#[derive(Debug, Deserialize)]
pub struct MediaParams {
    pub day: Option<String>,
    pub timestamp: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct HeartbeatRequest {
    #[serde(default)]
    pub group_key: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceStatus {
    pub device_id: String,
    pub group_key: Option<String>,
    pub last_seen: DateTime<Utc>,
    pub online: bool,
}

#[derive(Debug, Clone)]
struct DeviceEntry {
    group_key: Option<String>,
    last_seen: DateTime<Utc>,
}

/// Last heartbeat per device. A device is online while its last heartbeat
/// is younger than the TTL, and forgotten once it is older than the
/// retention window.
pub struct DeviceRegistry {
    ttl: Duration,
    retention: Duration,
    devices: RwLock<HashMap<String, DeviceEntry>>,
}

fn age_within(now: DateTime<Utc>, seen: DateTime<Utc>, limit: Duration) -> bool {
    now.signed_duration_since(seen)
        .to_std()
        .map_or(true, |age| age <= limit)
}

impl DeviceRegistry {
    pub fn new(ttl: Duration, retention: Duration) -> Self {
        Self {
            ttl,
            retention: retention.max(ttl),
            devices: RwLock::new(HashMap::new()),
        }
    }

    pub async fn heartbeat(&self, device_id: &str, group_key: Option<String>, at: DateTime<Utc>) {
        let mut devices = self.devices.write().await;
        devices.retain(|id, entry| {
            let keep = age_within(at, entry.last_seen, self.retention);
            if !keep {
                tracing::info!("Device {} forgotten after {:?} of silence", id, self.retention);
            }
            keep
        });
        if !devices.contains_key(device_id) {
            tracing::info!("Device {} registered", device_id);
        }
        devices.insert(
            device_id.to_string(),
            DeviceEntry {
                group_key,
                last_seen: at,
            },
        );
    }

    /// Snapshot of all known devices as of `now`, sorted by id.
    pub async fn list(&self, now: DateTime<Utc>) -> Vec<DeviceStatus> {
        let devices = self.devices.read().await;
        let mut list: Vec<DeviceStatus> = devices
            .iter()
            .filter(|(_, entry)| age_within(now, entry.last_seen, self.retention))
            .map(|(id, entry)| DeviceStatus {
                device_id: id.clone(),
                group_key: entry.group_key.clone(),
                last_seen: entry.last_seen,
                online: age_within(now, entry.last_seen, self.ttl),
            })
            .collect();
        list.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        list
    }
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(serde_json::json!({ "error": message.into() })),
    )
        .into_response()
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/media/:group_key", get(media_handler))
        .route("/sync", post(sync_handler))
        .route("/status", get(status_handler))
        .route("/stats", get(stats_handler))
        .route("/devices", get(devices_handler))
        .route("/devices/:device_id/heartbeat", post(heartbeat_handler))
        .with_state(state)
}

async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn media_handler(
    State(state): State<AppState>,
    Path(group_key): Path<String>,
    Query(params): Query<MediaParams>,
) -> Response {
    let day = match params.day.as_deref() {
        None | Some("") => None,
        Some(raw) => match parse_weekday(raw) {
            Some(day) => Some(day),
            None => {
                return error_response(StatusCode::BAD_REQUEST, format!("Invalid day: {}", raw))
            }
        },
    };
    let reference_ms = match params.timestamp.as_deref() {
        None | Some("") => None,
        Some(raw) => match parse_timestamp(raw) {
            Some(ms) => Some(ms),
            None => {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    format!("Invalid timestamp: {}", raw),
                )
            }
        },
    };

    match state
        .query
        .get_filtered_media(&group_key, day, reference_ms)
        .await
    {
        Ok(medias) => Json(PlaylistResponse {
            group_key,
            count: medias.len(),
            medias,
        })
        .into_response(),
        Err(e) => {
            tracing::error!("Media query for {} failed: {}", group_key, e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

async fn sync_handler(State(state): State<AppState>) -> Response {
    match state.query.mirror().trigger_sync().await {
        Ok(outcome @ SyncOutcome::Completed(_)) => Json(outcome).into_response(),
        Ok(SyncOutcome::Skipped) => {
            (StatusCode::ACCEPTED, Json(SyncOutcome::Skipped)).into_response()
        }
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn status_handler(State(state): State<AppState>) -> Json<SyncStatus> {
    Json(state.query.mirror().status().await)
}

async fn stats_handler(State(state): State<AppState>) -> Result<Json<MirrorStats>, Response> {
    state
        .query
        .stats()
        .await
        .map(Json)
        .map_err(|e| error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

async fn devices_handler(State(state): State<AppState>) -> Json<Vec<DeviceStatus>> {
    Json(state.devices.list(Utc::now()).await)
}

async fn heartbeat_handler(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    body: Option<Json<HeartbeatRequest>>,
) -> StatusCode {
    let group_key = body.and_then(|Json(req)| req.group_key);
    state.devices.heartbeat(&device_id, group_key, Utc::now()).await;
    StatusCode::NO_CONTENT
}

/// Bind and serve until `cancel` fires.
pub async fn start_server(
    state: AppState,
    bind_address: &str,
    port: u16,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let addr = format!("{}:{}", bind_address, port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("HTTP server listening on {}", addr);

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    tracing::info!("HTTP server stopped");
    Ok(())
}
