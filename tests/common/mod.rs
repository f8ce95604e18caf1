#![allow(dead_code)]

use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use signage::catalog::CatalogClient;
use signage::config::{CatalogSettings, ReplaceStrategy};
use signage::mirror::CatalogMirror;
use signage::store::MediaStore;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::TcpListener;

/// Reference instant used by the fixtures: Monday 2026-03-02 12:00 UTC.
pub const REFERENCE: &str = "2026-03-02T12:00:00Z";

/// In-process stand-in for the remote catalog.
pub struct FakeCatalog {
    pub items: Vec<Value>,
    pub requests: AtomicUsize,
    /// Pages at or past this offset answer 500.
    pub fail_from_offset: Option<u64>,
    pub delay: Duration,
    /// Reported `qtd_medias` instead of the real item count.
    pub claimed_total: Option<u64>,
    /// Arrival time and `Authorization` header of every request.
    pub seen: Mutex<Vec<(Instant, Option<String>)>>,
}

impl FakeCatalog {
    pub fn new(items: Vec<Value>) -> Self {
        Self {
            items,
            requests: AtomicUsize::new(0),
            fail_from_offset: None,
            delay: Duration::ZERO,
            claimed_total: None,
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    pub fn authorization_headers(&self) -> Vec<Option<String>> {
        self.seen.lock().unwrap().iter().map(|(_, auth)| auth.clone()).collect()
    }

    /// Time between consecutive requests.
    pub fn request_gaps(&self) -> Vec<Duration> {
        let seen = self.seen.lock().unwrap();
        seen.windows(2).map(|pair| pair[1].0 - pair[0].0).collect()
    }
}

#[derive(Debug, Deserialize)]
struct PageQuery {
    size: usize,
    offset: usize,
}

async fn page_handler(
    State(catalog): State<Arc<FakeCatalog>>,
    headers: HeaderMap,
    Query(query): Query<PageQuery>,
) -> Response {
    catalog.requests.fetch_add(1, Ordering::SeqCst);
    let auth = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    catalog.seen.lock().unwrap().push((Instant::now(), auth));
    if !catalog.delay.is_zero() {
        tokio::time::sleep(catalog.delay).await;
    }
    if let Some(fail) = catalog.fail_from_offset {
        if query.offset as u64 >= fail {
            return (StatusCode::INTERNAL_SERVER_ERROR, "catalog unavailable").into_response();
        }
    }

    let page: Vec<Value> = catalog
        .items
        .iter()
        .skip(query.offset)
        .take(query.size)
        .cloned()
        .collect();
    let total = catalog
        .claimed_total
        .unwrap_or(catalog.items.len() as u64);
    Json(json!({ "medias": page, "qtd_medias": total })).into_response()
}

/// Serve `catalog` on an ephemeral port and return its `/medias` URL.
pub async fn serve_catalog(catalog: Arc<FakeCatalog>) -> String {
    let app = Router::new()
        .route("/medias", get(page_handler))
        .with_state(catalog);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}/medias", addr)
}

pub fn settings(url: &str) -> CatalogSettings {
    CatalogSettings {
        url: url.to_string(),
        token: Some("test-token".into()),
        page_delay_ms: 10,
        replace_strategy: ReplaceStrategy::ClearThenInsert,
        ..CatalogSettings::default()
    }
}

pub async fn mirror(store: MediaStore, settings: CatalogSettings) -> Arc<CatalogMirror> {
    let client = CatalogClient::new(reqwest::Client::new(), &settings);
    Arc::new(CatalogMirror::new(client, store, settings).await.unwrap())
}

/// 120 catalog items. Group `lobby` holds five enabled items valid on
/// Monday at [`REFERENCE`] (ids 10, 30, 50, 70, 110) plus distractors:
/// one disabled, one expired, one not yet started and one Sunday-only.
pub fn catalog_items() -> Vec<Value> {
    (0..120)
        .map(|i| {
            let mut item = json!({
                "id": i,
                "name": format!("Item {}", i),
                "url": format!("https://cdn.example.com/media/{}.jpg", i),
                "type": "image",
                "order": i,
                "group": "other",
            });
            let lobby_order = match i {
                10 => Some(50),
                30 => Some(10),
                50 => Some(40),
                70 => Some(20),
                110 => Some(30),
                11..=14 => Some(0),
                _ => None,
            };
            if let Some(order) = lobby_order {
                item["group"] = json!("lobby");
                item["order"] = json!(order);
                item["start_date"] = json!("2026-03-01T00:00:00Z");
                item["end_date"] = json!("2026-03-31T00:00:00Z");
            }
            match i {
                11 => item["enabled"] = json!(false),
                12 => item["end_date"] = json!("2026-03-02T11:59:59Z"),
                13 => item["start_date"] = json!("2026-03-02T12:00:01Z"),
                14 => item["days"] = json!([0]),
                _ => {}
            }
            item
        })
        .collect()
}
