//! Test helpers for kiosk-agent integration tests
//!
//! - MockAuthority: in-process authority service on an ephemeral port
//! - fixture builders for manifests and playlist items
//! - fast retry policy so failing paths finish quickly

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    extract::{Path as UrlPath, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use kiosk_agent::authority::AuthorityClient;
use kiosk_agent::retry::RetryPolicy;
use kiosk_common::config::{AuthorityConfig, ManifestTransport};
use kiosk_common::hash::sha256_hex;
use kiosk_common::models::{
    Metadata, PlaylistItem, RemoteDatabaseVersion, SyncManifest, TriggerKind, TriggerRule,
    TriggeredPlaylist,
};

pub const DEVICE_ID: &str = "kiosk-test-01";

/// Mutable authority behaviour plus request counters
#[derive(Default)]
pub struct MockState {
    pub manifest: Mutex<Option<SyncManifest>>,
    /// Forced status for the manifest endpoint
    pub manifest_status: Mutex<Option<u16>>,
    /// Served bytes keyed by content id
    pub content: Mutex<HashMap<String, Vec<u8>>>,
    /// Published databases keyed by kind name
    pub databases: Mutex<HashMap<String, (RemoteDatabaseVersion, Vec<u8>)>>,
    pub metadata: Mutex<HashMap<String, Vec<Value>>>,
    /// Number of upcoming alert posts to reject with 503
    pub alert_failures: AtomicUsize,
    /// Case reference whose alert posts are always rejected with 503
    pub reject_case: Mutex<Option<String>>,
    pub alerts: Mutex<Vec<Value>>,
    pub paired: AtomicBool,
    pub registered_codes: Mutex<Vec<String>>,
    hits: Mutex<HashMap<String, usize>>,
}

impl MockState {
    fn hit(&self, key: impl Into<String>) {
        *self.hits.lock().unwrap().entry(key.into()).or_insert(0) += 1;
    }

    pub fn hits(&self, key: &str) -> usize {
        self.hits.lock().unwrap().get(key).copied().unwrap_or(0)
    }

    pub fn set_manifest(&self, manifest: SyncManifest) {
        *self.manifest.lock().unwrap() = Some(manifest);
    }

    pub fn serve_content(&self, content_id: &str, bytes: &[u8]) {
        self.content
            .lock()
            .unwrap()
            .insert(content_id.to_string(), bytes.to_vec());
    }

    /// Publish `bytes` under `kind`, advertising `advertised_hash`
    pub fn publish_database(&self, kind: &str, token: &str, bytes: &[u8], advertised_hash: &str) {
        self.databases.lock().unwrap().insert(
            kind.to_string(),
            (
                RemoteDatabaseVersion {
                    file_hash: advertised_hash.to_string(),
                    version_token: token.to_string(),
                },
                bytes.to_vec(),
            ),
        );
    }

    pub fn publish_metadata(&self, kind: &str, records: Vec<Value>) {
        self.metadata.lock().unwrap().insert(kind.to_string(), records);
    }
}

/// Running mock authority
pub struct MockAuthority {
    pub url: String,
    pub state: Arc<MockState>,
}

impl MockAuthority {
    pub async fn start() -> Self {
        let state = Arc::new(MockState::default());
        let app = Router::new()
            .route("/health", get(|| async { "ok" }))
            .route("/api/v1/devices/register", post(register))
            .route("/api/v1/devices/:id/sync", get(manifest_handler))
            .route("/api/v1/devices/:id/playlist", get(playlist_handler))
            .route("/api/v1/devices/:id/triggers", get(triggers_handler))
            .route("/api/v1/devices/:id/pairing", get(pairing))
            .route("/api/v1/content/:id/download", get(content))
            .route("/api/v1/databases/:kind/version", get(db_version))
            .route("/api/v1/databases/:kind/download", get(db_download))
            .route("/api/v1/databases/:kind/metadata", get(db_metadata))
            .route("/api/v1/alerts", post(alert))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            url: format!("http://{}", addr),
            state,
        }
    }

    pub fn client(&self) -> Arc<AuthorityClient> {
        self.client_with(ManifestTransport::Combined)
    }

    /// Client that fetches the manifest from the playlist and triggers endpoints
    pub fn split_client(&self) -> Arc<AuthorityClient> {
        self.client_with(ManifestTransport::Split)
    }

    fn client_with(&self, manifest_transport: ManifestTransport) -> Arc<AuthorityClient> {
        let config = AuthorityConfig {
            base_url: self.url.clone(),
            request_timeout_secs: 5,
            manifest_transport,
            ..Default::default()
        };
        Arc::new(AuthorityClient::new(&config, DEVICE_ID).unwrap())
    }
}

type Shared = State<Arc<MockState>>;

async fn register(State(state): Shared, Json(body): Json<Value>) -> StatusCode {
    state.hit("register");
    if let Some(code) = body.get("pairing_code").and_then(|c| c.as_str()) {
        state.registered_codes.lock().unwrap().push(code.to_string());
    }
    StatusCode::OK
}

async fn pairing(State(state): Shared, UrlPath(_id): UrlPath<String>) -> Json<Value> {
    state.hit("pairing");
    Json(json!({ "paired": state.paired.load(Ordering::SeqCst) }))
}

async fn manifest_handler(State(state): Shared, UrlPath(_id): UrlPath<String>) -> Response {
    state.hit("manifest");
    if let Some(code) = *state.manifest_status.lock().unwrap() {
        return StatusCode::from_u16(code).unwrap().into_response();
    }
    match state.manifest.lock().unwrap().clone() {
        Some(manifest) => Json(manifest).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn playlist_handler(State(state): Shared, UrlPath(_id): UrlPath<String>) -> Response {
    state.hit("playlist");
    match state.manifest.lock().unwrap().clone() {
        Some(manifest) => Json(json!({
            "playlist_version": manifest.playlist_version,
            "default_playlist": manifest.default_playlist,
            "settings": manifest.settings,
        }))
        .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn triggers_handler(State(state): Shared, UrlPath(_id): UrlPath<String>) -> Response {
    state.hit("triggers");
    match state.manifest.lock().unwrap().clone() {
        Some(manifest) => {
            Json(json!({ "triggered_playlists": manifest.triggered_playlists })).into_response()
        }
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn content(State(state): Shared, UrlPath(id): UrlPath<String>) -> Response {
    state.hit(format!("content:{}", id));
    match state.content.lock().unwrap().get(&id).cloned() {
        Some(bytes) => bytes.into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn db_version(State(state): Shared, UrlPath(kind): UrlPath<String>) -> Response {
    state.hit(format!("db_version:{}", kind));
    match state.databases.lock().unwrap().get(&kind) {
        Some((version, _)) => Json(version.clone()).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn db_download(State(state): Shared, UrlPath(kind): UrlPath<String>) -> Response {
    state.hit(format!("db_download:{}", kind));
    match state.databases.lock().unwrap().get(&kind) {
        Some((_, bytes)) => bytes.clone().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn db_metadata(State(state): Shared, UrlPath(kind): UrlPath<String>) -> Response {
    state.hit(format!("db_metadata:{}", kind));
    match state.metadata.lock().unwrap().get(&kind) {
        Some(records) => Json(records.clone()).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn alert(State(state): Shared, Json(body): Json<Value>) -> StatusCode {
    state.hit("alert");
    let failing = state
        .alert_failures
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok();
    let rejected = match state.reject_case.lock().unwrap().as_deref() {
        Some(case) => body.get("case_reference").and_then(|c| c.as_str()) == Some(case),
        None => false,
    };
    if failing || rejected {
        return StatusCode::SERVICE_UNAVAILABLE;
    }
    state.alerts.lock().unwrap().push(body);
    StatusCode::CREATED
}

/// Retries with millisecond backoff
pub fn fast_policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(4),
        max_total_delay: Duration::from_millis(50),
    }
}

pub fn item(content_id: &str, filename: &str, bytes: Option<&[u8]>) -> PlaylistItem {
    PlaylistItem {
        content_id: content_id.to_string(),
        filename: filename.to_string(),
        duration_seconds: 15.0,
        file_hash: bytes.map(sha256_hex),
        metadata: Metadata::new(),
    }
}

pub fn demographic_playlist(
    id: &str,
    age_min: u32,
    age_max: u32,
    gender: Option<&str>,
    items: Vec<PlaylistItem>,
) -> TriggeredPlaylist {
    TriggeredPlaylist {
        id: id.to_string(),
        name: None,
        rule: TriggerRule {
            kind: TriggerKind::Demographic,
            age_min: Some(age_min),
            age_max: Some(age_max),
            gender: gender.map(str::to_string),
            member_id: None,
        },
        items,
    }
}

pub fn manifest(
    version: u64,
    default_playlist: Vec<PlaylistItem>,
    triggered_playlists: Vec<TriggeredPlaylist>,
) -> SyncManifest {
    SyncManifest {
        playlist_version: version,
        default_playlist,
        triggered_playlists,
        settings: Metadata::new(),
    }
}

/// Create every named file in `dir`
pub fn touch_all(dir: &Path, names: &[&str]) {
    for name in names {
        std::fs::write(dir.join(name), name.as_bytes()).unwrap();
    }
}
