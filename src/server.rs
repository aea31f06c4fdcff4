//! Trigger and dashboard HTTP service.
//!
//! A scheduler (cloud push subscription, cron job) POSTs a push envelope
//! to `/` to start a maintenance run; the run happens in the background and
//! its result is visible at `/status`. The same process serves the
//! dashboard's aggregated views from the deployed dataset.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/` | Informational string |
//! | `POST` | `/` | Trigger a run (`202`), `400` on a malformed envelope |
//! | `GET`  | `/status` | Last run id, mode, state, timestamps, outcome |
//! | `GET`  | `/health` | Health check (returns version) |
//! | `GET`  | `/views/world` | Per-country totals, top artist and genre |
//! | `GET`  | `/views/countries/{code}` | Top 100 artists for a country |
//! | `GET`  | `/views/countries/{code}/genres` | Streams per genre for a country |
//!
//! # Trigger envelope
//!
//! ```json
//! { "message": { "data": "ZGVwbG95" } }
//! ```
//!
//! `data` is base64; its trimmed text names the mode. Empty or absent data
//! means `update`. Only one run executes at a time; a trigger received
//! while a run is in progress is acknowledged without starting another.
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "message.data is not valid base64" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404),
//! `dataset_unavailable` (503), `internal` (500).

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};
use uuid::Uuid;

use crate::asset::decode_dataset;
use crate::cache::{CacheKey, ViewCache};
use crate::config::Config;
use crate::maintain::{MaintenanceOutcome, Maintainer, Mode};
use crate::models::ChartRecord;
use crate::store::LAST_DATA_DATE_META;
use crate::views::{country_view, genre_breakdown, world_view};

const BANNER: &str = "Spotify soundboard maintenance service. POST a push envelope to / to start a run; see /status for the last result.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Idle,
    Running,
    Finished,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunStatus {
    pub run_id: Option<Uuid>,
    pub mode: Option<Mode>,
    pub state: RunState,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub outcome: Option<MaintenanceOutcome>,
}

impl Default for RunStatus {
    fn default() -> Self {
        Self {
            run_id: None,
            mode: None,
            state: RunState::Idle,
            started_at: None,
            finished_at: None,
            outcome: None,
        }
    }
}

struct LoadedDataset {
    version: String,
    records: Arc<Vec<ChartRecord>>,
}

#[derive(Clone)]
struct AppState {
    maintainer: Arc<Maintainer>,
    run: Arc<Mutex<RunStatus>>,
    dataset: Arc<RwLock<Option<LoadedDataset>>>,
    cache: Arc<ViewCache<serde_json::Value>>,
}

/// Start the service with the S3 store and Spotify catalog described by
/// `config`. Runs until the process is terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    run_server_with(Arc::new(Maintainer::from_config(config.clone()))).await
}

/// Start the service around an already-built [`Maintainer`], binding to
/// its `[server].bind` address.
pub async fn run_server_with(maintainer: Arc<Maintainer>) -> anyhow::Result<()> {
    let bind_addr = maintainer.config().server.bind.clone();
    let app = router(maintainer);

    info!(%bind_addr, "soundboard server listening");

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

pub fn router(maintainer: Arc<Maintainer>) -> Router {
    let ttl = Duration::from_secs(maintainer.config().server.view_cache_ttl_secs);
    let state = AppState {
        maintainer,
        run: Arc::new(Mutex::new(RunStatus::default())),
        dataset: Arc::new(RwLock::new(None)),
        cache: Arc::new(ViewCache::new(ttl)),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(handle_banner).post(handle_trigger))
        .route("/status", get(handle_status))
        .route("/health", get(handle_health))
        .route("/views/world", get(handle_world))
        .route("/views/countries/{code}", get(handle_country))
        .route("/views/countries/{code}/genres", get(handle_genres))
        .layer(cors)
        .with_state(state)
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found".to_string(),
        message: message.into(),
    }
}

fn dataset_unavailable(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::SERVICE_UNAVAILABLE,
        code: "dataset_unavailable".to_string(),
        message: message.into(),
    }
}

fn internal(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal".to_string(),
        message: message.into(),
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn handle_banner() -> &'static str {
    BANNER
}

// ============ POST / ============

/// Decode the mode from a push envelope.
pub fn mode_from_envelope(body: &[u8]) -> Result<Mode, String> {
    let value: serde_json::Value =
        serde_json::from_slice(body).map_err(|e| format!("request body is not valid JSON: {}", e))?;
    let message = value
        .get("message")
        .ok_or("request body has no 'message' field")?;
    let message = message
        .as_object()
        .ok_or("'message' must be a JSON object")?;

    let text = match message.get("data") {
        None | Some(serde_json::Value::Null) => String::new(),
        Some(serde_json::Value::String(encoded)) => {
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(encoded.trim())
                .map_err(|e| format!("message.data is not valid base64: {}", e))?;
            String::from_utf8(bytes).map_err(|_| "message.data is not valid UTF-8".to_string())?
        }
        Some(_) => return Err("message.data must be a base64 string".to_string()),
    };

    let text = text.trim();
    if text.is_empty() {
        return Ok(Mode::Update);
    }
    text.parse::<Mode>().map_err(|e| e.to_string())
}

#[derive(Serialize)]
struct TriggerResponse {
    run_id: Option<Uuid>,
    mode: Mode,
    started: bool,
}

async fn handle_trigger(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<(StatusCode, Json<TriggerResponse>), AppError> {
    let mode = mode_from_envelope(&body).map_err(|msg| {
        warn!(reason = %msg, "rejected trigger");
        bad_request(msg)
    })?;

    let mut run = state.run.lock().await;
    if run.state == RunState::Running {
        info!(%mode, run_id = ?run.run_id, "run already in progress, trigger acknowledged");
        return Ok((
            StatusCode::ACCEPTED,
            Json(TriggerResponse {
                run_id: run.run_id,
                mode,
                started: false,
            }),
        ));
    }

    let run_id = Uuid::new_v4();
    *run = RunStatus {
        run_id: Some(run_id),
        mode: Some(mode),
        state: RunState::Running,
        started_at: Some(Utc::now()),
        finished_at: None,
        outcome: None,
    };
    drop(run);

    info!(%mode, %run_id, "starting maintenance run");
    let task_state = state.clone();
    tokio::spawn(async move {
        let today = Utc::now().date_naive();
        let outcome = task_state.maintainer.run(mode, today).await;
        if outcome.published() {
            task_state.cache.invalidate_all();
            *task_state.dataset.write().await = None;
        }
        let mut run = task_state.run.lock().await;
        run.state = RunState::Finished;
        run.finished_at = Some(Utc::now());
        run.outcome = Some(outcome);
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(TriggerResponse {
            run_id: Some(run_id),
            mode,
            started: true,
        }),
    ))
}

// ============ GET /status ============

async fn handle_status(State(state): State<AppState>) -> Json<RunStatus> {
    Json(state.run.lock().await.clone())
}

// ============ GET /views/* ============

/// Current dataset, reloading it when the remote marker has moved.
async fn current_dataset(state: &AppState) -> Result<(String, Arc<Vec<ChartRecord>>), AppError> {
    let store = state.maintainer.store();
    let key = state.maintainer.config().storage.dataset_key.clone();

    let head = store.head(&key).await.map_err(|e| {
        if e.is_not_found() {
            dataset_unavailable("no dataset has been deployed yet")
        } else {
            internal(e.to_string())
        }
    })?;
    let version = match head.metadata.get(LAST_DATA_DATE_META) {
        Some(marker) => marker.clone(),
        None => head
            .last_modified
            .map(|t| t.to_rfc3339())
            .unwrap_or_default(),
    };

    if let Some(loaded) = state.dataset.read().await.as_ref() {
        if loaded.version == version {
            return Ok((version, loaded.records.clone()));
        }
    }

    let mut slot = state.dataset.write().await;
    if let Some(loaded) = slot.as_ref() {
        if loaded.version == version {
            return Ok((version, loaded.records.clone()));
        }
    }

    let bytes = store.get(&key).await.map_err(|e| internal(e.to_string()))?;
    let (_, records) = decode_dataset(&bytes).map_err(|e| internal(format!("{:#}", e)))?;
    let records = Arc::new(records);
    info!(%version, rows = records.len(), "loaded dataset for views");

    state.cache.invalidate_all();
    *slot = Some(LoadedDataset {
        version: version.clone(),
        records: records.clone(),
    });
    Ok((version, records))
}

async fn cached_view(
    state: &AppState,
    view: &str,
    params: &str,
    compute: impl FnOnce(&[ChartRecord]) -> serde_json::Value,
) -> Result<Json<serde_json::Value>, AppError> {
    let (version, records) = current_dataset(state).await?;
    let value = state
        .cache
        .get_or_compute(CacheKey::new(view, params), &version, || compute(records.as_slice()));
    Ok(Json(value))
}

fn normalize_code(code: &str) -> Result<String, AppError> {
    let code = code.trim();
    if code.is_empty() || !code.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(bad_request(format!("invalid country code '{}'", code)));
    }
    Ok(code.to_uppercase())
}

async fn handle_world(State(state): State<AppState>) -> Result<Json<serde_json::Value>, AppError> {
    cached_view(&state, "world", "", |records| {
        serde_json::json!({ "countries": world_view(records) })
    })
    .await
}

async fn handle_country(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let code = normalize_code(&code)?;
    let Json(value) = cached_view(&state, "country", &code, |records| {
        serde_json::json!({ "country": code, "artists": country_view(records, &code) })
    })
    .await?;
    if value["artists"].as_array().is_some_and(|a| a.is_empty()) {
        return Err(not_found(format!("no chart data for country '{}'", code)));
    }
    Ok(Json(value))
}

async fn handle_genres(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let code = normalize_code(&code)?;
    let Json(value) = cached_view(&state, "genres", &code, |records| {
        serde_json::json!({ "country": code, "genres": genre_breakdown(records, &code) })
    })
    .await?;
    if value["genres"].as_array().is_some_and(|a| a.is_empty()) {
        return Err(not_found(format!("no chart data for country '{}'", code)));
    }
    Ok(Json(value))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(data: Option<&str>) -> Vec<u8> {
        let message = match data {
            Some(text) => serde_json::json!({
                "data": base64::engine::general_purpose::STANDARD.encode(text)
            }),
            None => serde_json::json!({}),
        };
        serde_json::to_vec(&serde_json::json!({ "message": message })).unwrap()
    }

    #[test]
    fn test_envelope_modes() {
        assert_eq!(mode_from_envelope(&envelope(None)), Ok(Mode::Update));
        assert_eq!(mode_from_envelope(&envelope(Some("  "))), Ok(Mode::Update));
        assert_eq!(mode_from_envelope(&envelope(Some("deploy\n"))), Ok(Mode::Deploy));
        assert_eq!(mode_from_envelope(&envelope(Some("refresh"))), Ok(Mode::Refresh));
    }

    #[test]
    fn test_envelope_rejections() {
        assert!(mode_from_envelope(b"not json").is_err());
        assert!(mode_from_envelope(b"{}").is_err());
        assert!(mode_from_envelope(br#"{"message": "deploy"}"#).is_err());
        assert!(mode_from_envelope(br#"{"message": {"data": "%%%"}}"#).is_err());
        assert!(mode_from_envelope(br#"{"message": {"data": 7}}"#).is_err());
        let err = mode_from_envelope(&envelope(Some("rebuild"))).unwrap_err();
        assert!(err.contains("rebuild"));
    }

    #[test]
    fn test_country_code_validation() {
        assert_eq!(normalize_code("gb").ok(), Some("GB".to_string()));
        assert_eq!(normalize_code("global").ok(), Some("GLOBAL".to_string()));
        assert!(normalize_code("g-b").is_err());
    }
}
