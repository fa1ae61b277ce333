use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, FromRequest, Multipart, Path, Query, Request, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Deserialize;

use super::db::DbHandle;
use super::executor::{BuildBackend, BuildRunner};
use super::models::{Build, BuildFilter, BuildSource, empty_as_none};
use super::stream::{RelayConfig, stream_handler};
use crate::errors::BuildError;

/// Uploaded source archives can be large; keep well above axum's 2 MB default.
const MAX_SOURCE_BYTES: usize = 512 * 1024 * 1024;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub db: DbHandle,
    pub runner: BuildRunner,
    pub relay: RelayConfig,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    pub fn new(db: DbHandle, backend: Arc<dyn BuildBackend>, relay: RelayConfig) -> SharedState {
        Arc::new(Self {
            db,
            runner: BuildRunner::new(backend),
            relay,
        })
    }
}

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateBuildForm {
    pub repo: Option<String>,
}

#[derive(Deserialize)]
pub struct LogsQuery {
    #[serde(default, deserialize_with = "empty_as_none")]
    pub offset: Option<usize>,
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<BuildError> for ApiError {
    fn from(err: BuildError) -> Self {
        match err {
            BuildError::Validation(msg) => ApiError::BadRequest(msg),
            e @ BuildError::NotFound { .. } => ApiError::NotFound(e.to_string()),
            e => {
                tracing::error!(error = %e, "request failed");
                ApiError::Internal(e.to_string())
            }
        }
    }
}

fn store_error(e: anyhow::Error) -> ApiError {
    BuildError::Store(e).into()
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/apps/{app}/builds", get(list_builds).post(create_build))
        .route("/apps/{app}/builds/{build}", get(get_build))
        .route("/apps/{app}/builds/{build}/logs", get(build_logs))
        .route("/apps/{app}/builds/{build}/status", get(build_status))
        .route("/apps/{app}/builds/{build}/stream", get(stream_handler))
        .route("/health", get(health_check))
        .layer(DefaultBodyLimit::max(MAX_SOURCE_BYTES))
}

// ── Helpers ───────────────────────────────────────────────────────────

fn wants_json(headers: &HeaderMap) -> bool {
    [header::ACCEPT, header::CONTENT_TYPE].iter().any(|name| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.contains("application/json"))
    })
}

fn render_table(builds: &[Build]) -> String {
    let mut out = format!("{:<12} {:<9} {:<21} {}\n", "ID", "STATUS", "CREATED", "ENDED");
    for b in builds {
        out.push_str(&format!(
            "{:<12} {:<9} {:<21} {}\n",
            b.id,
            b.status,
            b.created,
            b.ended.as_deref().unwrap_or("")
        ));
    }
    out
}

async fn load_build(state: &SharedState, app: String, id: String) -> Result<Build, ApiError> {
    let (a, i) = (app.clone(), id.clone());
    state
        .db
        .call(move |db| db.get_build(&a, &i))
        .await
        .map_err(store_error)?
        .ok_or_else(|| BuildError::not_found(&app, &id).into())
}

/// Pull `source` (archive bytes) and `repo` out of a multipart or urlencoded
/// body. Other content types carry neither.
async fn read_create_request(
    request: Request,
) -> Result<(Option<Vec<u8>>, Option<String>), ApiError> {
    let content_type = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();

    if content_type.starts_with("multipart/form-data") {
        let mut multipart = Multipart::from_request(request, &())
            .await
            .map_err(|e| ApiError::BadRequest(e.body_text()))?;
        let (mut archive, mut repo) = (None, None);
        while let Some(field) = multipart
            .next_field()
            .await
            .map_err(|e| ApiError::BadRequest(e.body_text()))?
        {
            let name = field.name().map(str::to_string);
            match name.as_deref() {
                Some("source") => {
                    let bytes = field
                        .bytes()
                        .await
                        .map_err(|e| ApiError::BadRequest(e.body_text()))?;
                    if !bytes.is_empty() {
                        archive = Some(bytes.to_vec());
                    }
                }
                Some("repo") => {
                    repo = Some(
                        field
                            .text()
                            .await
                            .map_err(|e| ApiError::BadRequest(e.body_text()))?,
                    );
                }
                _ => {}
            }
        }
        Ok((archive, repo))
    } else if content_type.starts_with("application/x-www-form-urlencoded") {
        let axum::Form(form) = axum::Form::<CreateBuildForm>::from_request(request, &())
            .await
            .map_err(|e| ApiError::BadRequest(e.body_text()))?;
        Ok((None, form.repo))
    } else {
        Ok((None, None))
    }
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn list_builds(
    State(state): State<SharedState>,
    Path(app): Path<String>,
    Query(filter): Query<BuildFilter>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let builds = state
        .db
        .call(move |db| db.list_builds(&app, &filter))
        .await
        .map_err(store_error)?;

    if wants_json(&headers) {
        Ok(Json(builds).into_response())
    } else {
        Ok(render_table(&builds).into_response())
    }
}

async fn get_build(
    State(state): State<SharedState>,
    Path((app, id)): Path<(String, String)>,
) -> Result<Json<Build>, ApiError> {
    Ok(Json(load_build(&state, app, id).await?))
}

async fn create_build(
    State(state): State<SharedState>,
    Path(app): Path<String>,
    request: Request,
) -> Result<String, ApiError> {
    let (archive, repo) = read_create_request(request).await?;
    let source = BuildSource::select(archive, repo).map_err(BuildError::Validation)?;
    let kind = source.kind();

    let build = state
        .db
        .call(move |db| db.create_build(&app))
        .await
        .map_err(store_error)?;

    let handle = state.runner.dispatch(state.db.clone(), &build, source).await;
    tracing::info!(app = %build.app, build = %handle.id, source = kind, "build dispatched");
    Ok(handle.id)
}

async fn build_logs(
    State(state): State<SharedState>,
    Path((app, id)): Path<(String, String)>,
    Query(query): Query<LogsQuery>,
) -> Result<String, ApiError> {
    let logs = load_build(&state, app, id).await?.logs;
    match query.offset {
        None => Ok(logs),
        Some(offset) if offset >= logs.len() => Ok(String::new()),
        Some(offset) => logs.get(offset..).map(str::to_string).ok_or_else(|| {
            ApiError::BadRequest(format!("offset {} is not on a character boundary", offset))
        }),
    }
}

async fn build_status(
    State(state): State<SharedState>,
    Path((app, id)): Path<(String, String)>,
) -> Result<String, ApiError> {
    Ok(load_build(&state, app, id).await?.status.to_string())
}

// ── Tests ─────────────────────────────────────────────────────────────
