//! HTTP serving boundary.
//!
//! A thin JSON layer over the retrieval engine and the reaction counters.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `GET`  | `/emotion_axes` | Configured emotion axes |
//! | `GET`  | `/index/{login}/status` | Published generation and size |
//! | `POST` | `/search/similar/{login}` | `{ query, top_k? }` |
//! | `POST` | `/search/centroid/{login}` | `{ session_id?, position?, top_k? }` |
//! | `POST` | `/search/emotion/{login}` | `{ weights: {key: w}, top_k? }` |
//! | `POST` | `/like/{comment_id}?count=N` | Increment the like counter |
//! | `POST` | `/dislike/{comment_id}?count=N` | Increment the dislike counter |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "total emotion weight is zero" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `upstream` (502),
//! `internal` (500).

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::collections::BTreeMap;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use comment_harness_core::models::Reaction;
use comment_harness_core::retrieval::CentroidScope;

use crate::config::Config;
use crate::db;
use crate::embedding::create_provider;
use crate::index_store;
use crate::retrieval::{attach_details, EngineError, IndexStatus, RetrievalEngine, SearchResponse};
use crate::store::{self, ReactionCounts, ReactionError};

#[derive(Clone)]
pub struct AppState {
    pool: SqlitePool,
    engine: Arc<RetrievalEngine>,
}

impl AppState {
    pub fn new(pool: SqlitePool, engine: Arc<RetrievalEngine>) -> Self {
        Self { pool, engine }
    }
}

/// Build the router. Split out from [`run_server`] so tests can drive it
/// without binding a socket.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/emotion_axes", get(handle_emotion_axes))
        .route("/index/{login}/status", get(handle_status))
        .route("/search/similar/{login}", post(handle_similar))
        .route("/search/centroid/{login}", post(handle_centroid))
        .route("/search/emotion/{login}", post(handle_emotion))
        .route("/like/{comment_id}", post(handle_like))
        .route("/dislike/{comment_id}", post(handle_dislike))
        .layer(cors)
        .with_state(state)
}

/// Bind `[server].bind` and serve until the process is terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let pool = db::connect(config).await?;
    let provider = create_provider(&config.embedding)?;
    let engine = Arc::new(RetrievalEngine::new(config, provider));
    let app = router(AppState::new(pool, engine));

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    tracing::info!(bind = %config.server.bind, "server listening");
    println!("listening: http://{}", config.server.bind);
    axum::serve(listener, app).await?;
    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: &'static str,
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
        code: "bad_request",
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found",
        message: message.into(),
    }
}

fn internal(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal",
        message: message.into(),
    }
}

impl From<EngineError> for AppError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::Invalid(_) | EngineError::EmptyQuery => bad_request(e.to_string()),
            EngineError::NoIndex(_) => not_found(e.to_string()),
            EngineError::Embedding(_) => AppError {
                status: StatusCode::BAD_GATEWAY,
                code: "upstream",
                message: e.to_string(),
            },
            EngineError::Other(err) => {
                tracing::error!(error = %format!("{:#}", err), "request failed");
                internal(format!("{:#}", err))
            }
        }
    }
}

impl From<ReactionError> for AppError {
    fn from(e: ReactionError) -> Self {
        match e {
            ReactionError::InvalidAmount(_) => bad_request(e.to_string()),
            ReactionError::NotFound(_) => not_found(e.to_string()),
            ReactionError::Storage(_) => internal(e.to_string()),
        }
    }
}

fn check_login(login: &str) -> Result<(), AppError> {
    index_store::validate_login(login).map_err(|e| bad_request(e.to_string()))
}

// ============ GET /health, /emotion_axes ============

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

#[derive(Serialize)]
struct Axis {
    key: String,
    label: String,
}

#[derive(Serialize)]
struct AxesResponse {
    axes: Vec<Axis>,
}

async fn handle_emotion_axes(State(state): State<AppState>) -> Json<AxesResponse> {
    let axes = state
        .engine
        .axes()
        .into_iter()
        .map(|(key, label)| Axis { key, label })
        .collect();
    Json(AxesResponse { axes })
}

// ============ GET /index/{login}/status ============

async fn handle_status(
    State(state): State<AppState>,
    Path(login): Path<String>,
) -> Result<Json<IndexStatus>, AppError> {
    check_login(&login)?;
    Ok(Json(state.engine.status(&login).await?))
}

// ============ POST /search/* ============

#[derive(Deserialize)]
struct SimilarRequest {
    query: String,
    top_k: Option<usize>,
}

#[derive(Deserialize)]
struct CentroidRequest {
    session_id: Option<i64>,
    position: Option<f64>,
    top_k: Option<usize>,
}

#[derive(Deserialize)]
struct EmotionRequest {
    weights: BTreeMap<String, f64>,
    top_k: Option<usize>,
}

async fn hydrate(state: &AppState, mut response: SearchResponse) -> Result<Json<SearchResponse>, AppError> {
    attach_details(&state.pool, &mut response)
        .await
        .map_err(|e| internal(format!("{:#}", e)))?;
    Ok(Json(response))
}

async fn handle_similar(
    State(state): State<AppState>,
    Path(login): Path<String>,
    Json(req): Json<SimilarRequest>,
) -> Result<Json<SearchResponse>, AppError> {
    check_login(&login)?;
    let response = state.engine.similar(&login, &req.query, req.top_k).await?;
    hydrate(&state, response).await
}

async fn handle_centroid(
    State(state): State<AppState>,
    Path(login): Path<String>,
    Json(req): Json<CentroidRequest>,
) -> Result<Json<SearchResponse>, AppError> {
    check_login(&login)?;
    let scope = match req.session_id {
        Some(id) => CentroidScope::Session(id),
        None => CentroidScope::All,
    };
    let response = state
        .engine
        .centroid(&login, scope, req.position, req.top_k)
        .await?;
    hydrate(&state, response).await
}

async fn handle_emotion(
    State(state): State<AppState>,
    Path(login): Path<String>,
    Json(req): Json<EmotionRequest>,
) -> Result<Json<SearchResponse>, AppError> {
    check_login(&login)?;
    let response = state.engine.emotion(&login, req.weights, req.top_k).await?;
    hydrate(&state, response).await
}

// ============ POST /like, /dislike ============

#[derive(Deserialize)]
struct ReactionParams {
    count: Option<i64>,
}

#[derive(Serialize)]
struct ReactionResponse {
    comment_id: String,
    #[serde(flatten)]
    counts: ReactionCounts,
}

async fn react(
    state: &AppState,
    comment_id: String,
    reaction: Reaction,
    count: Option<i64>,
) -> Result<Json<ReactionResponse>, AppError> {
    let counts = store::add_reaction(&state.pool, &comment_id, reaction, count.unwrap_or(1)).await?;
    Ok(Json(ReactionResponse { comment_id, counts }))
}

async fn handle_like(
    State(state): State<AppState>,
    Path(comment_id): Path<String>,
    Query(params): Query<ReactionParams>,
) -> Result<Json<ReactionResponse>, AppError> {
    react(&state, comment_id, Reaction::Like, params.count).await
}

async fn handle_dislike(
    State(state): State<AppState>,
    Path(comment_id): Path<String>,
    Query(params): Query<ReactionParams>,
) -> Result<Json<ReactionResponse>, AppError> {
    react(&state, comment_id, Reaction::Dislike, params.count).await
}
