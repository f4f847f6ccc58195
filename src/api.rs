// src/api.rs
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::AppConfig;
use crate::error::StoreError;
use crate::ingest::scheduler;
use crate::pipeline::{RewritePipeline, RunReport};
use crate::store::{ArticleStore, RewrittenArticle, SourceStatus};

const DEFAULT_LIST_LIMIT: usize = 20;
const MAX_LIST_LIMIT: usize = 500;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn ArticleStore>,
    pub pipeline: RewritePipeline,
    /// Last config that loaded cleanly; the scheduler replaces it on reload.
    pub config: watch::Receiver<Arc<AppConfig>>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "OK" }))
        .route("/articles", get(list_articles))
        .route("/sources", get(list_sources))
        .route("/run", post(trigger_run))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::very_permissive())
        .with_state(state)
}

struct ApiError(StatusCode, String);

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        tracing::error!(error = %e, "store request failed");
        ApiError(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(serde_json::json!({ "error": self.1 }))).into_response()
    }
}

#[derive(serde::Deserialize)]
struct ListQuery {
    #[serde(default)]
    limit: Option<usize>,
}

async fn list_articles(
    State(state): State<AppState>,
    Query(q): Query<ListQuery>,
) -> Result<Json<Vec<RewrittenArticle>>, ApiError> {
    let limit = q.limit.unwrap_or(DEFAULT_LIST_LIMIT).min(MAX_LIST_LIMIT);
    Ok(Json(state.store.list_rewritten(limit).await?))
}

async fn list_sources(State(state): State<AppState>) -> Result<Json<Vec<SourceStatus>>, ApiError> {
    Ok(Json(state.store.statuses().await?))
}

async fn trigger_run(State(state): State<AppState>) -> Result<Json<RunReport>, ApiError> {
    let cfg = state.config.borrow().clone();
    match scheduler::run_cycle(&state.pipeline, &cfg).await {
        Some(report) => Ok(Json(report)),
        None => Err(ApiError(
            StatusCode::GATEWAY_TIMEOUT,
            "run timed out".to_string(),
        )),
    }
}
