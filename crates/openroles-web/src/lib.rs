//! HTTP trigger surface: health, sync trigger, source and listing views, metrics.

use std::sync::Arc;

use axum::{
    extract::{OriginalUri, Path, Query, State},
    http::{Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use openroles_adapters::SourceAdapter;
use openroles_core::PersistedRecord;
use openroles_storage::PersistenceGateway;
use openroles_sync::{RunSummary, SyncPipeline};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "openroles-web";

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<SyncPipeline>,
}

impl AppState {
    pub fn new(pipeline: Arc<SyncPipeline>) -> Self {
        Self { pipeline }
    }
}

#[derive(Debug, Deserialize)]
struct FetchQuery {
    /// Comma separated source ids; all enabled sources when absent.
    source: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListingsQuery {
    open: Option<bool>,
}

#[derive(Debug, Serialize)]
struct FetchResponse {
    message: &'static str,
    #[serde(flatten)]
    summary: RunSummary,
}

#[derive(Debug, Serialize)]
pub struct SourceRow {
    pub source_id: String,
    pub display_name: String,
    pub enabled: bool,
    pub kind: String,
}

#[derive(Debug, Serialize)]
struct ListingsResponse {
    source_id: String,
    count: usize,
    listings: Vec<PersistedRecord>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/fetch", post(fetch_handler))
        .route("/sources", get(sources_handler))
        .route("/sources/{source_id}/listings", get(listings_handler))
        .route("/metrics", get(metrics_handler))
        .fallback(not_found_handler)
        .with_state(state)
}

pub async fn serve(pipeline: Arc<SyncPipeline>, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "http trigger listening");
    axum::serve(listener, app(AppState::new(pipeline)))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "could not listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutting down http trigger");
}

async fn health_handler(State(state): State<AppState>) -> String {
    format!(
        "openroles is running in {} mode",
        state.pipeline.config().app_env
    )
}

async fn fetch_handler(State(state): State<AppState>, Query(query): Query<FetchQuery>) -> Response {
    let summary = match query.source.as_deref() {
        Some(list) => {
            let ids: Vec<String> = list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(ToString::to_string)
                .collect();
            if ids.is_empty() {
                return error_response(StatusCode::BAD_REQUEST, "source parameter names no sources");
            }
            info!(sources = ?ids, "fetch requested");
            state.pipeline.run_sources(&ids).await
        }
        None => {
            info!("fetch requested for all enabled sources");
            state.pipeline.run_once().await
        }
    };

    Json(FetchResponse {
        message: "Listing fetch and reconciliation completed",
        summary,
    })
    .into_response()
}

async fn sources_handler(State(state): State<AppState>) -> Json<Vec<SourceRow>> {
    let rows = state
        .pipeline
        .sources()
        .sources
        .iter()
        .map(|s| SourceRow {
            source_id: s.source_id.clone(),
            display_name: s.display_name.clone(),
            enabled: s.enabled,
            kind: state
                .pipeline
                .adapters()
                .get(&s.source_id)
                .map(|a| a.kind().to_string())
                .unwrap_or_else(|| "disabled".to_string()),
        })
        .collect();
    Json(rows)
}

async fn listings_handler(
    State(state): State<AppState>,
    Path(source_id): Path<String>,
    Query(query): Query<ListingsQuery>,
) -> Response {
    if state.pipeline.sources().get(&source_id).is_none() {
        return error_response(StatusCode::NOT_FOUND, &format!("unknown source `{source_id}`"));
    }

    match state.pipeline.gateway().snapshot(&source_id).await {
        Ok(mut listings) => {
            if let Some(open) = query.open {
                listings.retain(|r| r.open == open);
            }
            listings.sort_by(|a, b| a.external_id().cmp(b.external_id()));
            Json(ListingsResponse {
                source_id,
                count: listings.len(),
                listings,
            })
            .into_response()
        }
        Err(err) => {
            error!(source = %source_id, error = %err, "snapshot read failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string())
        }
    }
}

async fn metrics_handler(State(state): State<AppState>) -> Response {
    Json(state.pipeline.metrics().snapshot()).into_response()
}

async fn not_found_handler(method: Method, OriginalUri(uri): OriginalUri) -> Response {
    warn!(path = %uri.path(), %method, "route not found");
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({
            "status": "error",
            "message": "Route not found",
            "path": uri.path(),
            "timestamp": Utc::now().to_rfc3339(),
        })),
    )
        .into_response()
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(serde_json::json!({
            "status": "error",
            "message": message,
            "timestamp": Utc::now().to_rfc3339(),
        })),
    )
        .into_response()
}
