use crate::config::ApiConfig;
use crate::metadata_store::{ImageRecord, MetadataStore};
use anyhow::{Context, Result};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use photodrop_pipeline::{DeliveryQueue, QueueStats};
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub metadata_store: Arc<dyn MetadataStore>,
    pub ingestion_queue: Arc<DeliveryQueue>,
    pub dead_letter_queue: Arc<DeliveryQueue>,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

/// Queue counters for both pipeline queues
#[derive(Debug, Serialize)]
pub struct QueueStatsResponse {
    pub ingestion: NamedQueueStats,
    pub dead_letter: NamedQueueStats,
}

#[derive(Debug, Serialize)]
pub struct NamedQueueStats {
    pub name: String,
    #[serde(flatten)]
    pub stats: QueueStats,
}

impl From<&DeliveryQueue> for NamedQueueStats {
    fn from(queue: &DeliveryQueue) -> Self {
        Self {
            name: queue.name().to_string(),
            stats: queue.stats(),
        }
    }
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/api/v1/images/:bucket/:id", get(get_image))
        .route("/api/v1/queues", get(queue_stats))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "photodrop"
    }))
}

/// Readiness check endpoint
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.metadata_store.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "metadata_store": "connected"
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "metadata_store": "disconnected",
                "error": e.to_string()
            })),
        ),
    }
}

/// Get a single image record
#[instrument(skip(state))]
async fn get_image(
    State(state): State<AppState>,
    Path((bucket, id)): Path<(String, String)>,
) -> Result<Json<ImageRecord>, (StatusCode, Json<ErrorResponse>)> {
    let record = state.metadata_store.get(&id, &bucket).await.map_err(|e| {
        error!(error = %e, "Failed to get image record");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: "Failed to get image record".to_string(),
                code: "QUERY_ERROR".to_string(),
            }),
        )
    })?;

    match record {
        Some(r) => Ok(Json(r)),
        None => Err((
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: "Image not found".to_string(),
                code: "NOT_FOUND".to_string(),
            }),
        )),
    }
}

async fn queue_stats(State(state): State<AppState>) -> Json<QueueStatsResponse> {
    Json(QueueStatsResponse {
        ingestion: state.ingestion_queue.as_ref().into(),
        dead_letter: state.dead_letter_queue.as_ref().into(),
    })
}

/// Serve the status API until `shutdown` is cancelled
pub async fn start_api_server(
    state: AppState,
    config: &ApiConfig,
    shutdown: CancellationToken,
) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting status API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("API server error")?;

    Ok(())
}
