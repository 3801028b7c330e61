//! HTTP handlers for the ingestion API.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{error, info};
use uuid::Uuid;

use rohrpost_core::{IngestionMessage, INGESTION_QUEUE};

use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, error: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
        }),
    )
}

// ── Liveness & health ─────────────────────────────────────────────

#[derive(Serialize)]
pub struct RootResponse {
    pub message: &'static str,
}

pub async fn root() -> Json<RootResponse> {
    Json(RootResponse {
        message: "Data ingestion API is running. POST /ingest to enqueue payloads.",
    })
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub broker_connected: bool,
    pub queue: &'static str,
}

/// Liveness plus a broker reachability probe (one connection cycle).
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let broker_connected = match state.backend.connect().await {
        Ok(conn) => {
            let _ = conn.close().await;
            true
        }
        Err(_) => false,
    };
    Json(HealthResponse {
        status: "ok",
        broker_connected,
        queue: INGESTION_QUEUE,
    })
}

// ── Ingestion ─────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct IngestRequest {
    pub data: Map<String, Value>,
    pub source: String,
    pub timestamp: String,
}

#[derive(Debug, Serialize)]
pub struct IngestResponse {
    pub message: &'static str,
    pub data_id: String,
}

/// Accept a payload and enqueue it for asynchronous processing.
///
/// 202 means enqueued durably, not processed. Callers never observe
/// consumer-side outcomes here; the only broker-related failure they see
/// is a 503 when the broker is unreachable at publish time.
pub async fn ingest(
    State(state): State<Arc<AppState>>,
    Json(request): Json<IngestRequest>,
) -> Result<(StatusCode, Json<IngestResponse>), ApiError> {
    let message = IngestionMessage::new(request.data, request.source, request.timestamp)
        .map_err(|e| api_error(StatusCode::UNPROCESSABLE_ENTITY, e.to_string()))?;

    let data_id = Uuid::new_v4().to_string();
    match state.producer.publish(&message).await {
        Ok(()) => {
            info!(data_id = %data_id, source = %message.source, "ingestion request accepted");
            Ok((
                StatusCode::ACCEPTED,
                Json(IngestResponse {
                    message: "Data accepted for processing",
                    data_id,
                }),
            ))
        }
        Err(e) if e.is_unavailable() => {
            error!(error = %e, "broker unreachable at publish time");
            Err(api_error(
                StatusCode::SERVICE_UNAVAILABLE,
                format!("message broker unavailable: {e}"),
            ))
        }
        Err(e) => {
            error!(error = %e, "publish failed");
            Err(api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("failed to ingest data: {e}"),
            ))
        }
    }
}
