//! API handlers for the Vigil server.
//!
//! Every engine call blocks on SQLite, so handlers hop onto the blocking
//! pool before touching it.

use crate::AppState;
use axum::{
    extract::{Extension, Json, Path},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use vigil_engine::{ClearReport, EngineError, StatsSnapshot, SubscribeOutcome};
use vigil_types::{ChangeEvent, Fingerprint, ObserverState, QueryDescriptor};

/// Request body for `POST /api/observers`.
#[derive(Debug, Deserialize)]
pub struct SubscribeRequest {
    /// Caller-chosen id of the subscribing session.
    pub subscriber_id: String,
    /// The query to observe.
    pub query: QueryDescriptor,
    /// Opaque data stored with the subscriber.
    #[serde(default)]
    pub metadata: Option<Value>,
}

/// Response body for `GET /api/observers`.
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub observers: Vec<ObserverState>,
    pub stats: StatsSnapshot,
}

/// API error type mapping to HTTP status codes.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid input: {0}")]
    BadRequest(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),
    #[error("internal server error: {0}")]
    InternalServerError(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::ServiceUnavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            ApiError::InternalServerError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(serde_json::json!({
            "error": message
        }));

        (status, body).into_response()
    }
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::Descriptor(_) | EngineError::InvalidSubscriber(_) => {
                ApiError::BadRequest(e.to_string())
            }
            EngineError::ObserverNotFound(_) => ApiError::NotFound(e.to_string()),
            EngineError::TransientFailure { .. } | EngineError::Busy | EngineError::Pool(_) => {
                ApiError::ServiceUnavailable(e.to_string())
            }
            _ => {
                tracing::error!("engine call failed: {}", e);
                ApiError::InternalServerError(e.to_string())
            }
        }
    }
}

async fn blocking<T, F>(f: F) -> Result<T, ApiError>
where
    F: FnOnce() -> Result<T, EngineError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ApiError::InternalServerError(format!("task join error: {}", e)))?
        .map_err(ApiError::from)
}

/// Handler for `POST /api/observers`.
///
/// Subscribes and returns the current snapshot. Later changes arrive on the
/// subscriber's event stream.
pub async fn subscribe_handler(
    Extension(state): Extension<Arc<AppState>>,
    Json(payload): Json<SubscribeRequest>,
) -> Result<Json<SubscribeOutcome>, ApiError> {
    let outcome = blocking(move || {
        state
            .engine
            .subscribe(&payload.subscriber_id, &payload.query, payload.metadata.as_ref())
    })
    .await?;
    Ok(Json(outcome))
}

/// Handler for `DELETE /api/observers/{fingerprint}/subscribers/{subscriber_id}`.
pub async fn unsubscribe_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path((fingerprint, subscriber_id)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    let fingerprint = Fingerprint::from_hex(fingerprint);
    let removed = blocking(move || state.engine.unsubscribe(&fingerprint, &subscriber_id)).await?;
    if removed {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound("subscription not found".to_string()))
    }
}

/// Handler for `DELETE /api/subscribers/{subscriber_id}`.
///
/// Ends a session: every subscription of the subscriber is removed.
pub async fn remove_subscriber_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(subscriber_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let removed = blocking(move || state.engine.remove_subscriber(&subscriber_id)).await?;
    if removed {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound("subscriber not found".to_string()))
    }
}

/// Handler for `GET /api/observers`.
pub async fn status_handler(
    Extension(state): Extension<Arc<AppState>>,
) -> Result<Json<StatusResponse>, ApiError> {
    let engine = state.engine.clone();
    let observers = blocking(move || engine.status()).await?;
    Ok(Json(StatusResponse {
        observers,
        stats: state.engine.stats(),
    }))
}

/// Handler for `POST /api/observers/{fingerprint}/reset`.
///
/// Returns `409 Conflict` when the observer is not halted.
pub async fn reset_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(fingerprint): Path<String>,
) -> Result<Response, ApiError> {
    let fingerprint = Fingerprint::from_hex(fingerprint);
    let reset = blocking(move || state.engine.reset(&fingerprint)).await?;
    if reset {
        Ok(StatusCode::NO_CONTENT.into_response())
    } else {
        Ok((
            StatusCode::CONFLICT,
            Json(serde_json::json!({ "error": "observer is not halted" })),
        )
            .into_response())
    }
}

/// Handler for `POST /api/changes`.
///
/// Accepts a committed change reported by an external hook.
pub async fn ingest_handler(
    Extension(state): Extension<Arc<AppState>>,
    Json(event): Json<ChangeEvent>,
) -> Result<StatusCode, ApiError> {
    if event.table.trim().is_empty() {
        return Err(ApiError::BadRequest("table must not be empty".to_string()));
    }
    if !state.engine.ingest(event) {
        return Err(ApiError::ServiceUnavailable("change listener stopped".to_string()));
    }
    Ok(StatusCode::ACCEPTED)
}

/// Handler for `POST /api/admin/clear`.
pub async fn clear_handler(
    Extension(state): Extension<Arc<AppState>>,
) -> Result<Json<ClearReport>, ApiError> {
    let report = blocking(move || state.engine.admin_clear()).await?;
    Ok(Json(report))
}

/// Handler for `POST /api/admin/reclaim`.
pub async fn reclaim_handler(
    Extension(state): Extension<Arc<AppState>>,
) -> Result<Json<Value>, ApiError> {
    let reclaimed = blocking(move || state.engine.reclaim()).await?;
    Ok(Json(serde_json::json!({ "reclaimed": reclaimed })))
}
