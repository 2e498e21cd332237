//! Vigil server library logic: configuration, the HTTP adapter over the
//! engine's boundary operations, and the SSE notification transport.

pub mod api;
pub mod api_sse;
pub mod config;

use api_sse::{SseHub, SSE_BUFFER};
use axum::{
    routing::{delete, get, post},
    Extension, Json, Router,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use vigil_db::DbPool;
use vigil_engine::{Engine, EngineError, EngineSettings, Transport};

/// Application state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// The running engine.
    pub engine: Engine,
    /// Open notification streams; also the engine's transport.
    pub hub: Arc<SseHub>,
}

impl AppState {
    /// Starts an engine over `pool` that delivers through a fresh SSE hub.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine fails to start.
    pub fn start(pool: DbPool, settings: EngineSettings) -> Result<Self, EngineError> {
        let hub = Arc::new(SseHub::new(SSE_BUFFER));
        let transport: Arc<dyn Transport> = hub.clone();
        let engine = Engine::start(pool, settings, transport)?;
        Ok(Self { engine, hub })
    }
}

/// Health check handler.
async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Builds the application router with all routes.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(
            "/api/observers",
            get(api::status_handler).post(api::subscribe_handler),
        )
        .route(
            "/api/observers/{fingerprint}/subscribers/{subscriber_id}",
            delete(api::unsubscribe_handler),
        )
        .route(
            "/api/observers/{fingerprint}/reset",
            post(api::reset_handler),
        )
        .route(
            "/api/subscribers/{subscriber_id}",
            delete(api::remove_subscriber_handler),
        )
        .route("/api/changes", post(api::ingest_handler))
        .route("/api/admin/clear", post(api::clear_handler))
        .route("/api/admin/reclaim", post(api::reclaim_handler))
        .route(
            "/events/{subscriber_id}",
            get(api_sse::get_event_stream_handler),
        )
        .layer(TraceLayer::new_for_http())
        .layer(Extension(Arc::new(state)))
}
