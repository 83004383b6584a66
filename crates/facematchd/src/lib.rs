//! facematchd: HTTP front end for the facematch engine.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use facematch_core::MatchEngine;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

pub mod config;
pub mod error;
pub mod handlers;

pub use config::Config;
pub use error::ApiError;

/// Shared by all handlers. The engine holds no per-request state.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<MatchEngine>,
    pub verify_timeout: Duration,
}

impl AppState {
    pub fn new(engine: MatchEngine, verify_timeout: Duration) -> Self {
        Self {
            engine: Arc::new(engine),
            verify_timeout,
        }
    }
}

pub fn create_router(state: AppState, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/", get(handlers::health))
        .route("/verify-face", post(handlers::verify_face))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(RequestBodyLimitLayer::new(max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
