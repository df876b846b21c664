//! # reconflow server
//!
//! HTTP boundary and worker process for reconflow: strategy submission, task
//! status and artifacts, retries, and the chain worker pool.

pub mod api;
pub mod errors;
pub mod handlers;
pub mod infra;
pub mod routes;

pub use infra::app_state::AppState;

use axum::Router;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

/// The full application router with tracing and CORS layers applied.
pub fn create_app(state: AppState) -> Router {
    Router::new()
        .merge(routes::create_api_router(state.clone()))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
