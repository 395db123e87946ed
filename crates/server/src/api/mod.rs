//! # HTTP API
//!
//! Versioned routes over the orchestrator facade.

pub mod audits;

use axum::Router;

use crate::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .nest("/api/v1", audits::audit_routes())
        .with_state(state)
}
