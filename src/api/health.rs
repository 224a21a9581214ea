//! Liveness endpoint with credential pool counts.

use std::sync::Arc;

use axum::{extract::State, Json};
use serde::Serialize;

use super::routes::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub credentials: CredentialCounts,
}

#[derive(Debug, Serialize)]
pub struct CredentialCounts {
    pub active: usize,
    pub rate_limited: usize,
    pub removed: usize,
}

pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let stats = state.pool.stats().await;
    Json(HealthResponse {
        status: "ok",
        credentials: CredentialCounts {
            active: stats.active,
            rate_limited: stats.rate_limited,
            removed: stats.removed,
        },
    })
}
