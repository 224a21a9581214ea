//! HTTP API.
//!
//! ## Endpoints
//!
//! - `POST /v1/chat/completions` - OpenAI chat completions, streaming or aggregated
//! - `GET /v1/models` - List supported models
//! - `GET /health` - Liveness and credential pool counts

mod auth;
mod health;
mod proxy;
mod routes;

pub use routes::{router, serve, AppState};
