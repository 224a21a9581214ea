//! # sidebar2api
//!
//! OpenAI-compatible chat-completions proxy in front of a conversational web
//! service that is reached through scraped session cookies.
//!
//! ## Request Flow
//!
//! ```text
//!   client ──► api::proxy ──► translate ──► failover::Orchestrator
//!                                                │   ▲
//!                                   credential   │   │ Signal
//!                                                ▼   │
//!                              upstream::UpstreamTransport ──► reconstruct
//!                                                                 │
//!                                             emitter (SSE or aggregate)
//! ```
//!
//! 1. The OpenAI request is validated and translated into the vendor envelope.
//! 2. The orchestrator picks a credential and opens an upstream stream.
//! 3. Each cumulative snapshot is diffed into new output pieces.
//! 4. Rejected credentials are rate-limited or removed, and the request moves
//!    on to the next one until the pool size is used up.
//!
//! ## Modules
//! - `credentials`: shared credential pool and per-request rotation
//! - `reconstruct`: snapshot diffing and terminal payload classification
//! - `failover`: retry loop across credentials
//! - `emitter`: aggregate and streaming renderings
//! - `api`: HTTP routes

pub mod api;
pub mod config;
pub mod credentials;
pub mod emitter;
pub mod error;
pub mod failover;
pub mod models;
pub mod openai;
pub mod reconstruct;
pub mod refresh;
pub mod tokens;
pub mod translate;
pub mod upstream;

pub use config::Config;
pub use error::ProxyError;
