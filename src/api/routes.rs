//! Application state, router assembly and server startup.

use std::sync::Arc;

use axum::{routing::get, Router};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::credentials::{CredentialPool, SharedCredentialPool};
use crate::failover::Orchestrator;
use crate::refresh;
use crate::tokens::{HeuristicTokenCounter, TokenCounter};
use crate::upstream::{SidebarClient, SidebarClientConfig, UpstreamTransport};

use super::health;
use super::proxy;

/// Shared application state.
pub struct AppState {
    pub config: Config,
    /// Credential pool shared with the refresh task
    pub pool: SharedCredentialPool,
    pub orchestrator: Orchestrator,
    pub tokens: Arc<dyn TokenCounter>,
}

impl AppState {
    /// Build state around an already constructed transport.
    pub fn new(
        config: Config,
        transport: Arc<dyn UpstreamTransport>,
        tokens: Arc<dyn TokenCounter>,
    ) -> Self {
        let pool: SharedCredentialPool =
            Arc::new(CredentialPool::new(config.credentials.clone()));
        let orchestrator = Orchestrator::new(pool.clone(), transport, config.rate_limit_lock);
        Self {
            config,
            pool,
            orchestrator,
            tokens,
        }
    }
}

/// Router with every endpoint mounted.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health::health))
        .nest("/v1", proxy::routes())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP server.
pub async fn serve(config: Config) -> anyhow::Result<()> {
    let transport = SidebarClient::new(SidebarClientConfig {
        url: config.upstream_url.clone(),
        user_agent: config.user_agent.clone(),
        proxy_url: config.proxy_url.clone(),
    })?;

    let state = Arc::new(AppState::new(
        config.clone(),
        Arc::new(transport),
        Arc::new(HeuristicTokenCounter),
    ));

    let refresh_task = refresh::start_refresh_task(
        state.pool.clone(),
        config.credential_source.clone(),
        config.refresh_interval,
    );

    let app = router(Arc::clone(&state));

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!(
        credentials = config.credentials.len(),
        upstream = %config.upstream_url,
        "Server listening on {}",
        addr
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    refresh_task.abort();
    tracing::info!("Graceful shutdown complete");
    Ok(())
}

/// Wait for SIGTERM/SIGINT.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
