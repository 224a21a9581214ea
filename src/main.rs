//! sidebar2api - HTTP Server Entry Point
//!
//! Starts the OpenAI-compatible proxy server.

use sidebar2api::{api, config::Config};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async_main())
}

async fn async_main() -> anyhow::Result<()> {
    // Load configuration first: DEBUG picks the default log filter.
    let config = Config::from_env()?;

    let default_filter = if config.debug {
        "sidebar2api=debug,tower_http=debug"
    } else {
        "sidebar2api=info,tower_http=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!(
        credentials = config.credentials.len(),
        api_keys = config.api_keys.len(),
        proxy = config.proxy_url.is_some(),
        lock_secs = config.rate_limit_lock.as_secs(),
        refresh_secs = config.refresh_interval.as_secs(),
        "Loaded configuration"
    );

    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting server on {}", addr);

    api::serve(config).await?;

    Ok(())
}
