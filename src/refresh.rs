//! Background maintenance of the credential pool.
//!
//! Runs on a fixed interval: releases expired rate-limit locks and, when the
//! credentials come from a file, re-reads that file so new sessions can be
//! added without a restart. Removed credentials stay removed.

use std::path::PathBuf;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::credentials::{parse_credentials, Credential, SharedCredentialPool};

/// Where credentials are loaded from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialSource {
    /// Fixed at startup from the environment; nothing to re-read.
    Static,
    /// A file holding comma or newline separated tokens, merged after the
    /// credentials given directly in the environment.
    File {
        path: PathBuf,
        pinned: Vec<Credential>,
    },
}

impl CredentialSource {
    /// Current credentials from the source, or `None` for a static source.
    pub async fn load(&self) -> std::io::Result<Option<Vec<Credential>>> {
        match self {
            Self::Static => Ok(None),
            Self::File { path, pinned } => {
                let raw = tokio::fs::read_to_string(path).await?;
                let mut credentials = pinned.clone();
                for credential in parse_credentials(&raw) {
                    if !credentials.contains(&credential) {
                        credentials.push(credential);
                    }
                }
                Ok(Some(credentials))
            }
        }
    }
}

/// Spawn the refresh loop. The first pass runs after one full interval.
pub fn start_refresh_task(
    pool: SharedCredentialPool,
    source: CredentialSource,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(
            interval_secs = interval.as_secs(),
            source = ?source,
            "Credential refresh task started"
        );
        loop {
            tokio::time::sleep(interval).await;
            refresh_once(&pool, &source).await;
        }
    })
}

/// One maintenance pass.
pub async fn refresh_once(pool: &SharedCredentialPool, source: &CredentialSource) {
    let released = pool.purge_expired().await;
    if released > 0 {
        info!(released, "Rate limit locks expired");
    }

    match source.load().await {
        Ok(Some(credentials)) if credentials.is_empty() => {
            warn!("Credential file is empty, keeping current pool");
        }
        Ok(Some(credentials)) => {
            let before = pool.len().await;
            let now = pool.replace_credentials(credentials).await;
            if now != before {
                info!(before, now, "Credential pool reloaded");
            }
        }
        Ok(None) => {}
        Err(e) => warn!(error = %e, "Failed to reload credentials, keeping current pool"),
    }

    if pool.is_empty().await {
        warn!("Credential pool is empty, every request will fail until credentials are added");
    }

    let stats = pool.stats().await;
    debug!(
        total = stats.total,
        active = stats.active,
        rate_limited = stats.rate_limited,
        removed = stats.removed,
        "Credential pool status"
    );
}
