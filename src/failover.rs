//! Credential failover around the upstream stream.
//!
//! One request walks through these states:
//!
//! ```text
//!   SelectCredential ──► OpenStream ──► Consuming ──► Success
//!          ▲                                 │
//!          └──── Recoverable (budget left) ◄─┤
//!                                            └──► Fatal
//! ```
//!
//! The number of attempts is bounded by the pool size recorded when the
//! request started, so replenishing the pool mid-request never extends it.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, error, info, warn};

use crate::credentials::{Credential, SharedCredentialPool};
use crate::emitter::FragmentSink;
use crate::error::ProxyError;
use crate::reconstruct::{FatalKind, ReconstructionState, RecoverableKind, Signal};
use crate::upstream::UpstreamTransport;

/// How one attempt ended, when it didn't end the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AttemptOutcome {
    Complete,
    Recoverable(RecoverableKind),
}

/// Summary of a successful request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailoverReport {
    /// Attempts made, including the successful one.
    pub attempts: usize,
    /// Credential that produced the response.
    pub credential: Credential,
}

/// Drives upstream attempts across the credential pool.
#[derive(Clone)]
pub struct Orchestrator {
    pool: SharedCredentialPool,
    transport: Arc<dyn UpstreamTransport>,
    rate_limit_lock: Duration,
}

impl Orchestrator {
    pub fn new(
        pool: SharedCredentialPool,
        transport: Arc<dyn UpstreamTransport>,
        rate_limit_lock: Duration,
    ) -> Self {
        Self {
            pool,
            transport,
            rate_limit_lock,
        }
    }

    pub fn pool(&self) -> &SharedCredentialPool {
        &self.pool
    }

    /// Run the request described by `body` (a serialized envelope), sending
    /// reconstructed pieces into `sink`.
    pub async fn execute(
        &self,
        body: Bytes,
        sink: &mut dyn FragmentSink,
    ) -> Result<FailoverReport, ProxyError> {
        let mut rotation = self.pool.rotation().await;
        let max_attempts = rotation.budget();
        let mut credential = rotation.pick_random().await?;

        for attempt in 1..=max_attempts {
            debug!(attempt, max_attempts, credential = %credential, "Starting upstream attempt");

            match self.attempt(body.clone(), &credential, sink).await? {
                AttemptOutcome::Complete => {
                    if attempt > 1 {
                        info!(attempt, credential = %credential, "Request succeeded after failover");
                    }
                    return Ok(FailoverReport {
                        attempts: attempt,
                        credential,
                    });
                }
                AttemptOutcome::Recoverable(kind) => {
                    warn!(
                        attempt,
                        max_attempts,
                        credential = %credential,
                        reason = %kind,
                        "Credential rejected, switching to next credential"
                    );
                    self.apply(kind, &credential).await;
                }
            }

            if attempt == max_attempts {
                break;
            }
            sink.reset();
            credential = match rotation.pick_next().await {
                Ok(next) => next,
                Err(_) => {
                    error!(attempt, "No more valid credentials available");
                    return Err(ProxyError::CredentialsExhausted { attempts: attempt });
                }
            };
        }

        error!(max_attempts, "All credentials exhausted");
        Err(ProxyError::CredentialsExhausted {
            attempts: max_attempts,
        })
    }

    /// Pool action for a recoverable failure.
    async fn apply(&self, kind: RecoverableKind, credential: &Credential) {
        match kind {
            RecoverableKind::UsageLimitExceeded => self.pool.remove(credential).await,
            RecoverableKind::RateLimited => {
                let lock = chrono::Duration::from_std(self.rate_limit_lock)
                    .unwrap_or_else(|_| chrono::Duration::seconds(600));
                self.pool
                    .rate_limit(credential, chrono::Utc::now() + lock)
                    .await;
            }
            RecoverableKind::NotLoggedIn => {}
        }
    }

    /// One upstream stream from open to its first decisive signal.
    ///
    /// Reconstruction state lives only for this call: a retry restarts the
    /// upstream conversation from the top.
    async fn attempt(
        &self,
        body: Bytes,
        credential: &Credential,
        sink: &mut dyn FragmentSink,
    ) -> Result<AttemptOutcome, ProxyError> {
        let mut events = self.transport.open_stream(body, credential).await?;
        let mut state = ReconstructionState::new();

        loop {
            let event = tokio::select! {
                event = events.recv() => event,
                _ = sink.closed() => {
                    debug!(credential = %credential, "Client went away, dropping upstream stream");
                    return Err(ProxyError::ClientDisconnected);
                }
            };
            let Some(event) = event else { break };
            if event.data.is_empty() {
                continue;
            }
            if !event.done {
                debug!(payload = %event.data.trim(), "Upstream event");
            }

            match state.event(&event) {
                Signal::Continue(pieces) => {
                    for piece in pieces {
                        sink.emit(piece).await?;
                    }
                }
                Signal::Complete => return Ok(AttemptOutcome::Complete),
                Signal::Recoverable(kind) => return Ok(AttemptOutcome::Recoverable(kind)),
                Signal::Fatal(FatalKind::UnsupportedLanguage) => {
                    error!(payload = %event.data, "Upstream refused conversation language");
                    return Err(ProxyError::UnsupportedLanguage);
                }
                Signal::Fatal(FatalKind::Unclassified(message)) => {
                    error!(payload = %message, "Unclassified upstream error");
                    return Err(ProxyError::Upstream(message));
                }
                Signal::Fatal(FatalKind::Malformed(reason)) => {
                    error!(error = %reason, payload = %event.data, "Failed to parse upstream event");
                    return Err(ProxyError::Upstream(format!(
                        "Failed to parse upstream event: {}",
                        reason
                    )));
                }
            }
        }

        warn!(credential = %credential, "Upstream stream closed without end marker");
        Ok(AttemptOutcome::Complete)
    }
}
