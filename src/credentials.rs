//! Session credential pool.
//!
//! Holds the scraped session tokens used to talk to the upstream vendor,
//! together with their exclusion state. Two kinds of exclusion exist:
//!
//! - **rate-limited**: the credential is skipped until a wall-clock deadline
//!   passes, then becomes selectable again.
//! - **removed**: the credential is skipped forever (usage quota gone,
//!   logged out). A removed token is never re-admitted, not even by the
//!   background refresh task.
//!
//! The pool is shared by every request worker and the refresh task, so all
//! state lives behind one lock. Selection happens through a [`Rotation`],
//! a per-request cursor that checks activity under the same lock that
//! mutations take, so a credential can't be handed out after removal.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::ProxyError;

/// An opaque upstream session token.
///
/// The token value never changes after load. `Debug` and `Display` print a
/// masked form so credentials don't leak into logs.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Credential(Arc<str>);

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(Arc::from(token.into()))
    }

    /// The raw token, for the outbound request only.
    pub fn token(&self) -> &str {
        &self.0
    }

    /// Masked form used in logs: first and last four characters.
    pub fn masked(&self) -> String {
        let chars: Vec<char> = self.0.chars().collect();
        if chars.len() <= 8 {
            return "*".repeat(chars.len());
        }
        let head: String = chars[..4].iter().collect();
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("{}…{}", head, tail)
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Credential").field(&self.masked()).finish()
    }
}

impl std::fmt::Display for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.masked())
    }
}

/// Split a raw credential list (comma or newline separated) into credentials.
///
/// Blank entries are dropped and duplicates keep their first position.
pub fn parse_credentials(raw: &str) -> Vec<Credential> {
    let mut seen = HashSet::new();
    raw.split([',', '\n'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter(|s| seen.insert(s.to_string()))
        .map(Credential::new)
        .collect()
}

#[derive(Debug, Default)]
struct PoolState {
    /// Stable selection order. Removed credentials are dropped from here.
    credentials: Vec<Credential>,
    /// Temporarily excluded credentials and their expiry.
    rate_limited: HashMap<Credential, DateTime<Utc>>,
    /// Permanently excluded credentials.
    removed: HashSet<Credential>,
}

impl PoolState {
    fn is_active(&self, credential: &Credential, now: DateTime<Utc>) -> bool {
        if self.removed.contains(credential) {
            return false;
        }
        if !self.credentials.contains(credential) {
            return false;
        }
        self.rate_limited
            .get(credential)
            .map(|until| *until <= now)
            .unwrap_or(true)
    }
}

/// Counts reported by `/health` and the refresh task.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct PoolStats {
    pub total: usize,
    pub active: usize,
    pub rate_limited: usize,
    pub removed: usize,
}

/// Process-wide credential pool.
#[derive(Debug, Default)]
pub struct CredentialPool {
    state: RwLock<PoolState>,
}

/// Shared pool type.
pub type SharedCredentialPool = Arc<CredentialPool>;

impl CredentialPool {
    pub fn new(credentials: Vec<Credential>) -> Self {
        Self {
            state: RwLock::new(PoolState {
                credentials,
                ..PoolState::default()
            }),
        }
    }

    /// Number of credentials that have not been permanently removed.
    pub async fn len(&self) -> usize {
        self.state.read().await.credentials.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Whether `credential` is currently selectable.
    pub async fn is_active(&self, credential: &Credential) -> bool {
        self.state.read().await.is_active(credential, Utc::now())
    }

    /// All currently selectable credentials in stable order.
    pub async fn active(&self) -> Vec<Credential> {
        let now = Utc::now();
        let state = self.state.read().await;
        state
            .credentials
            .iter()
            .filter(|c| state.is_active(c, now))
            .cloned()
            .collect()
    }

    /// Exclude `credential` until `until`. Repeating the call just moves the
    /// deadline.
    pub async fn rate_limit(&self, credential: &Credential, until: DateTime<Utc>) {
        let mut state = self.state.write().await;
        state.rate_limited.insert(credential.clone(), until);
        tracing::info!(
            credential = %credential,
            until = %until,
            "Credential rate limited"
        );
    }

    /// Permanently exclude `credential`. Idempotent.
    pub async fn remove(&self, credential: &Credential) {
        let mut state = self.state.write().await;
        state.credentials.retain(|c| c != credential);
        state.rate_limited.remove(credential);
        if state.removed.insert(credential.clone()) {
            tracing::warn!(
                credential = %credential,
                remaining = state.credentials.len(),
                "Credential removed from pool"
            );
        }
    }

    /// Replace the credential list, keeping exclusion state for tokens that
    /// survive. Removed tokens are filtered out of `credentials`.
    ///
    /// Returns the number of credentials now in the pool.
    pub async fn replace_credentials(&self, credentials: Vec<Credential>) -> usize {
        let mut state = self.state.write().await;
        let fresh: Vec<Credential> = credentials
            .into_iter()
            .filter(|c| !state.removed.contains(c))
            .collect();
        let keep: HashSet<&Credential> = fresh.iter().collect();
        state.rate_limited.retain(|c, _| keep.contains(c));
        drop(keep);
        state.credentials = fresh;
        state.credentials.len()
    }

    /// Drop rate-limit entries whose deadline has passed. Returns how many
    /// were released.
    pub async fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let mut state = self.state.write().await;
        let before = state.rate_limited.len();
        state.rate_limited.retain(|_, until| *until > now);
        before - state.rate_limited.len()
    }

    pub async fn stats(&self) -> PoolStats {
        let now = Utc::now();
        let state = self.state.read().await;
        let active = state
            .credentials
            .iter()
            .filter(|c| state.is_active(c, now))
            .count();
        PoolStats {
            total: state.credentials.len(),
            active,
            rate_limited: state
                .rate_limited
                .values()
                .filter(|until| **until > now)
                .count(),
            removed: state.removed.len(),
        }
    }

    /// Start a selection cursor for one request.
    ///
    /// The cursor snapshots the current order and size; the size bounds the
    /// number of attempts the request may make.
    pub async fn rotation(self: &Arc<Self>) -> Rotation {
        let order = self.state.read().await.credentials.clone();
        Rotation {
            pool: Arc::clone(self),
            budget: order.len(),
            order,
            position: None,
        }
    }
}

/// Per-request selection cursor over a [`CredentialPool`].
#[derive(Debug)]
pub struct Rotation {
    pool: SharedCredentialPool,
    order: Vec<Credential>,
    budget: usize,
    position: Option<usize>,
}

impl Rotation {
    /// Pool size recorded when the rotation started.
    pub fn budget(&self) -> usize {
        self.budget
    }

    /// Any active credential, chosen uniformly. The cursor is placed on it so
    /// that [`Rotation::pick_next`] continues from there.
    pub async fn pick_random(&mut self) -> Result<Credential, ProxyError> {
        let now = Utc::now();
        let state = self.pool.state.read().await;
        let candidates: Vec<usize> = self
            .order
            .iter()
            .enumerate()
            .filter(|(_, c)| state.is_active(c, now))
            .map(|(i, _)| i)
            .collect();
        if candidates.is_empty() {
            return Err(ProxyError::NoCredentials);
        }
        let idx = candidates[rand::thread_rng().gen_range(0..candidates.len())];
        self.position = Some(idx);
        Ok(self.order[idx].clone())
    }

    /// The next active credential after the cursor, wrapping around the
    /// snapshot order. Checks at most one full cycle.
    pub async fn pick_next(&mut self) -> Result<Credential, ProxyError> {
        let len = self.order.len();
        if len == 0 {
            return Err(ProxyError::NoCredentials);
        }
        let now = Utc::now();
        let state = self.pool.state.read().await;
        let start = self.position.map(|p| p + 1).unwrap_or(0);
        for step in 0..len {
            let idx = (start + step) % len;
            if state.is_active(&self.order[idx], now) {
                self.position = Some(idx);
                return Ok(self.order[idx].clone());
            }
        }
        Err(ProxyError::NoCredentials)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_of(tokens: &[&str]) -> SharedCredentialPool {
        Arc::new(CredentialPool::new(
            tokens.iter().map(|t| Credential::new(*t)).collect(),
        ))
    }

    #[test]
    fn parse_credentials_splits_and_dedups() {
        let creds = parse_credentials(" a , b\nc,,a\n");
        let tokens: Vec<&str> = creds.iter().map(|c| c.token()).collect();
        assert_eq!(tokens, vec!["a", "b", "c"]);
    }

    #[test]
    fn masked_hides_middle_of_token() {
        let c = Credential::new("abcdefghijklmnop");
        assert_eq!(c.masked(), "abcd…mnop");
        assert_eq!(Credential::new("short").masked(), "*****");
        assert!(!format!("{:?}", c).contains("efgh"));
    }

    #[tokio::test]
    async fn pick_random_fails_on_empty_pool() {
        let pool = pool_of(&[]);
        let mut rotation = pool.rotation().await;
        assert_eq!(rotation.budget(), 0);
        assert!(matches!(
            rotation.pick_random().await,
            Err(ProxyError::NoCredentials)
        ));
    }

    #[tokio::test]
    async fn pick_next_cycles_in_stable_order() {
        let pool = pool_of(&["a", "b", "c"]);
        let mut rotation = pool.rotation().await;
        let first = rotation.pick_random().await.unwrap();
        let second = rotation.pick_next().await.unwrap();
        let third = rotation.pick_next().await.unwrap();
        let fourth = rotation.pick_next().await.unwrap();
        assert_ne!(first, second);
        assert_ne!(second, third);
        assert_ne!(first, third);
        assert_eq!(first, fourth);
    }

    #[tokio::test]
    async fn rate_limited_credential_is_skipped_until_expiry() {
        let pool = pool_of(&["a", "b"]);
        let a = Credential::new("a");
        pool.rate_limit(&a, Utc::now() + chrono::Duration::seconds(60))
            .await;
        assert!(!pool.is_active(&a).await);

        let mut rotation = pool.rotation().await;
        for _ in 0..4 {
            assert_eq!(rotation.pick_next().await.unwrap().token(), "b");
        }

        // An expiry in the past makes it selectable again.
        pool.rate_limit(&a, Utc::now() - chrono::Duration::seconds(1))
            .await;
        assert!(pool.is_active(&a).await);
    }

    #[tokio::test]
    async fn remove_is_permanent_and_idempotent() {
        let pool = pool_of(&["a", "b"]);
        let a = Credential::new("a");
        pool.remove(&a).await;
        pool.remove(&a).await;
        assert_eq!(pool.len().await, 1);
        assert!(!pool.is_active(&a).await);

        // A refresh that lists the token again does not bring it back.
        let n = pool
            .replace_credentials(vec![Credential::new("a"), Credential::new("c")])
            .await;
        assert_eq!(n, 1);
        assert_eq!(pool.active().await, vec![Credential::new("c")]);
    }

    #[tokio::test]
    async fn removal_is_visible_to_an_open_rotation() {
        let pool = pool_of(&["a", "b"]);
        let mut rotation = pool.rotation().await;
        pool.remove(&Credential::new("a")).await;
        pool.remove(&Credential::new("b")).await;
        assert_eq!(rotation.budget(), 2);
        assert!(rotation.pick_next().await.is_err());
    }

    #[tokio::test]
    async fn purge_expired_releases_only_past_deadlines() {
        let pool = pool_of(&["a", "b"]);
        pool.rate_limit(&Credential::new("a"), Utc::now() - chrono::Duration::seconds(5))
            .await;
        pool.rate_limit(&Credential::new("b"), Utc::now() + chrono::Duration::seconds(60))
            .await;
        assert_eq!(pool.purge_expired().await, 1);
        let stats = pool.stats().await;
        assert_eq!(
            stats,
            PoolStats {
                total: 2,
                active: 1,
                rate_limited: 1,
                removed: 0,
            }
        );
    }
}
