//! Token resolution. A short-TTL in-process cache keeps the hot bid path
//! free of datastore lookups; contents are advisory and staleness is
//! bounded by the TTL.

use {
    crate::database::Persisting,
    model::{auth::Principal, UserId},
    std::{
        collections::HashMap,
        sync::{Arc, Mutex},
        time::{Duration, Instant},
    },
};

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("invalid or expired token")]
    AuthFailed,
    #[error("durable store unavailable")]
    Database(#[source] sqlx::Error),
}

struct CacheEntry {
    principal: Principal,
    expires_at: Instant,
}

/// Bounded map from opaque token to principal snapshot. Expired entries are
/// evicted in place on lookup; inserting into a full cache evicts the entry
/// with the earliest expiration, which for uniform TTLs approximates LRU.
pub struct TokenCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    ttl: Duration,
    max_entries: usize,
}

impl TokenCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        assert!(max_entries > 0, "token cache needs room for at least one entry");
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
            max_entries,
        }
    }

    pub fn get(&self, token: &str) -> Option<Principal> {
        self.get_at(token, Instant::now())
    }

    fn get_at(&self, token: &str, now: Instant) -> Option<Principal> {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(token) {
            Some(entry) if entry.expires_at > now => Some(entry.principal.clone()),
            Some(_) => {
                entries.remove(token);
                None
            }
            None => None,
        }
    }

    pub fn set(&self, token: &str, principal: Principal) {
        self.set_at(token, principal, Instant::now());
    }

    fn set_at(&self, token: &str, principal: Principal, now: Instant) {
        let mut entries = self.entries.lock().unwrap();
        if !entries.contains_key(token) && entries.len() >= self.max_entries {
            let earliest = entries
                .iter()
                .min_by_key(|(_, entry)| entry.expires_at)
                .map(|(token, _)| token.clone());
            if let Some(earliest) = earliest {
                entries.remove(&earliest);
            }
        }
        entries.insert(
            token.to_string(),
            CacheEntry {
                principal,
                expires_at: now + self.ttl,
            },
        );
    }
}

pub struct Authenticator {
    cache: TokenCache,
    db: Arc<dyn Persisting>,
}

impl Authenticator {
    pub fn new(cache: TokenCache, db: Arc<dyn Persisting>) -> Self {
        Self { cache, db }
    }

    /// Resolves an opaque `"{user_id}:{secret}"` token into a principal.
    /// Minting and hashing of tokens belongs to the transport layer; this
    /// only checks the secret against the stored credential.
    pub async fn authenticate(&self, token: &str) -> Result<Principal, AuthError> {
        let metrics = Metrics::get();
        if let Some(principal) = self.cache.get(token) {
            metrics.token_cache.with_label_values(&["hit"]).inc();
            return Ok(principal);
        }
        metrics.token_cache.with_label_values(&["miss"]).inc();

        let (user_id, secret) = parse_token(token).ok_or(AuthError::AuthFailed)?;
        let user = self
            .db
            .user(user_id)
            .await
            .map_err(AuthError::Database)?
            .ok_or(AuthError::AuthFailed)?;
        if user.password_hash != secret {
            return Err(AuthError::AuthFailed);
        }

        let principal = Principal {
            id: user.id,
            username: user.username,
            weight: user.weight,
            is_admin: user.is_admin,
        };
        self.cache.set(token, principal.clone());
        Ok(principal)
    }
}

fn parse_token(token: &str) -> Option<(UserId, &str)> {
    let (user_id, secret) = token.split_once(':')?;
    let user_id = user_id.parse().ok()?;
    (!secret.is_empty()).then_some((user_id, secret))
}

#[derive(prometheus_metric_storage::MetricStorage)]
struct Metrics {
    /// Token cache lookups by outcome.
    #[metric(labels("outcome"))]
    token_cache: prometheus::IntCounterVec,
}

impl Metrics {
    fn get() -> &'static Self {
        Metrics::instance(observe::metrics::get_storage_registry()).unwrap()
    }
}
