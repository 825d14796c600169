//! Per-audience identity token cache (§4.1 "All outbound Redactor calls
//! carry an identity token minted for the target URL, cached per
//! audience"; §5 "writers MUST serialize per-audience... but need not
//! block readers"; §9 "prefer a per-key single-flight pattern").
//!
//! Grounded on `subscriber_service/main.py`'s module-level
//! `_cached_id_tokens` dict and `get_id_token(audience)` helper, and on
//! this corpus's per-key cache discipline in `skynet-users::resolver`.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::Mutex as AsyncMutex;

use pii_core::error::Result;

/// Mints a bearer token scoped to `audience` (the target service URL). The
/// identity/auth façade is an external collaborator (§1); only the minting
/// contract is modeled here.
#[async_trait]
pub trait IdentityMinter: Send + Sync {
    async fn mint(&self, audience: &str) -> Result<String>;
}

struct CachedToken {
    token: String,
    expires_at: DateTime<Utc>,
}

/// Cache is a `DashMap` of per-audience async mutexes: looking a token up
/// for one audience never blocks refreshes for another, and two concurrent
/// callers for the *same* audience collapse into a single mint call (the
/// second sees the freshly-cached value once the first releases the lock).
pub struct IdentityTokenCache<M: IdentityMinter> {
    minter: M,
    slots: DashMap<String, Arc<AsyncMutex<Option<CachedToken>>>>,
    ttl_seconds: i64,
}

impl<M: IdentityMinter> IdentityTokenCache<M> {
    pub fn new(minter: M, ttl_seconds: i64) -> Self {
        Self {
            minter,
            slots: DashMap::new(),
            ttl_seconds,
        }
    }

    pub async fn token_for(&self, audience: &str) -> Result<String> {
        let slot = self
            .slots
            .entry(audience.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(None)))
            .clone();

        let mut guard = slot.lock().await;
        if let Some(cached) = guard.as_ref() {
            if cached.expires_at > Utc::now() {
                return Ok(cached.token.clone());
            }
        }

        let token = self.minter.mint(audience).await?;
        *guard = Some(CachedToken {
            token: token.clone(),
            expires_at: Utc::now() + chrono::Duration::seconds(self.ttl_seconds),
        });
        Ok(token)
    }

    /// Drop a cached token ahead of its TTL — used when a downstream call
    /// returns 401, signalling the cached token is no longer valid.
    pub fn invalidate(&self, audience: &str) {
        if let Some(slot) = self.slots.get(audience) {
            if let Ok(mut guard) = slot.try_lock() {
                *guard = None;
            }
        }
    }
}

/// HTTP-backed minter hitting a configurable token-issuing endpoint once
/// per audience per TTL window.
pub struct HttpIdentityMinter {
    client: reqwest::Client,
    token_endpoint: String,
}

impl HttpIdentityMinter {
    pub fn new(client: reqwest::Client, token_endpoint: impl Into<String>) -> Self {
        Self {
            client,
            token_endpoint: token_endpoint.into(),
        }
    }
}

#[async_trait]
impl IdentityMinter for HttpIdentityMinter {
    async fn mint(&self, audience: &str) -> Result<String> {
        let response = self
            .client
            .get(&self.token_endpoint)
            .query(&[("audience", audience)])
            .send()
            .await
            .map_err(|e| pii_core::error::PiiError::Transient(format!("token mint request failed: {e}")))?;

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| pii_core::error::PiiError::Internal(format!("invalid token response: {e}")))?;

        body.get("token")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| pii_core::error::PiiError::Internal("token response missing 'token' field".into()))
    }
}

#[cfg(any(test, feature = "test-util"))]
pub mod fake {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    pub struct CountingMinter {
        pub calls: AtomicU32,
    }

    impl CountingMinter {
        pub fn new() -> Self {
            Self {
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl IdentityMinter for CountingMinter {
        async fn mint(&self, audience: &str) -> Result<String> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(format!("token-for-{audience}-{n}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::CountingMinter;
    use super::*;
    use std::sync::atomic::Ordering;

    #[tokio::test]
    async fn repeated_calls_for_same_audience_hit_cache() {
        let cache = IdentityTokenCache::new(CountingMinter::new(), 90);
        let first = cache.token_for("https://redactor.internal").await.unwrap();
        let second = cache.token_for("https://redactor.internal").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(cache.minter.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn distinct_audiences_get_distinct_tokens() {
        let cache = IdentityTokenCache::new(CountingMinter::new(), 90);
        let a = cache.token_for("https://redactor.internal").await.unwrap();
        let b = cache.token_for("https://aggregator.internal").await.unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn invalidate_forces_a_remint() {
        let cache = IdentityTokenCache::new(CountingMinter::new(), 90);
        let first = cache.token_for("aud").await.unwrap();
        cache.invalidate("aud");
        let second = cache.token_for("aud").await.unwrap();
        assert_ne!(first, second);
        assert_eq!(cache.minter.calls.load(Ordering::SeqCst), 2);
    }
}
