//! Key-value cache abstraction (§1 "assumed: TTL-aware string/list
//! operations"). Owns [`pii_core::types::RedactionContext`] storage
//! exclusively (§3 "Redactor exclusively owns `RedactionContext` in KV")
//! and backs the aggregator's optional streaming buffer (§4.3).

use async_trait::async_trait;

use pii_core::error::{PiiError, Result};

/// TTL-aware string and list operations against the shared cache.
///
/// All methods are `&self` — implementations must be safe for concurrent
/// use from many request handlers at once (§5 "Shared clients").
#[async_trait]
pub trait KvCache: Send + Sync {
    /// Set `key` to `value`, expiring after `ttl_seconds`.
    async fn set_ex(&self, key: &str, value: &str, ttl_seconds: u64) -> Result<()>;

    /// Get the current value for `key`, or `None` if absent or expired.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Delete `key`. A no-op, not an error, if it does not exist.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Append `value` to the list at `key`.
    async fn rpush(&self, key: &str, value: &str) -> Result<()>;

    /// Trim the list at `key` to the inclusive range `[start, stop]`
    /// (Redis `LTRIM` semantics — negative indices count from the end).
    async fn ltrim(&self, key: &str, start: i64, stop: i64) -> Result<()>;

    /// Set a TTL on an existing key.
    async fn expire(&self, key: &str, ttl_seconds: u64) -> Result<()>;

    /// Return all elements of the list at `key`, in insertion order.
    async fn lrange_all(&self, key: &str) -> Result<Vec<String>>;
}

/// Redis-backed implementation, using a `redis::Client` with the
/// `tokio-comp` async runtime integration.
pub struct RedisKvCache {
    client: redis::Client,
}

impl RedisKvCache {
    pub fn new(client: redis::Client) -> Self {
        Self { client }
    }

    pub fn open(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| PiiError::Config(format!("invalid redis url: {e}")))?;
        Ok(Self::new(client))
    }

    async fn conn(&self) -> Result<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(|e| PiiError::Transient(format!("redis connection failed: {e}")))
    }
}

#[async_trait]
impl KvCache for RedisKvCache {
    async fn set_ex(&self, key: &str, value: &str, ttl_seconds: u64) -> Result<()> {
        let mut conn = self.conn().await?;
        redis::cmd("SETEX")
            .arg(key)
            .arg(ttl_seconds)
            .arg(value)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| PiiError::Transient(format!("SETEX failed: {e}")))
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn().await?;
        redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| PiiError::Transient(format!("GET failed: {e}")))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.conn().await?;
        redis::cmd("DEL")
            .arg(key)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| PiiError::Transient(format!("DEL failed: {e}")))
    }

    async fn rpush(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.conn().await?;
        redis::cmd("RPUSH")
            .arg(key)
            .arg(value)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| PiiError::Transient(format!("RPUSH failed: {e}")))
    }

    async fn ltrim(&self, key: &str, start: i64, stop: i64) -> Result<()> {
        let mut conn = self.conn().await?;
        redis::cmd("LTRIM")
            .arg(key)
            .arg(start)
            .arg(stop)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| PiiError::Transient(format!("LTRIM failed: {e}")))
    }

    async fn expire(&self, key: &str, ttl_seconds: u64) -> Result<()> {
        let mut conn = self.conn().await?;
        redis::cmd("EXPIRE")
            .arg(key)
            .arg(ttl_seconds)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| PiiError::Transient(format!("EXPIRE failed: {e}")))
    }

    async fn lrange_all(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.conn().await?;
        redis::cmd("LRANGE")
            .arg(key)
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await
            .map_err(|e| PiiError::Transient(format!("LRANGE failed: {e}")))
    }
}

/// In-process fake used by the binaries' own test suites — no network
/// dependency, exact TTL-expiry semantics via a wall-clock check.
#[cfg(any(test, feature = "test-util"))]
pub mod fake {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct Entry {
        value: String,
        expires_at: Option<chrono::DateTime<chrono::Utc>>,
    }

    #[derive(Default)]
    pub struct FakeKvCache {
        strings: Mutex<HashMap<String, Entry>>,
        lists: Mutex<HashMap<String, Vec<String>>>,
    }

    impl FakeKvCache {
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl KvCache for FakeKvCache {
        async fn set_ex(&self, key: &str, value: &str, ttl_seconds: u64) -> Result<()> {
            let expires_at = chrono::Utc::now() + chrono::Duration::seconds(ttl_seconds as i64);
            self.strings.lock().unwrap().insert(
                key.to_string(),
                Entry {
                    value: value.to_string(),
                    expires_at: Some(expires_at),
                },
            );
            Ok(())
        }

        async fn get(&self, key: &str) -> Result<Option<String>> {
            let mut strings = self.strings.lock().unwrap();
            match strings.get(key) {
                Some(entry) => {
                    if let Some(expires_at) = entry.expires_at {
                        if chrono::Utc::now() > expires_at {
                            strings.remove(key);
                            return Ok(None);
                        }
                    }
                    Ok(Some(entry.value.clone()))
                }
                None => Ok(None),
            }
        }

        async fn delete(&self, key: &str) -> Result<()> {
            self.strings.lock().unwrap().remove(key);
            self.lists.lock().unwrap().remove(key);
            Ok(())
        }

        async fn rpush(&self, key: &str, value: &str) -> Result<()> {
            self.lists
                .lock()
                .unwrap()
                .entry(key.to_string())
                .or_default()
                .push(value.to_string());
            Ok(())
        }

        async fn ltrim(&self, key: &str, start: i64, stop: i64) -> Result<()> {
            let mut lists = self.lists.lock().unwrap();
            if let Some(list) = lists.get_mut(key) {
                let len = list.len() as i64;
                let norm = |i: i64| -> usize {
                    if i < 0 {
                        (len + i).max(0) as usize
                    } else {
                        i.min(len) as usize
                    }
                };
                let start = norm(start);
                let stop = (norm(stop) + 1).min(list.len());
                *list = if start < stop {
                    list[start..stop].to_vec()
                } else {
                    Vec::new()
                };
            }
            Ok(())
        }

        async fn expire(&self, _key: &str, _ttl_seconds: u64) -> Result<()> {
            // Lists in the fake never expire on their own; tests that care
            // about list TTL assert against `ltrim`/`delete` calls instead.
            Ok(())
        }

        async fn lrange_all(&self, key: &str) -> Result<Vec<String>> {
            Ok(self.lists.lock().unwrap().get(key).cloned().unwrap_or_default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::FakeKvCache;
    use super::*;

    #[tokio::test]
    async fn set_ex_then_get_round_trips() {
        let cache = FakeKvCache::new();
        cache.set_ex("context:c1", "armed", 90).await.unwrap();
        assert_eq!(cache.get("context:c1").await.unwrap(), Some("armed".to_string()));
    }

    #[tokio::test]
    async fn missing_key_is_none_not_error() {
        let cache = FakeKvCache::new();
        assert_eq!(cache.get("context:missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn ltrim_keeps_last_n_elements() {
        let cache = FakeKvCache::new();
        for i in 0..10 {
            cache.rpush("utterances:c1", &i.to_string()).await.unwrap();
        }
        cache.ltrim("utterances:c1", -5, -1).await.unwrap();
        let remaining = cache.lrange_all("utterances:c1").await.unwrap();
        assert_eq!(remaining, vec!["5", "6", "7", "8", "9"]);
    }
}
