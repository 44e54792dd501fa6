//! Shared cache interface over a persistent key-value store.
//!
//! The cache backs the job store, the per-user start lock, the device
//! probe memo, and the "running image" hint. Production uses Redis;
//! [`MemoryCache`] provides the same semantics in-process for tests and
//! single-node development.

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

use anyhow::Context;
use anyhow::Result;
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::Rng;
use redis::AsyncCommands;

/// Script that releases a lock only if the holder's token still matches.
const UNLOCK_SCRIPT: &str =
    "if redis.call('get', KEYS[1]) == ARGV[1] then return redis.call('del', KEYS[1]) else return \
     0 end";

/// A held advisory lock.
///
/// The lease is a safety net: if the holder disappears the lock expires on
/// its own. Release explicitly with [`Cache::unlock`].
#[derive(Debug, Clone)]
pub struct CacheLock {
    /// The lock key.
    pub key: String,
    /// The holder token; releasing requires it to still match.
    pub token: String,
}

/// Shared key-value cache with TTL and advisory locking.
///
/// A `ttl` of `None` stores the value without expiry; the "running
/// image" hint relies on this to outlive every bounded entry.
#[async_trait]
pub trait Cache: Send + Sync + fmt::Debug {
    /// Get a value, or `None` if absent or expired.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Store a value, with an optional time-to-live.
    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    /// Delete a value.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Try to acquire an advisory lock without blocking.
    ///
    /// Returns `None` if another holder currently owns the lock.
    async fn try_lock(&self, key: &str, lease: Duration) -> Result<Option<CacheLock>>;

    /// Release a lock previously returned by [`Cache::try_lock`].
    async fn unlock(&self, lock: &CacheLock) -> Result<()>;
}

/// Generate an opaque lock-holder token.
fn lock_token() -> String {
    let bytes: [u8; 16] = rand::rng().random();
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Redis-backed cache.
#[derive(Clone)]
pub struct RedisCache {
    /// The managed (auto-reconnecting) connection.
    manager: redis::aio::ConnectionManager,
}

impl fmt::Debug for RedisCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisCache").finish_non_exhaustive()
    }
}

impl RedisCache {
    /// Connect to Redis at the given URL.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid or the server is
    /// unreachable.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).context("invalid Redis URL")?;
        let manager = client
            .get_connection_manager()
            .await
            .context("failed to connect to Redis")?;
        Ok(Self { manager })
    }
}

#[async_trait]
impl Cache for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut con = self.manager.clone();
        let value: Option<String> = con.get(key).await.context("cache read failed")?;
        Ok(value)
    }

    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut con = self.manager.clone();
        match ttl {
            Some(ttl) => {
                let _: () = con
                    .set_ex(key, value, ttl.as_secs())
                    .await
                    .context("cache write failed")?;
            }
            None => {
                let _: () = con.set(key, value).await.context("cache write failed")?;
            }
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut con = self.manager.clone();
        let _: () = con.del(key).await.context("cache delete failed")?;
        Ok(())
    }

    async fn try_lock(&self, key: &str, lease: Duration) -> Result<Option<CacheLock>> {
        let mut con = self.manager.clone();
        let token = lock_token();
        let acquired: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(&token)
            .arg("NX")
            .arg("EX")
            .arg(lease.as_secs())
            .query_async(&mut con)
            .await
            .context("lock acquisition failed")?;

        Ok(acquired.map(|_| CacheLock {
            key: key.to_string(),
            token,
        }))
    }

    async fn unlock(&self, lock: &CacheLock) -> Result<()> {
        let mut con = self.manager.clone();
        let _: i64 = redis::Script::new(UNLOCK_SCRIPT)
            .key(&lock.key)
            .arg(&lock.token)
            .invoke_async(&mut con)
            .await
            .context("lock release failed")?;
        Ok(())
    }
}

/// A stored entry with its optional expiry instant.
type MemoryEntry = (String, Option<Instant>);

/// In-memory cache with the same TTL and lock semantics as Redis.
#[derive(Debug, Default)]
pub struct MemoryCache {
    /// Stored values.
    entries: Mutex<HashMap<String, MemoryEntry>>,
    /// Held locks, keyed by lock key, valued by (token, expiry).
    locks: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryCache {
    /// Create an empty in-memory cache.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut entries = self.entries.lock().expect("cache mutex should not be poisoned");
        let expired = matches!(
            entries.get(key),
            Some((_, Some(expiry))) if *expiry <= Instant::now()
        );
        if expired {
            entries.remove(key);
            return Ok(None);
        }
        Ok(entries.get(key).map(|(value, _)| value.clone()))
    }

    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let expiry = ttl.map(|ttl| Instant::now() + ttl);
        self.entries
            .lock()
            .expect("cache mutex should not be poisoned")
            .insert(key.to_string(), (value.to_string(), expiry));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries
            .lock()
            .expect("cache mutex should not be poisoned")
            .remove(key);
        Ok(())
    }

    async fn try_lock(&self, key: &str, lease: Duration) -> Result<Option<CacheLock>> {
        let mut locks = self.locks.lock().expect("lock mutex should not be poisoned");
        if let Some((_, expiry)) = locks.get(key) {
            if *expiry > Instant::now() {
                return Ok(None);
            }
        }

        let token = lock_token();
        locks.insert(key.to_string(), (token.clone(), Instant::now() + lease));
        Ok(Some(CacheLock {
            key: key.to_string(),
            token,
        }))
    }

    async fn unlock(&self, lock: &CacheLock) -> Result<()> {
        let mut locks = self.locks.lock().expect("lock mutex should not be poisoned");
        if let Some((token, _)) = locks.get(&lock.key) {
            if *token == lock.token {
                locks.remove(&lock.key);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_cache_roundtrip() {
        let cache = MemoryCache::new();
        cache.put("k", "v", None).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("v"));

        cache.delete("k").await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn memory_cache_expires() {
        let cache = MemoryCache::new();
        cache
            .put("k", "v", Some(Duration::from_millis(10)))
            .await
            .unwrap();
        std::thread::sleep(Duration::from_millis(25));
        assert_eq!(cache.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn memory_cache_no_ttl_persists() {
        let cache = MemoryCache::new();
        cache.put("k", "v", None).await.unwrap();
        std::thread::sleep(Duration::from_millis(15));
        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn lock_is_exclusive_until_released() {
        let cache = MemoryCache::new();
        let lease = Duration::from_secs(20);

        let lock = cache.try_lock("user.1.docker.lock", lease).await.unwrap();
        let lock = lock.expect("first acquisition should succeed");

        assert!(
            cache
                .try_lock("user.1.docker.lock", lease)
                .await
                .unwrap()
                .is_none()
        );

        cache.unlock(&lock).await.unwrap();

        assert!(
            cache
                .try_lock("user.1.docker.lock", lease)
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn expired_lease_can_be_reacquired() {
        let cache = MemoryCache::new();

        let _stale = cache
            .try_lock("k", Duration::from_millis(5))
            .await
            .unwrap()
            .expect("first acquisition should succeed");
        std::thread::sleep(Duration::from_millis(20));

        assert!(
            cache
                .try_lock("k", Duration::from_secs(20))
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn stale_token_does_not_release_new_lock() {
        let cache = MemoryCache::new();
        let stale = CacheLock {
            key: String::from("k"),
            token: String::from("old"),
        };

        let _held = cache
            .try_lock("k", Duration::from_secs(20))
            .await
            .unwrap()
            .expect("acquisition should succeed");

        cache.unlock(&stale).await.unwrap();
        assert!(
            cache
                .try_lock("k", Duration::from_secs(20))
                .await
                .unwrap()
                .is_none()
        );
    }
}
