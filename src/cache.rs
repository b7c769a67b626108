//! Dedup cache keyed by content digest.
//!
//! An entry under `scan:<digest>` means "this content was scanned within the
//! retention window". The value is the JSON-encoded [`ScanResult`], and the key
//! carries a TTL so that content becomes eligible for re-verification once the
//! window passes.
//!
//! Two implementations are provided:
//!
//! - [`RedisContentCache`] - production store (`EXISTS` / `SETEX`)
//! - [`MemoryContentCache`] - in-process TTL map
//!
//! # Example
//!
//! ```
//! use regscan::cache::{ContentCache, MemoryContentCache};
//! use regscan::{Artifact, ScanResult};
//! use std::time::Duration;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let cache = MemoryContentCache::new();
//! let artifact = Artifact::new("library", "sha256:ab12", "harbor.local/library/app:1")?;
//! let result = ScanResult::new(&artifact, Vec::new());
//!
//! assert!(!cache.exists(&artifact.digest).await?);
//! cache.put(&artifact.digest, &result, Duration::from_secs(3600)).await?;
//! assert!(cache.exists(&artifact.digest).await?);
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands};
use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::{timeout, Instant};
use tracing::{debug, info};

use crate::error::CacheError;
use crate::model::ScanResult;

/// Builds the cache key for a content digest.
pub fn cache_key(digest: &str) -> String {
    format!("scan:{digest}")
}

fn timed_out(command: &str, after: Duration) -> CacheError {
    CacheError::Unavailable(format!("{command} timed out after {after:?}"))
}

/// Digest-keyed record of completed scans.
#[async_trait]
pub trait ContentCache: Send + Sync {
    /// Returns the human-readable name of this cache backend.
    fn name(&self) -> &'static str;

    /// Returns true if `digest` was scanned within the retention window.
    async fn exists(&self, digest: &str) -> Result<bool, CacheError>;

    /// Records `result` for `digest`, expiring after `ttl`.
    async fn put(&self, digest: &str, result: &ScanResult, ttl: Duration) -> Result<(), CacheError>;
}

/// Redis-backed cache.
///
/// The connection manager reconnects on its own after a dropped connection, so
/// a cache outage shows up as per-call [`CacheError`]s rather than a dead handle.
#[derive(Clone)]
pub struct RedisContentCache {
    conn: ConnectionManager,
    timeout: Duration,
}

impl fmt::Debug for RedisContentCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisContentCache")
            .field("connection", &"ConnectionManager")
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl RedisContentCache {
    /// Connects to Redis. Failing here is fatal at startup.
    pub async fn connect(redis_url: &str, call_timeout: Duration) -> Result<Self, CacheError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| CacheError::Unavailable(format!("invalid Redis URL: {e}")))?;

        let conn = timeout(call_timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| timed_out("connect", call_timeout))?
            .map_err(|e| CacheError::Unavailable(format!("failed to connect to Redis: {e}")))?;

        info!("connected to Redis dedup cache");

        Ok(Self {
            conn,
            timeout: call_timeout,
        })
    }
}

#[async_trait]
impl ContentCache for RedisContentCache {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn exists(&self, digest: &str) -> Result<bool, CacheError> {
        let key = cache_key(digest);
        let mut conn = self.conn.clone();

        let found: bool = timeout(self.timeout, conn.exists(key.as_str()))
            .await
            .map_err(|_| timed_out("EXISTS", self.timeout))?
            .map_err(|e| CacheError::Unavailable(format!("Redis EXISTS failed: {e}")))?;

        debug!(key = %key, found, "cache lookup");
        Ok(found)
    }

    async fn put(
        &self,
        digest: &str,
        result: &ScanResult,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let key = cache_key(digest);
        let json = serde_json::to_string(result)
            .map_err(|e| CacheError::Unavailable(format!("failed to serialize scan result: {e}")))?;
        let seconds = ttl.as_secs().max(1);
        let mut conn = self.conn.clone();

        timeout(self.timeout, conn.set_ex::<_, _, ()>(key.as_str(), json, seconds))
            .await
            .map_err(|_| timed_out("SETEX", self.timeout))?
            .map_err(|e| CacheError::Unavailable(format!("Redis SETEX failed: {e}")))?;

        debug!(key = %key, ttl_secs = seconds, "cache write");
        Ok(())
    }
}

struct MemoryEntry {
    payload: String,
    expires_at: Instant,
}

/// In-process cache with the same expiry semantics as the Redis store.
///
/// Expiry follows the tokio clock, so paused-time tests can step past the TTL.
#[derive(Default)]
pub struct MemoryContentCache {
    entries: Mutex<HashMap<String, MemoryEntry>>,
}

impl fmt::Debug for MemoryContentCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryContentCache")
            .field("entries", &self.len())
            .finish()
    }
}

impl MemoryContentCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live (unexpired) entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.lock()
            .values()
            .filter(|entry| entry.expires_at > now)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the stored result for `digest` if it has not expired.
    pub fn get(&self, digest: &str) -> Option<ScanResult> {
        let now = Instant::now();
        let entries = self.lock();
        let entry = entries.get(&cache_key(digest))?;
        if entry.expires_at <= now {
            return None;
        }
        serde_json::from_str(&entry.payload).ok()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, MemoryEntry>> {
        // A poisoned map still holds valid entries.
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl ContentCache for MemoryContentCache {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn exists(&self, digest: &str) -> Result<bool, CacheError> {
        let key = cache_key(digest);
        let now = Instant::now();
        let mut entries = self.lock();

        match entries.get(&key) {
            Some(entry) if entry.expires_at > now => Ok(true),
            Some(_) => {
                entries.remove(&key);
                Ok(false)
            }
            None => Ok(false),
        }
    }

    async fn put(
        &self,
        digest: &str,
        result: &ScanResult,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let payload = serde_json::to_string(result)
            .map_err(|e| CacheError::Unavailable(format!("failed to serialize scan result: {e}")))?;

        self.lock().insert(
            cache_key(digest),
            MemoryEntry {
                payload,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }
}
