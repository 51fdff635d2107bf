//! Expiring key/value cache shared by the attraction and relevance layers.
//!
//! Values are stored as JSON envelopes carrying their write time and TTL.
//! Expiry is lazy: an entry is only evicted when a read finds it stale (or
//! when the optional sweep runs). Every backend failure is logged and
//! reported as a miss, so callers handle "absent" and "broken" the same way.

pub mod backend;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::sync::Arc;
#[cfg(test)]
use std::sync::atomic::{AtomicI64, Ordering};

use backend::{KvBackend, StorageError};

pub trait Clock: Send + Sync {
    fn now_millis(&self) -> i64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Clock that only moves when told to.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

#[cfg(test)]
impl ManualClock {
    pub fn new(start_millis: i64) -> Self {
        Self {
            now: AtomicI64::new(start_millis),
        }
    }

    pub fn set(&self, millis: i64) {
        self.now.store(millis, Ordering::SeqCst);
    }

    pub fn advance(&self, millis: i64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }
}

#[cfg(test)]
impl Clock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry<T> {
    pub data: T,
    /// Epoch millis at write time.
    pub timestamp: i64,
    /// TTL in millis.
    pub expires_in: i64,
}

impl<T> CacheEntry<T> {
    pub fn is_expired(&self, now_millis: i64) -> bool {
        now_millis - self.timestamp > self.expires_in
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EnvelopeHeader {
    timestamp: i64,
    expires_in: i64,
}

/// Only JSON objects are envelopes; serde would also accept a two-element
/// array for the header, which a raw value can easily be.
fn envelope_header(value: serde_json::Value) -> Option<EnvelopeHeader> {
    if !value.is_object() {
        return None;
    }
    serde_json::from_value(value).ok()
}

#[derive(Clone)]
pub struct ExpiringCache {
    backend: Arc<dyn KvBackend>,
    clock: Arc<dyn Clock>,
}

impl ExpiringCache {
    pub fn new(backend: Arc<dyn KvBackend>) -> Self {
        Self::with_clock(backend, Arc::new(SystemClock))
    }

    pub fn with_clock(backend: Arc<dyn KvBackend>, clock: Arc<dyn Clock>) -> Self {
        Self { backend, clock }
    }

    /// Raw read, no freshness check.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        match self.read_json(key).await {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!("Cache read for {} failed, treating as miss: {}", key, e);
                None
            }
        }
    }

    /// Raw write, overwrites unconditionally.
    pub async fn set<T: Serialize>(&self, key: &str, value: &T) -> bool {
        match self.write_json(key, value).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("Cache write for {} failed: {}", key, e);
                false
            }
        }
    }

    pub async fn get_cached<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let entry: CacheEntry<T> = self.get(key).await?;

        if entry.is_expired(self.clock.now_millis()) {
            tracing::debug!("Cache entry {} expired, evicting", key);
            self.remove(key).await;
            return None;
        }

        Some(entry.data)
    }

    pub async fn set_cached<T: Serialize>(&self, key: &str, data: &T, ttl_ms: i64) -> bool {
        let entry = CacheEntry {
            data,
            timestamp: self.clock.now_millis(),
            expires_in: ttl_ms,
        };
        self.set(key, &entry).await
    }

    pub async fn remove(&self, key: &str) -> bool {
        match self.backend.delete(key).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("Cache delete for {} failed: {}", key, e);
                false
            }
        }
    }

    pub async fn clear(&self) -> bool {
        let keys = match self.backend.keys().await {
            Ok(keys) => keys,
            Err(e) => {
                tracing::warn!("Cache clear failed listing keys: {}", e);
                return false;
            }
        };

        let mut ok = true;
        for key in keys {
            ok &= self.remove(&key).await;
        }
        ok
    }

    /// Evicts every stale envelope. Values written with plain `set` have no
    /// envelope and are left alone. Returns the number of evicted keys.
    pub async fn purge_expired(&self) -> usize {
        let keys = match self.backend.keys().await {
            Ok(keys) => keys,
            Err(e) => {
                tracing::warn!("Cache sweep failed listing keys: {}", e);
                return 0;
            }
        };

        let now = self.clock.now_millis();
        let mut evicted = 0;
        for key in keys {
            let value: Option<serde_json::Value> = match self.read_json(&key).await {
                Ok(value) => value,
                Err(_) => continue,
            };
            if let Some(header) = value.and_then(envelope_header) {
                if now - header.timestamp > header.expires_in && self.remove(&key).await {
                    evicted += 1;
                }
            }
        }

        if evicted > 0 {
            tracing::debug!("Cache sweep evicted {} entries", evicted);
        }
        evicted
    }

    async fn read_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StorageError> {
        match self.backend.read(key).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn write_json<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StorageError> {
        let bytes = serde_json::to_vec(value)?;
        self.backend.write(key, &bytes).await
    }
}
