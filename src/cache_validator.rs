use moka::future::Cache;
use serde::{de::DeserializeOwned, Serialize};
use sha2::{Digest, Sha256};
use std::marker::PhantomData;
use std::time::Duration;

/// Cached JSON payload plus its SHA-256 checksum.
///
/// Entries whose checksum no longer matches are treated as misses, so a
/// corrupted entry costs one refetch instead of a wrong score.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ValidatedCacheEntry {
    pub data: String,
    /// Hex-encoded SHA-256 of `data`.
    pub checksum: String,
}

impl ValidatedCacheEntry {
    pub fn new(data: String) -> Self {
        let checksum = Self::compute_checksum(&data);
        Self { data, checksum }
    }

    fn compute_checksum(data: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(data.as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn is_valid(&self) -> bool {
        Self::compute_checksum(&self.data) == self.checksum
    }
}

/// Typed TTL cache over checksummed JSON entries.
#[derive(Clone)]
pub struct ChecksummedCache<V> {
    entries: Cache<String, ValidatedCacheEntry>,
    _value: PhantomData<fn() -> V>,
}

impl<V> ChecksummedCache<V>
where
    V: Serialize + DeserializeOwned,
{
    pub fn new(ttl: Duration, capacity: u64) -> Self {
        Self {
            entries: Cache::builder()
                .time_to_live(ttl)
                .max_capacity(capacity)
                .build(),
            _value: PhantomData,
        }
    }

    /// Returns the cached value, evicting it if validation fails.
    pub async fn get(&self, key: &str) -> Option<V> {
        let entry = self.entries.get(key).await?;
        if !entry.is_valid() {
            tracing::warn!(
                "Cache validation failed for '{}': checksum mismatch ({} bytes)",
                key,
                entry.data.len()
            );
            self.entries.invalidate(key).await;
            return None;
        }
        match serde_json::from_str(&entry.data) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!("Dropping undecodable cache entry '{}': {}", key, e);
                self.entries.invalidate(key).await;
                None
            }
        }
    }

    pub async fn insert(&self, key: String, value: &V) {
        match serde_json::to_string(value) {
            Ok(json) => self.entries.insert(key, ValidatedCacheEntry::new(json)).await,
            Err(e) => tracing::warn!("Not caching '{}': {}", key, e),
        }
    }

    #[cfg(test)]
    async fn put_raw(&self, key: String, entry: ValidatedCacheEntry) {
        self.entries.insert(key, entry).await;
    }
}
