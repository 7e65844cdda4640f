//! TTL key-value store used for upload session payloads.
//!
//! The engine only needs set/get/delete with a per-key lifetime. The
//! in-process implementation is a moka cache with per-entry expiry.

use std::time::{Duration, Instant};

use moka::sync::Cache;
use moka::Expiry;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::Result;

/// Self-expiring key-value store.
pub trait TtlStore: Send + Sync {
    /// Store `value` under `key` for `ttl`.
    fn set(&self, key: &str, value: String, ttl: Duration);

    /// Fetch a live value.
    fn get(&self, key: &str) -> Option<String>;

    /// Remove a value. Missing keys are ignored.
    fn delete(&self, key: &str);
}

impl dyn TtlStore {
    /// Serialize `value` as JSON and store it.
    pub fn set_json<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) -> Result<()> {
        self.set(key, serde_json::to_string(value)?, ttl);
        Ok(())
    }

    /// Fetch and deserialize a JSON value.
    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key) {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }
}

#[derive(Clone)]
struct Entry {
    value: String,
    ttl: Duration,
}

struct PerEntryTtl;

impl Expiry<String, Entry> for PerEntryTtl {
    fn expire_after_create(
        &self,
        _key: &String,
        entry: &Entry,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(entry.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        entry: &Entry,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(entry.ttl)
    }
}

/// In-process [`TtlStore`].
pub struct MemoryStore {
    cache: Cache<String, Entry>,
}

impl MemoryStore {
    /// Create a store holding at most `max_entries` live keys.
    pub fn new(max_entries: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_entries)
            .expire_after(PerEntryTtl)
            .build();
        Self { cache }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(100_000)
    }
}

impl TtlStore for MemoryStore {
    fn set(&self, key: &str, value: String, ttl: Duration) {
        self.cache.insert(key.to_string(), Entry { value, ttl });
    }

    fn get(&self, key: &str) -> Option<String> {
        self.cache.get(key).map(|entry| entry.value)
    }

    fn delete(&self, key: &str) {
        self.cache.invalidate(key);
    }
}
