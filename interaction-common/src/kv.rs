//! # Key/value store
//!
//! Shared per-user metadata: callback failure counters and cached user profiles.
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Retention applied to users who never configured one.
pub const DEFAULT_RETENTION_INTERVAL_SECS: i64 = 7200;

#[derive(Error, Debug)]
pub enum KvError {
    #[error("redis command failed with: {0}")]
    RedisError(#[from] redis::RedisError),
    #[error("value stored at {0} is not an integer")]
    NotAnInteger(String),
    #[error("value stored at {key} is not a valid profile: {error}")]
    ProfileError {
        key: String,
        error: serde_json::Error,
    },
    #[error("incrementing {0} would overflow")]
    Overflow(String),
    #[error("the in-memory store lock was poisoned")]
    Poisoned,
}

pub type KvResult<T> = std::result::Result<T, KvError>;

/// The operations the pipeline needs from a key/value store.
/// `increment` must be atomic: many callback tasks bump the same counter concurrently.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> KvResult<Option<String>>;

    async fn set(&self, key: &str, value: String) -> KvResult<()>;

    async fn delete(&self, key: &str) -> KvResult<()>;

    /// Add `delta` to the integer stored at `key`, treating a missing key as 0, and return the new value.
    async fn increment(&self, key: &str, delta: i64) -> KvResult<i64>;
}

/// A process-local store. Every operation runs under a single lock.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> KvResult<Option<String>> {
        let entries = self.entries.lock().map_err(|_| KvError::Poisoned)?;
        Ok(entries.get(key).cloned())
    }

    async fn set(&self, key: &str, value: String) -> KvResult<()> {
        let mut entries = self.entries.lock().map_err(|_| KvError::Poisoned)?;
        entries.insert(key.to_owned(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> KvResult<()> {
        let mut entries = self.entries.lock().map_err(|_| KvError::Poisoned)?;
        entries.remove(key);
        Ok(())
    }

    async fn increment(&self, key: &str, delta: i64) -> KvResult<i64> {
        let mut entries = self.entries.lock().map_err(|_| KvError::Poisoned)?;
        let current = match entries.get(key) {
            Some(value) => value
                .parse::<i64>()
                .map_err(|_| KvError::NotAnInteger(key.to_owned()))?,
            None => 0,
        };
        let updated = current
            .checked_add(delta)
            .ok_or_else(|| KvError::Overflow(key.to_owned()))?;
        entries.insert(key.to_owned(), updated.to_string());
        Ok(updated)
    }
}

/// A store backed by Redis, for deployments running more than one process.
#[derive(Clone)]
pub struct RedisStore {
    connection: redis::aio::MultiplexedConnection,
}

impl RedisStore {
    pub async fn new(url: &str) -> KvResult<Self> {
        let client = redis::Client::open(url)?;
        let connection = client.get_multiplexed_async_connection().await?;

        Ok(Self { connection })
    }
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn get(&self, key: &str) -> KvResult<Option<String>> {
        let mut connection = self.connection.clone();
        let value: Option<String> = connection.get(key).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: String) -> KvResult<()> {
        let mut connection = self.connection.clone();
        connection.set::<_, _, ()>(key, value).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> KvResult<()> {
        let mut connection = self.connection.clone();
        connection.del::<_, ()>(key).await?;
        Ok(())
    }

    async fn increment(&self, key: &str, delta: i64) -> KvResult<i64> {
        let mut connection = self.connection.clone();
        let updated: i64 = connection.incr(key, delta).await?;
        Ok(updated)
    }
}

/// Per-user count of consecutive callback failures.
/// A missing counter means no failures since the last successful delivery.
#[derive(Clone)]
pub struct FailureCounter {
    store: Arc<dyn KeyValueStore>,
}

impl FailureCounter {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    pub fn key(user_id: i64) -> String {
        format!("{user_id}.errcount")
    }

    pub async fn count(&self, user_id: i64) -> KvResult<i64> {
        let key = Self::key(user_id);
        match self.store.get(&key).await? {
            Some(value) => value.parse::<i64>().map_err(|_| KvError::NotAnInteger(key)),
            None => Ok(0),
        }
    }

    pub async fn record_failure(&self, user_id: i64) -> KvResult<i64> {
        self.store.increment(&Self::key(user_id), 1).await
    }

    pub async fn clear(&self, user_id: i64) -> KvResult<()> {
        self.store.delete(&Self::key(user_id)).await
    }
}

fn default_retention_interval_secs() -> i64 {
    DEFAULT_RETENTION_INTERVAL_SECS
}

/// The slice of a user's profile the pipeline reads.
#[derive(Deserialize, Serialize, Debug, PartialEq, Eq, Clone)]
pub struct UserProfile {
    pub id: i64,
    #[serde(default = "default_retention_interval_secs")]
    pub retention_interval_secs: i64,
}

impl UserProfile {
    pub fn new(id: i64) -> Self {
        Self {
            id,
            retention_interval_secs: DEFAULT_RETENTION_INTERVAL_SECS,
        }
    }

    pub fn with_retention_interval(mut self, secs: i64) -> Self {
        self.retention_interval_secs = secs;
        self
    }
}

/// Cached user profiles, warmed by whichever part of the service loads users.
#[derive(Clone)]
pub struct ProfileCache {
    store: Arc<dyn KeyValueStore>,
}

impl ProfileCache {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    pub fn key(user_id: i64) -> String {
        format!("{user_id}.user")
    }

    pub async fn get(&self, user_id: i64) -> KvResult<Option<UserProfile>> {
        let key = Self::key(user_id);
        match self.store.get(&key).await? {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|error| KvError::ProfileError { key, error }),
            None => Ok(None),
        }
    }

    pub async fn put(&self, profile: &UserProfile) -> KvResult<()> {
        let key = Self::key(profile.id);
        let raw = match serde_json::to_string(profile) {
            Ok(raw) => raw,
            Err(error) => return Err(KvError::ProfileError { key, error }),
        };
        self.store.set(&key, raw).await
    }
}
