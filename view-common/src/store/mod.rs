//! # Store
//!
//! The fast intermediate store holding recent-viewer sets, pending counters and
//! dirty sets. Every method is a single atomic operation on the backing store:
//! concurrent workers rely on that instead of on any ordering between them.
use std::time;

use async_trait::async_trait;
use thiserror::Error;

mod memory;
mod redis;

pub use self::memory::MemoryDedupStore;
pub use self::redis::RedisDedupStore;

/// Enumeration of errors returned by a `DedupStore`.
/// All of them are treated as transient by callers except `InvalidConfiguration`.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("redis command {command} failed with: {error}")]
    Redis {
        command: &'static str,
        error: ::redis::RedisError,
    },
    #[error("store operation {0} timed out")]
    Timeout(&'static str),
    #[error("invalid store configuration: {0}")]
    InvalidConfiguration(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[async_trait]
pub trait DedupStore: Send + Sync {
    /// Add `member` to the set at `key`. Returns true if it was not already a
    /// member. With a `ttl`, a newly added member resets the set's expiry to the
    /// full `ttl`, and a set without an expiry always gets one.
    async fn add_to_set(
        &self,
        key: &str,
        member: &str,
        ttl: Option<time::Duration>,
    ) -> StoreResult<bool>;

    /// Remove `member` from the set at `key`. Removing a non-member is a no-op.
    async fn remove_from_set(&self, key: &str, member: &str) -> StoreResult<()>;

    /// All members of the set at `key`; empty if the set does not exist.
    async fn set_members(&self, key: &str) -> StoreResult<Vec<String>>;

    /// Add `delta` to the counter at `key`, creating it at zero. Returns the new value.
    async fn increment_by(&self, key: &str, delta: i64) -> StoreResult<i64>;

    /// Read the counter at `key` and delete it in one step. Missing counters read as zero.
    async fn get_and_delete(&self, key: &str) -> StoreResult<i64>;

    /// Whether any value is stored at `key`.
    async fn exists(&self, key: &str) -> StoreResult<bool>;
}
