//! Storage abstraction shared by the poller and the DNS driver.
//!
//! The store is a small capability set over hashes, scalars, sorted sets and
//! pub/sub, with all values serialized as compact JSON. Production uses
//! Redis; tests use [`MemStore`]. The typed [`Db`] facade knows the aprs2
//! key layout and is what the rest of the system talks to.

#![cfg_attr(test, allow(clippy::unwrap_used))]

mod avail;
mod db;
mod error;
mod mem;
mod redis_store;

pub mod keys;

pub use db::Db;
pub use error::StoreError;
pub use mem::MemStore;
pub use redis_store::RedisStore;

use async_trait::async_trait;

pub type Result<T> = std::result::Result<T, StoreError>;

/// The capability set the system needs from its shared store.
///
/// All operations are single-key and atomic on the backend; that is the only
/// cross-process synchronization the system relies on.
#[async_trait]
pub trait Store: Send + Sync {
    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>>;
    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<()>;
    async fn hash_del(&self, key: &str, field: &str) -> Result<()>;
    async fn hash_keys(&self, key: &str) -> Result<Vec<String>>;
    async fn hash_get_all(&self, key: &str) -> Result<Vec<(String, String)>>;
    /// Fetch several fields at once; absent fields come back as `None`.
    async fn hash_get_many(&self, key: &str, fields: &[String]) -> Result<Vec<Option<String>>>;
    async fn hash_incr_by(&self, key: &str, field: &str, delta: i64) -> Result<i64>;

    async fn scalar_get(&self, key: &str) -> Result<Option<String>>;
    async fn scalar_set(&self, key: &str, value: &str) -> Result<()>;

    async fn zset_add(&self, key: &str, member: &str, score: f64) -> Result<()>;
    async fn zset_score(&self, key: &str, member: &str) -> Result<Option<f64>>;
    /// Members with `min <= score <= max`, ascending, at most `limit`.
    async fn zset_range_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
        limit: usize,
    ) -> Result<Vec<String>>;
    async fn zset_members(&self, key: &str) -> Result<Vec<String>>;
    async fn zset_remove(&self, key: &str, member: &str) -> Result<()>;

    async fn publish(&self, channel: &str, message: &str) -> Result<()>;
}
