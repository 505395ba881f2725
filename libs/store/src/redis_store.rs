use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;

use crate::{Result, Store};

/// Redis-backed store. The connection manager reconnects on its own; while
/// the server is away every operation fails with
/// [`StoreError::Unavailable`](crate::StoreError::Unavailable).
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;

        Ok(Self { conn })
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>> {
        Ok(self.conn.clone().hget(key, field).await?)
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let _: i64 = self.conn.clone().hset(key, field, value).await?;

        Ok(())
    }

    async fn hash_del(&self, key: &str, field: &str) -> Result<()> {
        let _: i64 = self.conn.clone().hdel(key, field).await?;

        Ok(())
    }

    async fn hash_keys(&self, key: &str) -> Result<Vec<String>> {
        Ok(self.conn.clone().hkeys(key).await?)
    }

    async fn hash_get_all(&self, key: &str) -> Result<Vec<(String, String)>> {
        let map: std::collections::HashMap<String, String> = self.conn.clone().hgetall(key).await?;

        Ok(map.into_iter().collect())
    }

    async fn hash_get_many(&self, key: &str, fields: &[String]) -> Result<Vec<Option<String>>> {
        if fields.is_empty() {
            return Ok(vec![]);
        }

        let mut cmd = redis::cmd("HMGET");
        cmd.arg(key);
        for field in fields {
            cmd.arg(field);
        }

        let mut conn = self.conn.clone();
        Ok(cmd.query_async(&mut conn).await?)
    }

    async fn hash_incr_by(&self, key: &str, field: &str, delta: i64) -> Result<i64> {
        Ok(self.conn.clone().hincr(key, field, delta).await?)
    }

    async fn scalar_get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.conn.clone().get(key).await?)
    }

    async fn scalar_set(&self, key: &str, value: &str) -> Result<()> {
        let _: () = self.conn.clone().set(key, value).await?;

        Ok(())
    }

    async fn zset_add(&self, key: &str, member: &str, score: f64) -> Result<()> {
        let _: i64 = self.conn.clone().zadd(key, member, score).await?;

        Ok(())
    }

    async fn zset_score(&self, key: &str, member: &str) -> Result<Option<f64>> {
        Ok(self.conn.clone().zscore(key, member).await?)
    }

    async fn zset_range_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
        limit: usize,
    ) -> Result<Vec<String>> {
        Ok(self
            .conn
            .clone()
            .zrangebyscore_limit(key, min, max, 0, limit as isize)
            .await?)
    }

    async fn zset_members(&self, key: &str) -> Result<Vec<String>> {
        Ok(self.conn.clone().zrange(key, 0, -1).await?)
    }

    async fn zset_remove(&self, key: &str, member: &str) -> Result<()> {
        let _: i64 = self.conn.clone().zrem(key, member).await?;

        Ok(())
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<()> {
        let _: i64 = self.conn.clone().publish(channel, message).await?;

        Ok(())
    }
}
