//! Key-value cache client.
//!
//! The cache store only needs hash-map semantics per key plus an atomic
//! rename of one map to another. The builder fills temporary maps and
//! publishes them over the canonical names; readers never see a partial map.

use async_trait::async_trait;
use redis::aio::ConnectionManager;

#[derive(thiserror::Error, Debug)]
pub enum KvError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// Minimal cache-store contract. Connection errors propagate to the caller;
/// there is no local fallback.
#[async_trait]
pub trait KvCache: Send + Sync {
    /// Sets one field of a hash map.
    async fn hset(&self, map: &str, key: &str, value: &str) -> Result<(), KvError>;

    /// Reads one field of a hash map. Absent maps and absent fields both
    /// return `None`.
    async fn hget(&self, map: &str, key: &str) -> Result<Option<String>, KvError>;

    /// Deletes a whole map. Used to discard a stale temporary map before a
    /// refresh starts filling it.
    async fn del(&self, map: &str) -> Result<(), KvError>;

    /// Makes `temp_map` visible under `final_map` in one indivisible step.
    ///
    /// If the temporary map holds no entries (it was never created), the
    /// final map is deleted instead, so an empty projection reads as absent
    /// rather than as the previous generation.
    async fn publish(&self, temp_map: &str, final_map: &str) -> Result<(), KvError>;
}

/// Redis-backed implementation. `HSET`/`HGET` for fields, `RENAME` for the
/// atomic publish.
pub struct RedisKv {
    conn: ConnectionManager,
}

impl RedisKv {
    pub async fn connect(url: &str) -> Result<Self, KvError> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        Ok(RedisKv { conn })
    }
}

#[async_trait]
impl KvCache for RedisKv {
    async fn hset(&self, map: &str, key: &str, value: &str) -> Result<(), KvError> {
        let mut conn = self.conn.clone();
        redis::cmd("HSET")
            .arg(map)
            .arg(key)
            .arg(value)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn hget(&self, map: &str, key: &str) -> Result<Option<String>, KvError> {
        let mut conn = self.conn.clone();
        let value = redis::cmd("HGET")
            .arg(map)
            .arg(key)
            .query_async::<Option<String>>(&mut conn)
            .await?;
        Ok(value)
    }

    async fn del(&self, map: &str) -> Result<(), KvError> {
        let mut conn = self.conn.clone();
        redis::cmd("DEL").arg(map).query_async::<()>(&mut conn).await?;
        Ok(())
    }

    async fn publish(&self, temp_map: &str, final_map: &str) -> Result<(), KvError> {
        let mut conn = self.conn.clone();
        let exists = redis::cmd("EXISTS")
            .arg(temp_map)
            .query_async::<bool>(&mut conn)
            .await?;
        if exists {
            redis::cmd("RENAME")
                .arg(temp_map)
                .arg(final_map)
                .query_async::<()>(&mut conn)
                .await?;
        } else {
            redis::cmd("DEL")
                .arg(final_map)
                .query_async::<()>(&mut conn)
                .await?;
        }
        Ok(())
    }
}
