//! Redis implementation of the counter store contract.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, RedisError};
use tracing::info;

use super::backend::{AdapterError, CounterBackend};
use super::key::override_key;
use super::quota::Quota;

/// Overrides are administrative records and outlive any counting window.
const OVERRIDE_RETENTION_SECS: u64 = 5 * 365 * 24 * 60 * 60;

impl From<RedisError> for AdapterError {
    fn from(e: RedisError) -> Self {
        AdapterError::Unavailable(e.to_string())
    }
}

/// Counter store backed by a shared Redis instance.
#[derive(Clone)]
pub struct RedisBackend {
    connection: ConnectionManager,
    prefix: String,
}

impl RedisBackend {
    /// Connect to Redis.
    /// url: "redis://127.0.0.1:6379"
    pub async fn connect(url: &str, prefix: &str) -> Result<Self, AdapterError> {
        let client = Client::open(url)?;
        let connection = ConnectionManager::new(client).await?;
        info!(url = %url, "Connected to counter store");
        Ok(Self {
            connection,
            prefix: prefix.to_string(),
        })
    }
}

#[async_trait]
impl CounterBackend for RedisBackend {
    async fn increment(&self, key: &str) -> Result<u64, AdapterError> {
        let mut conn = self.connection.clone();
        let count: i64 = conn.incr(key, 1).await?;
        u64::try_from(count)
            .map_err(|_| AdapterError::Malformed(format!("negative count {} for {}", count, key)))
    }

    async fn expire(&self, key: &str, window_secs: u64) -> Result<(), AdapterError> {
        let mut conn = self.connection.clone();
        let _: () = conn.expire(key, window_secs as i64).await?;
        Ok(())
    }

    async fn ttl_millis(&self, key: &str) -> Result<Option<u64>, AdapterError> {
        let mut conn = self.connection.clone();
        // -2: no such key, -1: no expiry
        let ttl: i64 = conn.pttl(key).await?;
        Ok(u64::try_from(ttl).ok())
    }

    async fn get_override(&self, caller_id: &str) -> Result<Option<Quota>, AdapterError> {
        let mut conn = self.connection.clone();
        let raw: Option<String> = conn.get(override_key(&self.prefix, caller_id)).await?;
        raw.map(|json| {
            serde_json::from_str(&json).map_err(|e| AdapterError::Malformed(e.to_string()))
        })
        .transpose()
    }

    async fn set_override(&self, caller_id: &str, quota: Quota) -> Result<(), AdapterError> {
        let mut conn = self.connection.clone();
        let json = serde_json::to_string(&quota).map_err(|e| AdapterError::Malformed(e.to_string()))?;
        let _: () = conn
            .set_ex(override_key(&self.prefix, caller_id), json, OVERRIDE_RETENTION_SECS)
            .await?;
        Ok(())
    }

    async fn delete_override(&self, caller_id: &str) -> Result<(), AdapterError> {
        let mut conn = self.connection.clone();
        let _: () = conn.del(override_key(&self.prefix, caller_id)).await?;
        Ok(())
    }

    async fn clear(&self, key: &str) -> Result<(), AdapterError> {
        let mut conn = self.connection.clone();
        let _: () = conn.del(key).await?;
        Ok(())
    }
}
