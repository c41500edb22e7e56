//! Remote counter store backed by Redis.
//!
//! Any store with an atomic increment and millisecond TTLs satisfies
//! [`RemoteCounterStore`]; [`RedisCounterStore`] maps it onto `INCR`,
//! `PEXPIRE` and `PTTL`.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::Client;
use tracing::info;

use crate::config::RemoteConfig;
use crate::error::Result;

/// Shared counter store reachable from every process instance.
#[async_trait]
pub trait RemoteCounterStore: Send + Sync {
    /// Atomically increment the counter for `key`, returning the new count.
    async fn increment(&self, key: &str) -> Result<u64>;

    /// Expire the counter for `key` after `window_ms` milliseconds.
    async fn set_expiry(&self, key: &str, window_ms: u64) -> Result<()>;

    /// Milliseconds left before `key` expires; negative when the store has
    /// no expiry for it.
    async fn time_to_live(&self, key: &str) -> Result<i64>;
}

/// Redis-backed counter store.
#[derive(Clone)]
pub struct RedisCounterStore {
    connection: ConnectionManager,
    key_prefix: String,
}

impl RedisCounterStore {
    /// Wrap an existing connection manager.
    pub fn new(connection: ConnectionManager, key_prefix: impl Into<String>) -> Self {
        Self {
            connection,
            key_prefix: key_prefix.into(),
        }
    }

    /// Open a managed connection to the Redis instance at `url`.
    pub async fn connect(url: &str, config: &RemoteConfig) -> Result<Self> {
        let manager_config = ConnectionManagerConfig::new()
            .set_number_of_retries(config.retries)
            .set_connection_timeout(Duration::from_millis(config.connection_timeout_ms));

        let client = Client::open(url)?;
        let connection = client
            .get_connection_manager_with_config(manager_config)
            .await?;

        info!(prefix = %config.key_prefix, "Connected to remote counter store");
        Ok(Self::new(connection, config.key_prefix.clone()))
    }

    /// The key actually stored in Redis for `key`.
    pub fn namespaced(&self, key: &str) -> String {
        namespaced_key(&self.key_prefix, key)
    }
}

fn namespaced_key(prefix: &str, key: &str) -> String {
    format!("{}{}", prefix, key)
}

#[async_trait]
impl RemoteCounterStore for RedisCounterStore {
    async fn increment(&self, key: &str) -> Result<u64> {
        let mut connection = self.connection.clone();
        let count = redis::cmd("INCR")
            .arg(self.namespaced(key))
            .query_async::<u64>(&mut connection)
            .await?;
        Ok(count)
    }

    async fn set_expiry(&self, key: &str, window_ms: u64) -> Result<()> {
        let mut connection = self.connection.clone();
        redis::cmd("PEXPIRE")
            .arg(self.namespaced(key))
            .arg(window_ms)
            .query_async::<i64>(&mut connection)
            .await?;
        Ok(())
    }

    async fn time_to_live(&self, key: &str) -> Result<i64> {
        let mut connection = self.connection.clone();
        let ttl = redis::cmd("PTTL")
            .arg(self.namespaced(key))
            .query_async::<i64>(&mut connection)
            .await?;
        Ok(ttl)
    }
}
