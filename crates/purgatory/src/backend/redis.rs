//! Redis implementation of KeyValueStore
//!
//! Shares breaker state between processes:
//! - Failure counters use `INCR`, so concurrent reports are never lost
//! - Conditional state swaps run as a Lua script (atomic on the server)
//! - Record and counter are read together with `MGET`

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, RedisError, Script};
use tracing::{error, instrument};

use super::kv::KeyValueStore;
use super::store::BackendError;

/// Swap the value at KEYS[1] from ARGV[1] to ARGV[2], atomically
const COMPARE_AND_SWAP_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    redis.call('SET', KEYS[1], ARGV[2])
    return 1
end
return 0
"#;

impl From<RedisError> for BackendError {
    fn from(e: RedisError) -> Self {
        Self::Unavailable(e.to_string())
    }
}

fn unavailable(op: &str, e: RedisError) -> BackendError {
    error!("Redis {} failed: {}", op, e);
    BackendError::from(e)
}

/// [`KeyValueStore`] backed by a Redis connection manager
///
/// The connection manager reconnects on its own; while Redis is down every
/// command fails with [`BackendError::Unavailable`].
///
/// # Example
///
/// ```ignore
/// use purgatory::backend::{KvBackend, RedisKeyValueStore};
///
/// let store = RedisKeyValueStore::connect("redis://localhost:6379").await?;
/// let backend = KvBackend::new(store);
/// ```
#[derive(Clone)]
pub struct RedisKeyValueStore {
    conn: ConnectionManager,
    compare_and_swap: Script,
}

impl RedisKeyValueStore {
    /// Connect to the Redis server at `url`
    pub async fn connect(url: &str) -> Result<Self, BackendError> {
        let client = redis::Client::open(url)
            .map_err(|e| BackendError::InvalidConfig(format!("redis url: {e}")))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| unavailable("connect", e))?;
        Ok(Self::new(conn))
    }

    /// Wrap an existing connection manager
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            compare_and_swap: Script::new(COMPARE_AND_SWAP_SCRIPT),
        }
    }

    /// Get a handle on the connection (for test cleanup and diagnostics)
    pub fn connection(&self) -> ConnectionManager {
        self.conn.clone()
    }
}

#[async_trait]
impl KeyValueStore for RedisKeyValueStore {
    fn kind(&self) -> &'static str {
        "redis"
    }

    #[instrument(skip(self))]
    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>, BackendError> {
        let mut conn = self.conn.clone();
        redis::cmd("MGET")
            .arg(keys)
            .query_async(&mut conn)
            .await
            .map_err(|e| unavailable("MGET", e))
    }

    #[instrument(skip(self, value))]
    async fn set(&self, key: &str, value: &str) -> Result<(), BackendError> {
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(key, value)
            .await
            .map_err(|e| unavailable("SET", e))
    }

    #[instrument(skip(self, value))]
    async fn set_if_absent(&self, key: &str, value: &str) -> Result<bool, BackendError> {
        let mut conn = self.conn.clone();
        conn.set_nx::<_, _, bool>(key, value)
            .await
            .map_err(|e| unavailable("SETNX", e))
    }

    #[instrument(skip(self, expected, new))]
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: &str,
        new: &str,
    ) -> Result<bool, BackendError> {
        let mut conn = self.conn.clone();
        let swapped: i32 = self
            .compare_and_swap
            .key(key)
            .arg(expected)
            .arg(new)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| unavailable("compare-and-swap script", e))?;
        Ok(swapped == 1)
    }

    #[instrument(skip(self))]
    async fn incr(&self, key: &str) -> Result<i64, BackendError> {
        let mut conn = self.conn.clone();
        conn.incr::<_, _, i64>(key, 1)
            .await
            .map_err(|e| unavailable("INCR", e))
    }
}
