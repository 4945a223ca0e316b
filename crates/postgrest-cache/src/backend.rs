use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("redis: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("corrupt cache entry: {0}")]
    Corrupt(#[source] serde_json::Error),

    #[error("failed to serialize response: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("invalid store address {0:?}, expected host:port")]
    InvalidAddress(String),
}

/// An expiring key-value store holding serialized responses.
///
/// Implementations must be safe to share between request tasks; the proxy
/// holds one behind an `Arc` and never locks around it.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// `Ok(None)` means the key does not exist (or has expired).
    async fn get(&self, key: &str) -> StoreResult<Option<Bytes>>;

    /// Write `value`, replacing any existing entry, expiring after `ttl`.
    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> StoreResult<()>;

    /// Returns whether an entry was removed.
    async fn delete(&self, key: &str) -> StoreResult<bool>;

    fn name(&self) -> &'static str;
}
