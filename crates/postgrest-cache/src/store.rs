use crate::backend::{KvStore, StoreError, StoreResult};
use crate::response::CachedResponse;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;

/// Outcome of a successful store read.
#[derive(Debug)]
pub enum Lookup {
    /// `size` is the length of the serialized entry.
    Hit { response: CachedResponse, size: usize },
    Miss,
}

impl Lookup {
    pub fn is_hit(&self) -> bool {
        matches!(self, Lookup::Hit { .. })
    }
}

/// Reads and writes [`CachedResponse`]s in a [`KvStore`] with a fixed TTL.
#[derive(Clone)]
pub struct ResponseStore {
    backend: Arc<dyn KvStore>,
    ttl: Duration,
}

impl ResponseStore {
    pub fn new(backend: Arc<dyn KvStore>, ttl: Duration) -> Self {
        tracing::info!(
            backend = backend.name(),
            ttl_secs = ttl.as_secs_f64(),
            "response store initialized"
        );
        Self { backend, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Look up `key`. A missing key is `Ok(Lookup::Miss)`; connectivity
    /// problems and undecodable entries are errors.
    pub async fn get(&self, key: &str) -> StoreResult<Lookup> {
        let Some(data) = self.backend.get(key).await? else {
            return Ok(Lookup::Miss);
        };
        let response = CachedResponse::decode(&data).map_err(StoreError::Corrupt)?;
        Ok(Lookup::Hit {
            response,
            size: data.len(),
        })
    }

    /// Store `response` under `key` for the configured TTL. Returns the
    /// serialized size.
    pub async fn set(&self, key: &str, response: &CachedResponse) -> StoreResult<usize> {
        let data = response.encode().map_err(StoreError::Serialize)?;
        let size = data.len();
        self.backend.set(key, Bytes::from(data), self.ttl).await?;
        Ok(size)
    }

    pub async fn delete(&self, key: &str) -> StoreResult<bool> {
        self.backend.delete(key).await
    }
}
