use crate::backend::{KvStore, StoreError, StoreResult};
use async_trait::async_trait;
use bytes::Bytes;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::{AsyncCommands, Client, ConnectionAddr, ConnectionInfo, RedisConnectionInfo};
use std::time::Duration;
use tokio::sync::OnceCell;

// A failed connect is retried once; requests fall back to upstream meanwhile.
const RETRY_EXPONENT_BASE: u64 = 2;
const RETRY_FACTOR_MS: u64 = 100;
const CONNECT_RETRIES: usize = 1;

/// Where to find Redis.
#[derive(Clone, Debug)]
pub struct RedisSettings {
    /// `host:port`
    pub addr: String,
    pub password: Option<String>,
    pub db: i64,
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            addr: "localhost:6379".to_string(),
            password: None,
            db: 0,
        }
    }
}

impl RedisSettings {
    fn connection_info(&self) -> StoreResult<ConnectionInfo> {
        let (host, port) = self
            .addr
            .rsplit_once(':')
            .and_then(|(host, port)| Some((host, port.parse::<u16>().ok()?)))
            .filter(|(host, _)| !host.is_empty())
            .ok_or_else(|| StoreError::InvalidAddress(self.addr.clone()))?;

        Ok(ConnectionInfo {
            addr: ConnectionAddr::Tcp(host.to_string(), port),
            redis: RedisConnectionInfo {
                db: self.db,
                password: self.password.clone(),
                ..Default::default()
            },
        })
    }
}

/// Redis-backed store.
///
/// The connection is opened on first use, so the proxy can start (and serve
/// everything as a miss) while Redis is unreachable. After that the
/// connection manager reconnects on its own and is shared by all tasks.
pub struct RedisStore {
    client: Client,
    conn: OnceCell<ConnectionManager>,
}

impl RedisStore {
    pub fn new(settings: &RedisSettings) -> StoreResult<Self> {
        let client = Client::open(settings.connection_info()?)?;
        Ok(Self {
            client,
            conn: OnceCell::new(),
        })
    }

    async fn connection(&self) -> StoreResult<ConnectionManager> {
        let conn = self
            .conn
            .get_or_try_init(|| async {
                let config = ConnectionManagerConfig::new()
                    .set_exponent_base(RETRY_EXPONENT_BASE)
                    .set_factor(RETRY_FACTOR_MS)
                    .set_number_of_retries(CONNECT_RETRIES);
                let conn = ConnectionManager::new_with_config(self.client.clone(), config).await?;
                tracing::info!("connected to redis");
                Ok::<_, StoreError>(conn)
            })
            .await?;
        Ok(conn.clone())
    }
}

#[async_trait]
impl KvStore for RedisStore {
    async fn get(&self, key: &str) -> StoreResult<Option<Bytes>> {
        let mut conn = self.connection().await?;
        let value: Option<Vec<u8>> = conn.get(key).await?;
        Ok(value.map(Bytes::from))
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> StoreResult<()> {
        let mut conn = self.connection().await?;
        // PX keeps sub-second TTLs meaningful
        let millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
        let _: () = conn.pset_ex(key, value.as_ref(), millis).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let mut conn = self.connection().await?;
        let removed: i64 = conn.del(key).await?;
        Ok(removed > 0)
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(addr: &str) -> RedisSettings {
        RedisSettings {
            addr: addr.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn parses_host_and_port() {
        let info = settings("cache.internal:6380").connection_info().unwrap();
        match info.addr {
            ConnectionAddr::Tcp(host, port) => {
                assert_eq!(host, "cache.internal");
                assert_eq!(port, 6380);
            }
            other => panic!("unexpected addr {other:?}"),
        }
        assert_eq!(info.redis.db, 0);
        assert!(info.redis.password.is_none());
    }

    #[test]
    fn carries_password_and_db() {
        let info = RedisSettings {
            addr: "localhost:6379".into(),
            password: Some("s3cret:@/".into()),
            db: 3,
        }
        .connection_info()
        .unwrap();
        assert_eq!(info.redis.db, 3);
        assert_eq!(info.redis.password.as_deref(), Some("s3cret:@/"));
    }

    #[test]
    fn rejects_bad_addresses() {
        for addr in ["localhost", "localhost:", ":6379", "localhost:notaport"] {
            assert!(
                matches!(
                    settings(addr).connection_info(),
                    Err(StoreError::InvalidAddress(_))
                ),
                "{addr} should be rejected"
            );
        }
    }

    #[test]
    fn construction_does_not_connect() {
        // nothing listens on port 1; construction must still succeed
        assert!(RedisStore::new(&settings("127.0.0.1:1")).is_ok());
    }

    #[tokio::test]
    async fn unreachable_redis_is_an_error_not_a_miss() {
        let store = RedisStore::new(&settings("127.0.0.1:1")).unwrap();
        assert!(store.get("postgrest:x").await.is_err());
    }
}
