//! Valkey / Redis implementation of [`ReservationStore`].

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use secrecy::ExposeSecret;

use crate::codes::store::ReservationStore;
use crate::config::ValkeyConfig;
use crate::error::StoreError;

/// Deletes KEYS[1] only while it still holds ARGV[1].
const RELEASE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

const OP_TIMEOUT: Duration = Duration::from_secs(5);

pub struct ValkeyReservationStore {
    conn: ConnectionManager,
    release: redis::Script,
}

impl ValkeyReservationStore {
    /// Connect and verify the server answers.
    pub async fn connect(config: &ValkeyConfig) -> Result<Self, StoreError> {
        let client = redis::Client::open(config.url().expose_secret())
            .map_err(|e| StoreError::Unavailable(format!("invalid Valkey URL: {}", e)))?;
        let conn = with_timeout(async {
            ConnectionManager::new(client).await.map_err(map_redis_err)
        })
        .await?;

        let store = Self {
            conn,
            release: redis::Script::new(RELEASE_SCRIPT),
        };
        store.ping().await?;
        tracing::info!(host = %config.host, port = config.port, db = config.db, "Connected to Valkey");
        Ok(store)
    }
}

fn map_redis_err(e: redis::RedisError) -> StoreError {
    if e.is_io_error() || e.is_connection_refusal() || e.is_connection_dropped() || e.is_timeout() {
        StoreError::Unavailable(e.to_string())
    } else {
        StoreError::Query(e.to_string())
    }
}

async fn with_timeout<T, F>(fut: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    tokio::time::timeout(OP_TIMEOUT, fut)
        .await
        .map_err(|_| StoreError::Unavailable(format!("Valkey call timed out after {:?}", OP_TIMEOUT)))?
}

#[async_trait]
impl ReservationStore for ValkeyReservationStore {
    async fn reserve(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let ttl_ms = ttl.as_millis().max(1) as u64;
        with_timeout(async {
            let reply: Option<String> = redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("NX")
                .arg("PX")
                .arg(ttl_ms)
                .query_async(&mut conn)
                .await
                .map_err(map_redis_err)?;
            Ok(reply.is_some())
        })
        .await
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        with_timeout(async {
            let n: i64 = redis::cmd("EXISTS")
                .arg(key)
                .query_async(&mut conn)
                .await
                .map_err(map_redis_err)?;
            Ok(n > 0)
        })
        .await
    }

    async fn release(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        with_timeout(async {
            let deleted: i64 = self
                .release
                .key(key)
                .arg(expected)
                .invoke_async(&mut conn)
                .await
                .map_err(map_redis_err)?;
            Ok(deleted > 0)
        })
        .await
    }

    async fn incr(&self, key: &str) -> Result<i64, StoreError> {
        let mut conn = self.conn.clone();
        with_timeout(async {
            redis::cmd("INCR")
                .arg(key)
                .query_async(&mut conn)
                .await
                .map_err(map_redis_err)
        })
        .await
    }

    async fn counter(&self, key: &str) -> Result<i64, StoreError> {
        let mut conn = self.conn.clone();
        with_timeout(async {
            let value: Option<i64> = redis::cmd("GET")
                .arg(key)
                .query_async(&mut conn)
                .await
                .map_err(map_redis_err)?;
            Ok(value.unwrap_or(0))
        })
        .await
    }

    async fn push_recent(
        &self,
        key: &str,
        member: &str,
        score: f64,
        cap: usize,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let keep_from = -(cap as i64) - 1;
        with_timeout(async {
            let () = redis::pipe()
                .atomic()
                .cmd("ZADD")
                .arg(key)
                .arg(score)
                .arg(member)
                .ignore()
                .cmd("ZREMRANGEBYRANK")
                .arg(key)
                .arg(0)
                .arg(keep_from)
                .ignore()
                .query_async(&mut conn)
                .await
                .map_err(map_redis_err)?;
            Ok(())
        })
        .await
    }

    async fn recent(&self, key: &str, limit: usize) -> Result<Vec<(String, f64)>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        with_timeout(async {
            redis::cmd("ZREVRANGE")
                .arg(key)
                .arg(0)
                .arg(limit as i64 - 1)
                .arg("WITHSCORES")
                .query_async(&mut conn)
                .await
                .map_err(map_redis_err)
        })
        .await
    }

    async fn delete(&self, keys: &[String]) -> Result<(), StoreError> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        with_timeout(async {
            let _: i64 = redis::cmd("DEL")
                .arg(keys)
                .query_async(&mut conn)
                .await
                .map_err(map_redis_err)?;
            Ok(())
        })
        .await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        with_timeout(async {
            let _: String = redis::cmd("PING")
                .query_async(&mut conn)
                .await
                .map_err(map_redis_err)?;
            Ok(())
        })
        .await
    }
}
