use std::time::Duration;

use async_trait::async_trait;
use keylock_core::{ttl_millis, AcquireRequest, LockError, LockStore};
use redis::aio::ConnectionManager;
use redis::{Client, RedisError, Script};
use tracing::{debug, info, instrument};

use crate::scripts::{
    queue_key, timeout_key, ACQUIRE_ALL, ACQUIRE_ALL_FAIR, LEAVE_QUEUE, RELEASE_ALL,
    RELEASE_LOCK, RENEW_ALL,
};

fn transport(e: RedisError) -> LockError {
    LockError::StoreTransport(e.to_string())
}

/// Lock store on a single Redis primary.
///
/// Single-key acquire is `SET key token NX PX ttl`; everything that touches
/// several keys or checks ownership runs as one Lua script.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    release: Script,
    acquire_all: Script,
    acquire_all_fair: Script,
    release_all: Script,
    renew_all: Script,
    leave_queue: Script,
}

impl RedisStore {
    /// Connect to `url` and check the server answers.
    pub async fn connect(url: &str) -> Result<Self, LockError> {
        let client = Client::open(url).map_err(|e| {
            LockError::StoreTransport(format!("Invalid redis url '{}': {}", url, e))
        })?;
        let conn = ConnectionManager::new(client).await.map_err(|e| {
            LockError::StoreTransport(format!("Failed to connect to redis at {}: {}", url, e))
        })?;

        let store = Self::new(conn);
        store.ping().await?;
        info!("Connected to redis at {}", url);
        Ok(store)
    }

    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            release: Script::new(RELEASE_LOCK),
            acquire_all: Script::new(ACQUIRE_ALL),
            acquire_all_fair: Script::new(ACQUIRE_ALL_FAIR),
            release_all: Script::new(RELEASE_ALL),
            renew_all: Script::new(RENEW_ALL),
            leave_queue: Script::new(LEAVE_QUEUE),
        }
    }

    pub async fn ping(&self) -> Result<(), LockError> {
        let mut conn = self.conn.clone();
        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(transport)?;
        if pong != "PONG" {
            return Err(LockError::StoreTransport(format!(
                "Unexpected PING reply: {}",
                pong
            )));
        }
        Ok(())
    }
}

fn ensure_keys(keys: &[String]) -> Result<(), LockError> {
    if keys.is_empty() {
        return Err(LockError::InvalidArgument(
            "at least one key is required".to_string(),
        ));
    }
    Ok(())
}

fn ensure_ttl(ttl: Duration) -> Result<u64, LockError> {
    match ttl_millis(ttl) {
        0 => Err(LockError::InvalidArgument(
            "lock ttl must be greater than zero".to_string(),
        )),
        millis => Ok(millis),
    }
}

#[async_trait]
impl LockStore for RedisStore {
    fn store_type(&self) -> &'static str {
        "redis"
    }

    #[instrument(skip(self, value), level = "debug")]
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, LockError> {
        let ttl_ms = ensure_ttl(ttl)?;
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await
            .map_err(transport)?;
        let acquired = reply.is_some();
        debug!("SET NX {} => {}", key, acquired);
        Ok(acquired)
    }

    #[instrument(skip(self, expected), level = "debug")]
    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, LockError> {
        let mut conn = self.conn.clone();
        let deleted: i64 = self
            .release
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await
            .map_err(transport)?;
        debug!("Release {} => {}", key, deleted);
        Ok(deleted == 1)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, LockError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(transport)?;
        Ok(value)
    }

    #[instrument(skip(self, request), level = "debug", fields(keys = ?request.keys))]
    async fn acquire_all(&self, request: &AcquireRequest) -> Result<bool, LockError> {
        ensure_keys(&request.keys)?;
        let ttl_ms = ensure_ttl(request.ttl)?;
        let mut conn = self.conn.clone();

        let acquired: i64 = match request.fair_waiter_ttl {
            Some(window) => {
                let mut invocation = self.acquire_all_fair.prepare_invoke();
                for key in &request.keys {
                    invocation.key(key);
                }
                for key in &request.keys {
                    invocation.key(queue_key(key));
                }
                for key in &request.keys {
                    invocation.key(timeout_key(key));
                }
                invocation
                    .arg(&request.token)
                    .arg(ttl_ms)
                    .arg(ttl_millis(window).max(1));
                invocation.invoke_async(&mut conn).await.map_err(transport)?
            }
            None => {
                let mut invocation = self.acquire_all.prepare_invoke();
                for key in &request.keys {
                    invocation.key(key);
                }
                invocation.arg(&request.token).arg(ttl_ms);
                invocation.invoke_async(&mut conn).await.map_err(transport)?
            }
        };
        debug!("Acquire {:?} => {}", request.keys, acquired);
        Ok(acquired == 1)
    }

    #[instrument(skip(self, token), level = "debug")]
    async fn release_all(&self, keys: &[String], token: &str) -> Result<usize, LockError> {
        ensure_keys(keys)?;
        let mut conn = self.conn.clone();
        let mut invocation = self.release_all.prepare_invoke();
        for key in keys {
            invocation.key(key);
        }
        invocation.arg(token);
        let released: usize = invocation.invoke_async(&mut conn).await.map_err(transport)?;
        debug!("Released {} of {} keys", released, keys.len());
        Ok(released)
    }

    #[instrument(skip(self, token), level = "debug")]
    async fn renew_all(&self, keys: &[String], token: &str, ttl: Duration) -> Result<bool, LockError> {
        ensure_keys(keys)?;
        let ttl_ms = ensure_ttl(ttl)?;
        let mut conn = self.conn.clone();
        let mut invocation = self.renew_all.prepare_invoke();
        for key in keys {
            invocation.key(key);
        }
        invocation.arg(token).arg(ttl_ms);
        let renewed: usize = invocation.invoke_async(&mut conn).await.map_err(transport)?;
        Ok(renewed == keys.len())
    }

    #[instrument(skip(self, token), level = "debug")]
    async fn leave_queue(&self, keys: &[String], token: &str) -> Result<(), LockError> {
        ensure_keys(keys)?;
        let mut conn = self.conn.clone();
        let mut invocation = self.leave_queue.prepare_invoke();
        for key in keys {
            invocation.key(queue_key(key));
        }
        for key in keys {
            invocation.key(timeout_key(key));
        }
        invocation.arg(token);
        let _: i64 = invocation.invoke_async(&mut conn).await.map_err(transport)?;
        Ok(())
    }
}
