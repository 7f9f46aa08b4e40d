use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use crate::error::LockError;
use crate::store::{ensure_ttl, LockStore};

/// Expiry used by [`SingleNodeLock::acquire_default`].
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(3);

/// Pause between attempts of [`SingleNodeLock::acquire_blocking`].
pub const DEFAULT_RETRY_PAUSE: Duration = Duration::from_millis(10);

/// Token-based lock directly on a single-primary key-value store.
///
/// Acquire is SET-if-absent with expiry; release deletes the key only when
/// it still holds the caller's token. Against a replicated store with
/// failover, a lost write can let two callers hold the same key.
pub struct SingleNodeLock<S: LockStore + ?Sized> {
    store: Arc<S>,
    retry_pause: Duration,
}

impl<S: LockStore + ?Sized> Clone for SingleNodeLock<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            retry_pause: self.retry_pause,
        }
    }
}

impl<S: LockStore + ?Sized> SingleNodeLock<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            retry_pause: DEFAULT_RETRY_PAUSE,
        }
    }

    /// Set the pause between blocking attempts.
    pub fn with_retry_pause(mut self, retry_pause: Duration) -> Self {
        self.retry_pause = retry_pause;
        self
    }

    /// Mint a fresh ownership token.
    pub fn new_token() -> String {
        uuid::Uuid::new_v4().to_string()
    }

    /// Try once to take `key` for `token`. Non-blocking.
    #[instrument(skip(self, token), level = "debug")]
    pub async fn acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, LockError> {
        ensure_ttl(ttl)?;
        let acquired = self.store.set_if_absent(key, token, ttl).await?;
        debug!("acquire {} => {}", key, acquired);
        Ok(acquired)
    }

    /// [`acquire`](Self::acquire) with [`DEFAULT_LOCK_TTL`].
    pub async fn acquire_default(&self, key: &str, token: &str) -> Result<bool, LockError> {
        self.acquire(key, token, DEFAULT_LOCK_TTL).await
    }

    /// Retry [`acquire`](Self::acquire) until it succeeds or `retry_budget`
    /// has elapsed since the first attempt.
    ///
    /// Store errors of individual attempts are logged and count as failed
    /// attempts. The only error returned is an invalid `ttl`.
    #[instrument(skip(self, token), level = "debug")]
    pub async fn acquire_blocking(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
        retry_budget: Duration,
    ) -> Result<bool, LockError> {
        ensure_ttl(ttl)?;
        let start = Instant::now();
        // A budget past the clock's range is unbounded.
        let deadline = start.checked_add(retry_budget);

        loop {
            match self.store.set_if_absent(key, token, ttl).await {
                Ok(true) => {
                    debug!("acquire_blocking {} => true after {:?}", key, start.elapsed());
                    return Ok(true);
                }
                Ok(false) => {}
                Err(e) => warn!("Attempt to lock {} failed: {}", key, e),
            }

            let pause = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    self.retry_pause.min(deadline - now)
                }
                None => self.retry_pause,
            };
            tokio::time::sleep(pause).await;
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                break;
            }
        }

        debug!("acquire_blocking {} => false after {:?}", key, start.elapsed());
        Ok(false)
    }

    /// Delete `key` if it still holds `token`.
    #[instrument(skip(self, token), level = "debug")]
    pub async fn release(&self, key: &str, token: &str) -> Result<bool, LockError> {
        let released = self.store.compare_and_delete(key, token).await?;
        debug!("release {} => {}", key, released);
        Ok(released)
    }
}
