use std::time::Duration;

use async_trait::async_trait;

use crate::error::LockError;

/// One atomic attempt to take every key of a lock for a token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquireRequest {
    /// Keys that must all be free.
    pub keys: Vec<String>,
    /// Value stored under every key; proves ownership on release.
    pub token: String,
    /// Expiry applied to every key.
    pub ttl: Duration,
    /// When set, the attempt goes through the per-key FIFO waiter queues and
    /// this is how long the waiter stays queued without polling again.
    pub fair_waiter_ttl: Option<Duration>,
}

impl AcquireRequest {
    pub fn new(keys: Vec<String>, token: impl Into<String>, ttl: Duration) -> Self {
        Self {
            keys,
            token: token.into(),
            ttl,
            fair_waiter_ttl: None,
        }
    }

    pub fn fair(mut self, waiter_ttl: Duration) -> Self {
        self.fair_waiter_ttl = Some(waiter_ttl);
        self
    }
}

/// Key-value store capability used by the lock primitives.
///
/// Every method must be a single atomic operation at the store. In
/// particular [`compare_and_delete`](LockStore::compare_and_delete) must not
/// be a get followed by a delete: the key could expire and be taken by
/// another holder in between.
///
/// Safety assumes a single-primary store. A failover that loses a freshly
/// written key can let two holders own the same lock.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Short name of the backend, for logs.
    fn store_type(&self) -> &'static str;

    /// Set `key = value` with expiry `ttl` only if `key` is absent.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration)
        -> Result<bool, LockError>;

    /// Delete `key` only if it currently holds `expected`.
    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, LockError>;

    /// Read the current value of `key`.
    async fn get(&self, key: &str) -> Result<Option<String>, LockError>;

    /// Take every key of the request at once, or none of them.
    async fn acquire_all(&self, request: &AcquireRequest) -> Result<bool, LockError>;

    /// Delete every key still holding `token`; returns how many were deleted.
    async fn release_all(&self, keys: &[String], token: &str) -> Result<usize, LockError>;

    /// Reset the expiry of every key still holding `token`.
    ///
    /// Returns `true` only if all keys were renewed.
    async fn renew_all(&self, keys: &[String], token: &str, ttl: Duration)
        -> Result<bool, LockError>;

    /// Withdraw `token` from the fair waiter queues of `keys`.
    async fn leave_queue(&self, keys: &[String], token: &str) -> Result<(), LockError>;
}

/// Reject expiries that would create a lock eligible for removal right away.
pub(crate) fn ensure_ttl(ttl: Duration) -> Result<(), LockError> {
    if ttl.is_zero() {
        return Err(LockError::InvalidArgument(
            "lock ttl must be greater than zero".to_string(),
        ));
    }
    Ok(())
}

/// Millisecond value for store commands; sub-millisecond expiries round up.
pub fn ttl_millis(ttl: Duration) -> u64 {
    let millis = ttl.as_millis();
    let rounded = if ttl.subsec_nanos() % 1_000_000 != 0 {
        millis + 1
    } else {
        millis
    };
    u64::try_from(rounded).unwrap_or(u64::MAX)
}
