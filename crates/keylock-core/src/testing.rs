//! Store wrappers for tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::LockError;
use crate::memory::MemoryStore;
use crate::store::{AcquireRequest, LockStore};

/// Store whose acquire calls fail at the transport level while
/// `failures_left` is positive.
#[derive(Default)]
pub struct FlakyStore {
    pub inner: MemoryStore,
    pub failures_left: AtomicUsize,
}

impl FlakyStore {
    pub fn failing(failures: usize) -> Self {
        Self {
            inner: MemoryStore::new(),
            failures_left: AtomicUsize::new(failures),
        }
    }

    pub fn fail_next(&self, failures: usize) {
        self.failures_left.store(failures, Ordering::SeqCst);
    }

    fn take_failure(&self) -> Result<(), LockError> {
        match self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        {
            Ok(_) => Err(LockError::StoreTransport("connection reset".into())),
            Err(_) => Ok(()),
        }
    }
}

#[async_trait]
impl LockStore for FlakyStore {
    fn store_type(&self) -> &'static str {
        "flaky"
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, LockError> {
        self.take_failure()?;
        self.inner.set_if_absent(key, value, ttl).await
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, LockError> {
        self.inner.compare_and_delete(key, expected).await
    }

    async fn get(&self, key: &str) -> Result<Option<String>, LockError> {
        self.inner.get(key).await
    }

    async fn acquire_all(&self, request: &AcquireRequest) -> Result<bool, LockError> {
        self.take_failure()?;
        self.inner.acquire_all(request).await
    }

    async fn release_all(&self, keys: &[String], token: &str) -> Result<usize, LockError> {
        self.inner.release_all(keys, token).await
    }

    async fn renew_all(&self, keys: &[String], token: &str, ttl: Duration) -> Result<bool, LockError> {
        self.inner.renew_all(keys, token, ttl).await
    }

    async fn leave_queue(&self, keys: &[String], token: &str) -> Result<(), LockError> {
        self.inner.leave_queue(keys, token).await
    }
}

/// Store that applies `acquire_all` and then takes `reply_delay` to answer,
/// like a server whose reply is still on the wire.
pub struct SlowReplyStore {
    pub inner: MemoryStore,
    pub reply_delay: Duration,
}

#[async_trait]
impl LockStore for SlowReplyStore {
    fn store_type(&self) -> &'static str {
        "slow-reply"
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, LockError> {
        self.inner.set_if_absent(key, value, ttl).await
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, LockError> {
        self.inner.compare_and_delete(key, expected).await
    }

    async fn get(&self, key: &str) -> Result<Option<String>, LockError> {
        self.inner.get(key).await
    }

    async fn acquire_all(&self, request: &AcquireRequest) -> Result<bool, LockError> {
        let acquired = self.inner.acquire_all(request).await;
        tokio::time::sleep(self.reply_delay).await;
        acquired
    }

    async fn release_all(&self, keys: &[String], token: &str) -> Result<usize, LockError> {
        self.inner.release_all(keys, token).await
    }

    async fn renew_all(&self, keys: &[String], token: &str, ttl: Duration) -> Result<bool, LockError> {
        self.inner.renew_all(keys, token, ttl).await
    }

    async fn leave_queue(&self, keys: &[String], token: &str) -> Result<(), LockError> {
        self.inner.leave_queue(keys, token).await
    }
}
