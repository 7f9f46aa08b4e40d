//! Lock provider capability and the built-in store-backed provider.
//!
//! A [`LockProvider`] hands out [`DistributedLock`]s for single keys, in a
//! regular or fair flavour, and combines several of them into one lock that
//! is held only when every key is held. [`StoreLockProvider`] implements the
//! capability on top of any [`LockStore`]:
//!
//! - every acquisition attempt is one atomic store call over all keys, so a
//!   multi-key lock is never partially held;
//! - a [`Lease::Watchdog`] lease is stored with a short expiry that a
//!   background task keeps renewing until unlock, so a crashed owner loses
//!   the lock after at most one watchdog timeout;
//! - fair locks queue their waiters per key and are granted in arrival order.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::LockError;
use crate::policy::Lease;
use crate::store::{ensure_ttl, AcquireRequest, LockStore};

/// A lock over one key, or over a set of keys held together.
#[async_trait]
pub trait DistributedLock: Send {
    /// Keys covered by this lock.
    fn keys(&self) -> &[String];

    fn is_fair(&self) -> bool;

    /// Whether this handle believes it holds the lock. A fixed lease may have
    /// expired at the store in the meantime.
    fn is_held(&self) -> bool;

    /// Block until the lock is held.
    ///
    /// Contention and store errors are retried indefinitely; dropping the
    /// future is the only way to stop waiting. Errors are limited to misuse
    /// (already held, zero lease).
    async fn lock(&mut self, lease: Lease) -> Result<(), LockError>;

    /// Try to take the lock for at most `wait`. A zero `wait` makes exactly
    /// one attempt.
    async fn try_lock(&mut self, wait: Duration, lease: Lease) -> Result<bool, LockError>;

    /// Release the lock. Fails with [`LockError::Release`] when the lock is
    /// not held or the store no longer records this handle as owner.
    async fn unlock(&mut self) -> Result<(), LockError>;
}

/// Source of distributed locks.
pub trait LockProvider: Send + Sync {
    type Lock: DistributedLock + 'static;

    fn get_lock(&self, key: &str) -> Self::Lock;

    fn get_fair_lock(&self, key: &str) -> Self::Lock;

    /// Combine unheld locks of the same fairness into one AND-conjunction.
    fn combine(&self, locks: Vec<Self::Lock>) -> Result<Self::Lock, LockError>;
}

/// Tuning for [`StoreLockProvider`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Pause between acquisition attempts while waiting.
    pub retry_interval_ms: u64,
    /// Store expiry of watchdog leases; renewed every third of it.
    pub watchdog_timeout_ms: u64,
    /// How long a fair waiter keeps its place without polling.
    pub fair_waiter_timeout_ms: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            retry_interval_ms: 100,
            watchdog_timeout_ms: 30_000,
            fair_waiter_timeout_ms: 5_000,
        }
    }
}

impl ProviderConfig {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms.max(1))
    }

    pub fn watchdog_timeout(&self) -> Duration {
        Duration::from_millis(self.watchdog_timeout_ms.max(3))
    }

    pub fn fair_waiter_timeout(&self) -> Duration {
        Duration::from_millis(self.fair_waiter_timeout_ms.max(1))
    }
}

/// [`LockProvider`] backed by a [`LockStore`].
pub struct StoreLockProvider<S: LockStore + ?Sized + 'static> {
    store: Arc<S>,
    config: ProviderConfig,
}

impl<S: LockStore + ?Sized + 'static> Clone for StoreLockProvider<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            config: self.config.clone(),
        }
    }
}

impl<S: LockStore + ?Sized + 'static> StoreLockProvider<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self::with_config(store, ProviderConfig::default())
    }

    pub fn with_config(store: Arc<S>, config: ProviderConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    fn make_lock(&self, keys: Vec<String>, fair: bool) -> StoreLock<S> {
        StoreLock {
            store: Arc::clone(&self.store),
            config: self.config.clone(),
            keys,
            fair,
            held: None,
        }
    }
}

impl<S: LockStore + ?Sized + 'static> LockProvider for StoreLockProvider<S> {
    type Lock = StoreLock<S>;

    fn get_lock(&self, key: &str) -> StoreLock<S> {
        self.make_lock(vec![key.to_string()], false)
    }

    fn get_fair_lock(&self, key: &str) -> StoreLock<S> {
        self.make_lock(vec![key.to_string()], true)
    }

    fn combine(&self, locks: Vec<StoreLock<S>>) -> Result<StoreLock<S>, LockError> {
        let fair = match locks.first() {
            Some(first) => first.fair,
            None => {
                return Err(LockError::InvalidArgument(
                    "cannot combine an empty set of locks".to_string(),
                ))
            }
        };
        if locks.iter().any(|lock| lock.fair != fair) {
            return Err(LockError::InvalidArgument(
                "cannot combine fair and regular locks".to_string(),
            ));
        }
        if locks.iter().any(|lock| lock.held.is_some()) {
            return Err(LockError::InvalidArgument(
                "cannot combine locks that are already held".to_string(),
            ));
        }

        let mut keys: Vec<String> = Vec::new();
        for mut lock in locks {
            for key in std::mem::take(&mut lock.keys) {
                if !keys.contains(&key) {
                    keys.push(key);
                }
            }
        }
        Ok(self.make_lock(keys, fair))
    }
}

struct Held {
    token: String,
    watchdog: Option<JoinHandle<()>>,
}

/// Lock handed out by [`StoreLockProvider`].
///
/// Dropping a held lock stops its watchdog and schedules the release on the
/// current tokio runtime.
pub struct StoreLock<S: LockStore + ?Sized + 'static> {
    store: Arc<S>,
    config: ProviderConfig,
    keys: Vec<String>,
    fair: bool,
    held: Option<Held>,
}

impl<S: LockStore + ?Sized + 'static> StoreLock<S> {
    /// Token this handle currently holds the lock with.
    pub fn token(&self) -> Option<&str> {
        self.held.as_ref().map(|held| held.token.as_str())
    }

    fn request(&self, token: &str, ttl: Duration) -> AcquireRequest {
        let request = AcquireRequest::new(self.keys.clone(), token, ttl);
        if self.fair {
            request.fair(self.config.fair_waiter_timeout())
        } else {
            request
        }
    }

    /// Poll the store until acquired or `deadline` passes.
    ///
    /// With `retry_errors` store errors are logged and retried; otherwise
    /// they end the attempt. A `deadline` of `None` never passes.
    async fn acquire(
        &mut self,
        deadline: Option<Instant>,
        retry_errors: bool,
        lease: Lease,
    ) -> Result<bool, LockError> {
        if self.held.is_some() {
            return Err(LockError::InvalidArgument(format!(
                "lock on {:?} is already held",
                self.keys
            )));
        }
        let ttl = match lease {
            Lease::Fixed(ttl) => {
                ensure_ttl(ttl)?;
                ttl
            }
            Lease::Watchdog => self.config.watchdog_timeout(),
        };

        let token = uuid::Uuid::new_v4().to_string();
        let request = self.request(&token, ttl);
        let mut attempt = Attempt::new(
            Arc::clone(&self.store),
            self.keys.clone(),
            token.clone(),
            self.fair,
        );
        let interval = self.config.retry_interval();

        loop {
            match self.store.acquire_all(&request).await {
                Ok(true) => {
                    attempt.disarm();
                    self.hold(token, lease);
                    return Ok(true);
                }
                Ok(false) => {}
                Err(e) if retry_errors => {
                    attempt.mark_uncertain();
                    warn!("Attempt to lock {:?} failed, retrying: {}", self.keys, e);
                }
                Err(e) => {
                    attempt.mark_uncertain();
                    attempt.abandon().await;
                    return Err(e);
                }
            }

            let pause = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    interval.min(deadline - now)
                }
                None => interval,
            };
            tokio::time::sleep(pause).await;
        }

        attempt.abandon().await;
        debug!("Gave up waiting for {:?}", self.keys);
        Ok(false)
    }

    fn hold(&mut self, token: String, lease: Lease) {
        let watchdog = match lease {
            Lease::Watchdog => Some(spawn_watchdog(
                Arc::clone(&self.store),
                self.keys.clone(),
                token.clone(),
                self.config.watchdog_timeout(),
            )),
            Lease::Fixed(_) => None,
        };
        debug!("Holding {:?} ({:?})", self.keys, lease);
        self.held = Some(Held { token, watchdog });
    }
}

#[async_trait]
impl<S: LockStore + ?Sized + 'static> DistributedLock for StoreLock<S> {
    fn keys(&self) -> &[String] {
        &self.keys
    }

    fn is_fair(&self) -> bool {
        self.fair
    }

    fn is_held(&self) -> bool {
        self.held.is_some()
    }

    async fn lock(&mut self, lease: Lease) -> Result<(), LockError> {
        self.acquire(None, true, lease).await.map(|_| ())
    }

    async fn try_lock(&mut self, wait: Duration, lease: Lease) -> Result<bool, LockError> {
        // A wait past the clock's range never ends.
        let deadline = Instant::now().checked_add(wait);
        self.acquire(deadline, false, lease).await
    }

    async fn unlock(&mut self) -> Result<(), LockError> {
        let held = self.held.take().ok_or_else(|| {
            LockError::Release(format!("lock on {:?} is not held", self.keys))
        })?;
        if let Some(watchdog) = held.watchdog {
            watchdog.abort();
        }

        let released = self
            .store
            .release_all(&self.keys, &held.token)
            .await
            .map_err(|e| LockError::Release(format!("unlock of {:?} failed: {}", self.keys, e)))?;

        if released < self.keys.len() {
            return Err(LockError::Release(format!(
                "only {} of {} keys in {:?} were still owned (lease expired?)",
                released,
                self.keys.len(),
                self.keys
            )));
        }
        debug!("Unlocked {:?}", self.keys);
        Ok(())
    }
}

impl<S: LockStore + ?Sized + 'static> Drop for StoreLock<S> {
    fn drop(&mut self) {
        let Some(held) = self.held.take() else {
            return;
        };
        if let Some(watchdog) = held.watchdog {
            watchdog.abort();
        }

        let store = Arc::clone(&self.store);
        let keys = std::mem::take(&mut self.keys);
        let token = held.token;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    match store.release_all(&keys, &token).await {
                        Ok(n) => debug!("Released {} of {:?} on drop", n, keys),
                        Err(e) => warn!("Failed to release {:?} on drop: {}", keys, e),
                    }
                });
            }
            Err(_) => warn!(
                "Lock on {:?} dropped outside a runtime; it will expire on its own",
                keys
            ),
        }
    }
}

fn spawn_watchdog<S: LockStore + ?Sized + 'static>(
    store: Arc<S>,
    keys: Vec<String>,
    token: String,
    timeout: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = timeout / 3;
        loop {
            tokio::time::sleep(period).await;
            match store.renew_all(&keys, &token, timeout).await {
                Ok(true) => debug!("Renewed {:?} for {:?}", keys, timeout),
                Ok(false) => {
                    warn!("Lost ownership of {:?}, stopping watchdog", keys);
                    break;
                }
                Err(e) => warn!("Failed to renew {:?}: {}", keys, e),
            }
        }
    })
}

/// One acquisition in flight; cleaned up unless disarmed.
///
/// Fair attempts hold a place in the store queues. Once a store call has been
/// sent the keys may already be written under the attempt's token, even if
/// the reply never arrived or the caller stopped waiting for it.
struct Attempt<S: LockStore + ?Sized + 'static> {
    store: Arc<S>,
    keys: Vec<String>,
    token: String,
    fair: bool,
    uncertain: bool,
    armed: bool,
}

impl<S: LockStore + ?Sized + 'static> Attempt<S> {
    fn new(store: Arc<S>, keys: Vec<String>, token: String, fair: bool) -> Self {
        Self {
            store,
            keys,
            token,
            fair,
            uncertain: false,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }

    /// Record that a store call failed without a clear answer.
    fn mark_uncertain(&mut self) {
        self.uncertain = true;
    }

    async fn abandon(mut self) {
        self.armed = false;
        cleanup(
            Arc::clone(&self.store),
            std::mem::take(&mut self.keys),
            std::mem::take(&mut self.token),
            self.fair,
            self.uncertain,
        )
        .await;
    }
}

impl<S: LockStore + ?Sized + 'static> Drop for Attempt<S> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let store = Arc::clone(&self.store);
        let keys = std::mem::take(&mut self.keys);
        let token = std::mem::take(&mut self.token);
        let fair = self.fair;
        match tokio::runtime::Handle::try_current() {
            // Dropped mid-call: the last store call may have committed.
            Ok(handle) => {
                handle.spawn(cleanup(store, keys, token, fair, true));
            }
            Err(_) => warn!(
                "Attempt on {:?} dropped outside a runtime; leftovers will expire on their own",
                keys
            ),
        }
    }
}

async fn cleanup<S: LockStore + ?Sized + 'static>(
    store: Arc<S>,
    keys: Vec<String>,
    token: String,
    fair: bool,
    release: bool,
) {
    if release {
        match store.release_all(&keys, &token).await {
            Ok(0) => {}
            Ok(n) => debug!("Released {} keys of abandoned attempt on {:?}", n, keys),
            Err(e) => warn!("Failed to release abandoned attempt on {:?}: {}", keys, e),
        }
    }
    if fair {
        if let Err(e) = store.leave_queue(&keys, &token).await {
            warn!("Failed to leave wait queue of {:?}: {}", keys, e);
        }
    }
}
