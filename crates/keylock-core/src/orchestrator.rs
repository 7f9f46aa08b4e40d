use tracing::{debug, info};

use crate::error::LockError;
use crate::policy::{LockPolicy, Wait};
use crate::provider::{DistributedLock, LockProvider};

/// A lock acquired by [`LockOrchestrator::acquire`].
///
/// Give it back through [`LockOrchestrator::release`]. A handle dropped
/// without release is cleaned up the way its provider's lock is dropped.
pub struct LockHandle<L: DistributedLock> {
    lock: L,
}

impl<L: DistributedLock> LockHandle<L> {
    pub fn keys(&self) -> &[String] {
        self.lock.keys()
    }

    pub fn is_fair(&self) -> bool {
        self.lock.is_fair()
    }

    pub fn is_held(&self) -> bool {
        self.lock.is_held()
    }

    /// Release the underlying lock.
    pub async fn release(mut self) -> Result<(), LockError> {
        self.lock.unlock().await
    }
}

/// Turns a [`LockPolicy`] into a held lock through a [`LockProvider`].
///
/// One key maps to a single lock; several keys map to the provider's
/// combined lock, held only when every key is held.
pub struct LockOrchestrator<P: LockProvider> {
    provider: P,
}

impl<P: LockProvider> LockOrchestrator<P> {
    pub fn new(provider: P) -> Self {
        Self { provider }
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// Acquire the lock described by `policy`.
    ///
    /// [`Wait::Forever`] blocks until the lock is held. A bounded wait that
    /// runs out fails with [`LockError::AcquisitionTimeout`].
    pub async fn acquire(&self, policy: &LockPolicy) -> Result<LockHandle<P::Lock>, LockError> {
        let mut locks: Vec<P::Lock> = policy
            .keys()
            .iter()
            .map(|key| {
                if policy.is_fair() {
                    self.provider.get_fair_lock(key)
                } else {
                    self.provider.get_lock(key)
                }
            })
            .collect();
        let mut lock = if locks.len() == 1 {
            locks.remove(0)
        } else {
            self.provider.combine(locks)?
        };

        let keys = policy.keys().join(",");
        match policy.wait() {
            Wait::Forever => {
                debug!("Waiting for lock {} without bound", keys);
                lock.lock(policy.lease()).await?;
            }
            Wait::Bounded(wait) => {
                if !lock.try_lock(wait, policy.lease()).await? {
                    info!("try lock failed: {}", keys);
                    return Err(LockError::AcquisitionTimeout(keys));
                }
            }
        }

        info!("try lock succeed: {}", keys);
        Ok(LockHandle { lock })
    }

    /// Release a lock acquired by [`acquire`](Self::acquire).
    pub async fn release(&self, handle: LockHandle<P::Lock>) -> Result<(), LockError> {
        let keys = handle.keys().join(",");
        handle.release().await?;
        debug!("Released lock {}", keys);
        Ok(())
    }
}
