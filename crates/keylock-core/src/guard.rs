//! Run an operation while holding the locks named by its [`LockOptions`].

use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use tracing::warn;

use crate::binding::{InvocationMetadata, ParameterBinding};
use crate::error::LockError;
use crate::orchestrator::LockOrchestrator;
use crate::policy::LockOptions;
use crate::provider::LockProvider;
use crate::template::resolve_all;

/// Wraps guarded operations with lock acquisition and release.
pub struct Guard<P: LockProvider> {
    orchestrator: LockOrchestrator<P>,
}

impl<P: LockProvider> Guard<P> {
    pub fn new(provider: P) -> Self {
        Self {
            orchestrator: LockOrchestrator::new(provider),
        }
    }

    pub fn orchestrator(&self) -> &LockOrchestrator<P> {
        &self.orchestrator
    }

    /// Resolve keys from `invocation`, acquire, run `proceed`, release.
    ///
    /// `proceed` is not called when key resolution or acquisition fails.
    /// Once it has run, the lock is released whatever the outcome, panics
    /// included; a failed release is logged and the operation's result is
    /// returned unchanged.
    pub async fn around<I, F, Fut, T>(
        &self,
        invocation: &I,
        options: &LockOptions,
        proceed: F,
    ) -> Result<T, LockError>
    where
        I: InvocationMetadata,
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let (value, _released) = self.around_with_release(invocation, options, proceed).await?;
        Ok(value)
    }

    /// Like [`around`](Self::around), also returning the outcome of the
    /// release.
    pub async fn around_with_release<I, F, Fut, T>(
        &self,
        invocation: &I,
        options: &LockOptions,
        proceed: F,
    ) -> Result<(T, Result<(), LockError>), LockError>
    where
        I: InvocationMetadata,
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let binding = ParameterBinding::from_invocation(invocation)?;
        let keys = resolve_all(&options.keys, &binding)?;
        let policy = options.to_policy(keys)?;

        let handle = self.orchestrator.acquire(&policy).await?;
        let outcome = AssertUnwindSafe(async move { proceed().await })
            .catch_unwind()
            .await;

        let released = self.orchestrator.release(handle).await;
        if let Err(e) = &released {
            warn!("Failed to release lock {:?}: {}", policy.keys(), e);
        }

        match outcome {
            Ok(value) => Ok((value, released)),
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}
