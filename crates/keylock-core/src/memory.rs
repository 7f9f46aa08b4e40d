use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, instrument};

use crate::error::LockError;
use crate::store::{ensure_ttl, AcquireRequest, LockStore};

#[derive(Debug)]
struct Entry {
    value: String,
    expires_at: Instant,
}

#[derive(Debug)]
struct Waiter {
    token: String,
    deadline: Instant,
}

/// Minimum time between full sweeps of expired keys and stale waiters.
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Stand-in expiry, about thirty years, when a ttl overflows the clock.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `now + ttl`, clamped for expiries past the clock's range.
fn expiry(now: Instant, ttl: Duration) -> Instant {
    now.checked_add(ttl)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

#[derive(Debug, Default)]
struct State {
    entries: HashMap<String, Entry>,
    queues: HashMap<String, VecDeque<Waiter>>,
    last_sweep: Option<Instant>,
}

impl State {
    /// Drop every expired key and stale waiter, at most once per
    /// [`SWEEP_INTERVAL`].
    fn sweep(&mut self, now: Instant) {
        if self
            .last_sweep
            .is_some_and(|last| now.saturating_duration_since(last) < SWEEP_INTERVAL)
        {
            return;
        }
        self.last_sweep = Some(now);

        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        self.queues.retain(|_, queue| {
            queue.retain(|waiter| waiter.deadline >= now);
            !queue.is_empty()
        });
        let swept = before - self.entries.len();
        if swept > 0 {
            debug!("Swept {} expired keys", swept);
        }
    }

    /// Current value of `key`, dropping it first if it has expired.
    fn live(&mut self, key: &str, now: Instant) -> Option<&Entry> {
        if self
            .entries
            .get(key)
            .is_some_and(|entry| entry.expires_at <= now)
        {
            self.entries.remove(key);
        }
        self.entries.get(key)
    }

    fn insert(&mut self, key: &str, value: &str, expires_at: Instant) {
        self.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at,
            },
        );
    }

    fn purge_stale_waiters(&mut self, key: &str, now: Instant) {
        if let Some(queue) = self.queues.get_mut(key) {
            while queue.front().is_some_and(|waiter| waiter.deadline < now) {
                queue.pop_front();
            }
            if queue.is_empty() {
                self.queues.remove(key);
            }
        }
    }

    fn queue_head(&self, key: &str) -> Option<&str> {
        self.queues
            .get(key)
            .and_then(|queue| queue.front())
            .map(|waiter| waiter.token.as_str())
    }

    fn remove_waiter(&mut self, key: &str, token: &str) {
        if let Some(queue) = self.queues.get_mut(key) {
            queue.retain(|waiter| waiter.token != token);
            if queue.is_empty() {
                self.queues.remove(key);
            }
        }
    }

    fn enqueue(&mut self, key: &str, token: &str, deadline: Instant) {
        let queue = self.queues.entry(key.to_string()).or_default();
        match queue.iter_mut().find(|waiter| waiter.token == token) {
            Some(waiter) => waiter.deadline = deadline,
            None => queue.push_back(Waiter {
                token: token.to_string(),
                deadline,
            }),
        }
    }
}

/// In-process lock store.
///
/// Every operation runs under one mutex, which makes multi-key operations
/// atomic the same way a server-side script does. Expiry follows
/// `tokio::time`, so a paused test clock drives it.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, State>, LockError> {
        self.state
            .lock()
            .map_err(|_| LockError::StoreTransport("memory store mutex poisoned".to_string()))
    }

    /// Number of waiters queued on `key`, for inspection.
    pub fn queued(&self, key: &str) -> Result<usize, LockError> {
        let now = Instant::now();
        let mut state = self.state()?;
        state.purge_stale_waiters(key, now);
        Ok(state.queues.get(key).map_or(0, VecDeque::len))
    }
}

#[async_trait]
impl LockStore for MemoryStore {
    fn store_type(&self) -> &'static str {
        "memory"
    }

    #[instrument(skip(self, value), level = "debug")]
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, LockError> {
        ensure_ttl(ttl)?;
        let now = Instant::now();
        let mut state = self.state()?;
        state.sweep(now);
        if state.live(key, now).is_some() {
            debug!("Key {} already set", key);
            return Ok(false);
        }
        state.insert(key, value, expiry(now, ttl));
        debug!("Set {} (ttl {:?})", key, ttl);
        Ok(true)
    }

    #[instrument(skip(self, expected), level = "debug")]
    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, LockError> {
        let now = Instant::now();
        let mut state = self.state()?;
        let owned = state.live(key, now).map(|entry| entry.value == expected);
        match owned {
            Some(true) => {
                state.entries.remove(key);
                debug!("Deleted {}", key);
                Ok(true)
            }
            Some(false) => {
                debug!("Key {} holds another value (no-op)", key);
                Ok(false)
            }
            None => {
                debug!("Key {} not found", key);
                Ok(false)
            }
        }
    }

    async fn get(&self, key: &str) -> Result<Option<String>, LockError> {
        let now = Instant::now();
        let mut state = self.state()?;
        Ok(state.live(key, now).map(|entry| entry.value.clone()))
    }

    #[instrument(skip(self, request), level = "debug", fields(keys = ?request.keys))]
    async fn acquire_all(&self, request: &AcquireRequest) -> Result<bool, LockError> {
        ensure_ttl(request.ttl)?;
        let now = Instant::now();
        let token = request.token.as_str();
        let mut state = self.state()?;
        state.sweep(now);

        if request.fair_waiter_ttl.is_some() {
            for key in &request.keys {
                state.purge_stale_waiters(key, now);
            }
        }

        let mut ready = true;
        for key in &request.keys {
            if state.live(key, now).is_some() {
                ready = false;
                break;
            }
            if request.fair_waiter_ttl.is_some()
                && state.queue_head(key).is_some_and(|head| head != token)
            {
                ready = false;
                break;
            }
        }

        if ready {
            for key in &request.keys {
                state.insert(key, token, expiry(now, request.ttl));
                state.remove_waiter(key, token);
            }
            debug!("Acquired {:?}", request.keys);
            return Ok(true);
        }

        if let Some(window) = request.fair_waiter_ttl {
            for key in &request.keys {
                state.enqueue(key, token, expiry(now, window));
            }
            debug!("Queued as waiter on {:?}", request.keys);
        }
        Ok(false)
    }

    #[instrument(skip(self, token), level = "debug")]
    async fn release_all(&self, keys: &[String], token: &str) -> Result<usize, LockError> {
        let now = Instant::now();
        let mut state = self.state()?;
        let mut released = 0;
        for key in keys {
            if state.live(key, now).is_some_and(|entry| entry.value == token) {
                state.entries.remove(key);
                released += 1;
            }
        }
        debug!("Released {} of {} keys", released, keys.len());
        Ok(released)
    }

    #[instrument(skip(self, token), level = "debug")]
    async fn renew_all(
        &self,
        keys: &[String],
        token: &str,
        ttl: Duration,
    ) -> Result<bool, LockError> {
        ensure_ttl(ttl)?;
        let now = Instant::now();
        let mut state = self.state()?;
        let mut renewed = 0;
        for key in keys {
            if state.live(key, now).is_some_and(|entry| entry.value == token) {
                if let Some(entry) = state.entries.get_mut(key) {
                    entry.expires_at = expiry(now, ttl);
                    renewed += 1;
                }
            }
        }
        Ok(renewed == keys.len())
    }

    async fn leave_queue(&self, keys: &[String], token: &str) -> Result<(), LockError> {
        let mut state = self.state()?;
        for key in keys {
            state.remove_waiter(key, token);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::sync::Barrier;

    fn keys(names: &[&str]) -> Vec<String> {
        names.iter().map(|k| k.to_string()).collect()
    }

    #[tokio::test]
    async fn test_set_if_absent_and_compare_and_delete() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(60);

        assert!(store.set_if_absent("k", "t1", ttl).await.unwrap());
        assert!(!store.set_if_absent("k", "t2", ttl).await.unwrap());

        assert!(!store.compare_and_delete("k", "t2").await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), Some("t1".to_string()));

        assert!(store.compare_and_delete("k", "t1").await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(store.set_if_absent("k", "t2", ttl).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry() {
        let store = MemoryStore::new();
        assert!(store
            .set_if_absent("k", "t1", Duration::from_millis(100))
            .await
            .unwrap());

        tokio::time::advance(Duration::from_millis(99)).await;
        assert!(!store
            .set_if_absent("k", "t2", Duration::from_millis(100))
            .await
            .unwrap());

        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(store
            .set_if_absent("k", "t2", Duration::from_millis(100))
            .await
            .unwrap());
        assert!(!store.compare_and_delete("k", "t1").await.unwrap());
    }

    #[tokio::test]
    async fn test_zero_ttl_fails_fast() {
        let store = MemoryStore::new();
        let err = store.set_if_absent("k", "t", Duration::ZERO).await.unwrap_err();
        assert!(matches!(err, LockError::InvalidArgument(_)));
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_acquire_all_is_all_or_nothing() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(60);
        assert!(store.set_if_absent("b", "other", ttl).await.unwrap());

        let request = AcquireRequest::new(keys(&["a", "b"]), "t1", ttl);
        assert!(!store.acquire_all(&request).await.unwrap());
        assert_eq!(store.get("a").await.unwrap(), None);

        assert!(store.compare_and_delete("b", "other").await.unwrap());
        assert!(store.acquire_all(&request).await.unwrap());
        assert_eq!(store.release_all(&request.keys, "t1").await.unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_renew_all_extends_only_owned_keys() {
        let store = MemoryStore::new();
        let ttl = Duration::from_millis(100);
        let request = AcquireRequest::new(keys(&["a", "b"]), "t1", ttl);
        assert!(store.acquire_all(&request).await.unwrap());

        tokio::time::advance(Duration::from_millis(80)).await;
        assert!(store.renew_all(&request.keys, "t1", ttl).await.unwrap());
        assert!(!store.renew_all(&request.keys, "t2", ttl).await.unwrap());

        tokio::time::advance(Duration::from_millis(80)).await;
        assert_eq!(store.get("a").await.unwrap(), Some("t1".to_string()));
    }

    #[tokio::test]
    async fn test_fair_waiters_are_served_in_order() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(60);
        let window = Duration::from_secs(5);
        let k = keys(&["k"]);

        let holder = AcquireRequest::new(k.clone(), "holder", ttl).fair(window);
        let first = AcquireRequest::new(k.clone(), "first", ttl).fair(window);
        let second = AcquireRequest::new(k.clone(), "second", ttl).fair(window);

        assert!(store.acquire_all(&holder).await.unwrap());
        assert!(!store.acquire_all(&first).await.unwrap());
        assert!(!store.acquire_all(&second).await.unwrap());
        assert_eq!(store.queued("k").unwrap(), 2);

        store.release_all(&k, "holder").await.unwrap();

        // second polls first but is not at the head
        assert!(!store.acquire_all(&second).await.unwrap());
        assert!(store.acquire_all(&first).await.unwrap());
        store.release_all(&k, "first").await.unwrap();
        assert!(store.acquire_all(&second).await.unwrap());
        assert_eq!(store.queued("k").unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_waiter_is_purged() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(60);
        let window = Duration::from_millis(200);
        let k = keys(&["k"]);

        assert!(store
            .acquire_all(&AcquireRequest::new(k.clone(), "holder", ttl).fair(window))
            .await
            .unwrap());
        assert!(!store
            .acquire_all(&AcquireRequest::new(k.clone(), "crashed", ttl).fair(window))
            .await
            .unwrap());
        store.release_all(&k, "holder").await.unwrap();

        let late = AcquireRequest::new(k.clone(), "late", ttl).fair(window);
        assert!(!store.acquire_all(&late).await.unwrap());

        tokio::time::advance(Duration::from_millis(201)).await;
        assert!(store.acquire_all(&late).await.unwrap());
    }

    #[tokio::test]
    async fn test_leave_queue() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(60);
        let window = Duration::from_secs(5);
        let k = keys(&["k"]);

        store
            .acquire_all(&AcquireRequest::new(k.clone(), "holder", ttl).fair(window))
            .await
            .unwrap();
        store
            .acquire_all(&AcquireRequest::new(k.clone(), "waiter", ttl).fair(window))
            .await
            .unwrap();
        assert_eq!(store.queued("k").unwrap(), 1);

        store.leave_queue(&k, "waiter").await.unwrap();
        assert_eq!(store.queued("k").unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_set_if_absent_has_one_winner() {
        let store = Arc::new(MemoryStore::new());
        let winners = Arc::new(AtomicUsize::new(0));

        const NUM_TASKS: usize = 16;
        let barrier = Arc::new(Barrier::new(NUM_TASKS));
        let mut handles = Vec::new();

        for i in 0..NUM_TASKS {
            let store = Arc::clone(&store);
            let winners = Arc::clone(&winners);
            let barrier = Arc::clone(&barrier);
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                let token = format!("token-{}", i);
                if store
                    .set_if_absent("fresh", &token, Duration::from_secs(30))
                    .await
                    .expect("set_if_absent failed")
                {
                    winners.fetch_add(1, Ordering::SeqCst);
                }
            }));
        }

        for handle in handles {
            handle.await.expect("task panicked");
        }
        assert_eq!(winners.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_huge_ttl_does_not_overflow() {
        let store = MemoryStore::new();
        assert!(store.set_if_absent("k", "t", Duration::MAX).await.unwrap());
        assert!(store
            .renew_all(&keys(&["k"]), "t", Duration::MAX)
            .await
            .unwrap());

        let request = AcquireRequest::new(keys(&["a", "b"]), "t", Duration::MAX)
            .fair(Duration::MAX);
        assert!(store.acquire_all(&request).await.unwrap());
        assert_eq!(store.get("a").await.unwrap(), Some("t".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_keys_are_swept_without_reuse() {
        let store = MemoryStore::new();
        for i in 0..50 {
            let key = format!("once:{}", i);
            assert!(store
                .set_if_absent(&key, "t", Duration::from_millis(10))
                .await
                .unwrap());
        }
        let holder = AcquireRequest::new(keys(&["busy"]), "holder", Duration::from_secs(60));
        assert!(store.acquire_all(&holder).await.unwrap());
        let waiter = AcquireRequest::new(keys(&["busy"]), "waiter", Duration::from_secs(60))
            .fair(Duration::from_millis(10));
        assert!(!store.acquire_all(&waiter).await.unwrap());

        tokio::time::sleep(SWEEP_INTERVAL * 2).await;
        assert!(store
            .set_if_absent("other", "t", Duration::from_secs(60))
            .await
            .unwrap());

        let state = store.state().unwrap();
        assert_eq!(state.entries.len(), 2);
        assert!(state.entries.contains_key("busy"));
        assert!(state.entries.contains_key("other"));
        assert!(state.queues.is_empty());
    }
}
