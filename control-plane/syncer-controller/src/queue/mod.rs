//! Deduplicating, rate-limited work queue keyed by reconcile key.
//!
//! A key lives in at most one of two places: pending (`queue` + `dirty`) or
//! processing. Adding a key that is processing only marks it dirty; `done`
//! moves it back to pending. This gives at most one active reconcile plus at
//! most one pending re-delivery per key.

mod backoff;

pub use backoff::ExponentialBackoff;

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

pub struct WorkQueue<K> {
    inner: Arc<Inner<K>>,
}

impl<K> Clone for WorkQueue<K> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct Inner<K> {
    state: Mutex<State<K>>,
    notify: Notify,
    backoff: ExponentialBackoff,
    shutdown: CancellationToken,
}

struct State<K> {
    queue: VecDeque<K>,
    dirty: HashSet<K>,
    processing: HashSet<K>,
    failures: HashMap<K, u32>,
    shutting_down: bool,
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
{
    pub fn new(backoff: ExponentialBackoff) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    failures: HashMap::new(),
                    shutting_down: false,
                }),
                notify: Notify::new(),
                backoff,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<K>> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Insert `key` unless it is already pending. Keys added while being
    /// processed are re-queued by [`WorkQueue::done`].
    pub fn add(&self, key: K) {
        {
            let mut st = self.lock();
            if st.shutting_down || st.dirty.contains(&key) {
                return;
            }
            st.dirty.insert(key.clone());
            if st.processing.contains(&key) {
                return;
            }
            st.queue.push_back(key);
        }
        self.inner.notify.notify_one();
    }

    /// Wait for the next key and mark it processing. Returns `None` once the
    /// queue is shut down.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut st = self.lock();
                if st.shutting_down {
                    return None;
                }
                if let Some(key) = st.queue.pop_front() {
                    st.dirty.remove(&key);
                    st.processing.insert(key.clone());
                    return Some(key);
                }
            }
            notified.await;
        }
    }

    /// Clear the processing mark; re-queue when the key was added meanwhile.
    pub fn done(&self, key: &K) {
        let requeued = {
            let mut st = self.lock();
            st.processing.remove(key);
            if !st.shutting_down && st.dirty.contains(key) {
                st.queue.push_back(key.clone());
                true
            } else {
                false
            }
        };
        if requeued {
            self.inner.notify.notify_one();
        }
    }

    /// Add `key` once `delay` has elapsed.
    pub fn add_after(&self, key: K, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let queue = self.clone();
        let shutdown = self.inner.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(delay) => queue.add(key),
            }
        });
    }

    /// Re-deliver `key` after a backoff derived from its failure count.
    pub fn add_rate_limited(&self, key: K) {
        let delay = {
            let mut st = self.lock();
            if st.shutting_down {
                return;
            }
            let failures = st.failures.entry(key.clone()).or_insert(0);
            *failures = failures.saturating_add(1);
            self.inner.backoff.delay(*failures)
        };
        self.add_after(key, delay);
    }

    /// Reset the failure counter of `key`.
    pub fn forget(&self, key: &K) {
        self.lock().failures.remove(key);
    }

    pub fn num_requeues(&self, key: &K) -> u32 {
        self.lock().failures.get(key).copied().unwrap_or(0)
    }

    /// Number of keys waiting to be picked up.
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn processing(&self) -> usize {
        self.lock().processing.len()
    }

    /// Stop accepting keys and release every blocked `get`. Pending keys are
    /// discarded; delayed adds are cancelled.
    pub fn shut_down(&self) {
        {
            let mut st = self.lock();
            st.shutting_down = true;
            st.queue.clear();
            st.dirty.clear();
        }
        self.inner.shutdown.cancel();
        self.inner.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> WorkQueue<String> {
        WorkQueue::new(ExponentialBackoff::new(
            Duration::from_millis(10),
            Duration::from_secs(1),
        ))
    }

    #[tokio::test]
    async fn collapses_duplicate_adds_while_pending() {
        let q = queue();
        for _ in 0..5 {
            q.add("a/foo".to_string());
        }
        q.add("a/bar".to_string());
        assert_eq!(q.len(), 2);
        assert_eq!(q.get().await.as_deref(), Some("a/foo"));
        assert_eq!(q.get().await.as_deref(), Some("a/bar"));
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn adds_during_processing_yield_one_redelivery() {
        let q = queue();
        q.add("a/foo".to_string());
        let key = q.get().await.unwrap();
        for _ in 0..10 {
            q.add(key.clone());
        }
        // not visible to other workers while processing
        assert_eq!(q.len(), 0);
        q.done(&key);
        assert_eq!(q.len(), 1);
        let again = q.get().await.unwrap();
        assert_eq!(again, key);
        q.done(&again);
        assert!(q.is_empty());
        assert_eq!(q.processing(), 0);
    }

    #[tokio::test]
    async fn get_blocks_until_add() {
        let q = queue();
        let waiter = {
            let q = q.clone();
            tokio::spawn(async move { q.get().await })
        };
        tokio::task::yield_now().await;
        q.add("a/foo".to_string());
        let got = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("get should wake up")
            .unwrap();
        assert_eq!(got.as_deref(), Some("a/foo"));
    }

    #[tokio::test]
    async fn shutdown_releases_waiters_and_rejects_adds() {
        let q = queue();
        let waiter = {
            let q = q.clone();
            tokio::spawn(async move { q.get().await })
        };
        tokio::task::yield_now().await;
        q.shut_down();
        let got = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("get should return on shutdown")
            .unwrap();
        assert!(got.is_none());
        q.add("a/foo".to_string());
        assert!(q.is_empty());
        assert!(q.is_shutting_down());
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_adds_back_off_exponentially() {
        let q = queue();
        let key = "a/foo".to_string();
        q.add_rate_limited(key.clone());
        assert_eq!(q.num_requeues(&key), 1);
        assert!(q.is_empty());
        tokio::time::sleep(Duration::from_millis(11)).await;
        assert_eq!(q.len(), 1);

        let k = q.get().await.unwrap();
        q.done(&k);
        q.add_rate_limited(k.clone());
        assert_eq!(q.num_requeues(&k), 2);
        tokio::time::sleep(Duration::from_millis(15)).await;
        assert!(q.is_empty(), "second retry waits 20ms");
        tokio::time::sleep(Duration::from_millis(6)).await;
        assert_eq!(q.len(), 1);

        q.forget(&k);
        assert_eq!(q.num_requeues(&k), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_delayed_adds() {
        let q = queue();
        q.add_after("a/foo".to_string(), Duration::from_secs(5));
        q.shut_down();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(q.is_empty());
    }
}
