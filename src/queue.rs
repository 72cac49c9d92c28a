//! Rate-limited, de-duplicating work queue
//!
//! A key added while it is already queued is coalesced. A key added while a
//! worker holds it is parked in the dirty set and queued again when the
//! worker calls [`WorkQueue::done`], so at most one worker ever holds a key.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::metrics::{WORK_QUEUE_DEPTH, WORK_QUEUE_RETRIES};
use crate::Error;

/// Requeues allowed before a key is dropped
pub const MAX_RETRIES: u32 = 20;

/// Decides how long a failing key waits before it is retried
pub trait RateLimiter: Send + Sync {
    fn when(&self, key: &str) -> Duration;
    fn forget(&self, key: &str);
    fn num_requeues(&self, key: &str) -> u32;
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Per-key exponential backoff: `base * 2^failures`, capped at `max`
pub struct ItemExponentialLimiter {
    base: Duration,
    max: Duration,
    failures: Mutex<HashMap<String, u32>>,
}

impl ItemExponentialLimiter {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: Mutex::new(HashMap::new()),
        }
    }
}

impl RateLimiter for ItemExponentialLimiter {
    fn when(&self, key: &str) -> Duration {
        let mut failures = locked(&self.failures);
        let count = failures.entry(key.to_string()).or_insert(0);
        let exp = *count;
        *count += 1;

        let factor = 2u32.checked_pow(exp).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .map_or(self.max, |d| d.min(self.max))
    }

    fn forget(&self, key: &str) {
        locked(&self.failures).remove(key);
    }

    fn num_requeues(&self, key: &str) -> u32 {
        locked(&self.failures).get(key).copied().unwrap_or(0)
    }
}

struct Bucket {
    tokens: f64,
    last: Instant,
}

/// Overall token bucket shared by every key
pub struct BucketLimiter {
    qps: f64,
    burst: f64,
    bucket: Mutex<Bucket>,
}

impl BucketLimiter {
    pub fn new(qps: f64, burst: u32) -> Self {
        Self {
            qps,
            burst: f64::from(burst),
            bucket: Mutex::new(Bucket {
                tokens: f64::from(burst),
                last: Instant::now(),
            }),
        }
    }
}

impl RateLimiter for BucketLimiter {
    /// Reserve one token and return how long until it is available
    fn when(&self, _key: &str) -> Duration {
        let mut bucket = locked(&self.bucket);
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(bucket.last).as_secs_f64();
        bucket.last = now;
        bucket.tokens = (bucket.tokens + elapsed * self.qps).min(self.burst);
        bucket.tokens -= 1.0;
        if bucket.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-bucket.tokens / self.qps)
        }
    }

    fn forget(&self, _key: &str) {}

    fn num_requeues(&self, _key: &str) -> u32 {
        0
    }
}

/// Takes the longest delay of its limiters
pub struct MaxOfLimiter {
    limiters: Vec<Box<dyn RateLimiter>>,
}

impl MaxOfLimiter {
    pub fn new(limiters: Vec<Box<dyn RateLimiter>>) -> Self {
        Self { limiters }
    }
}

impl RateLimiter for MaxOfLimiter {
    fn when(&self, key: &str) -> Duration {
        self.limiters
            .iter()
            .map(|l| l.when(key))
            .max()
            .unwrap_or(Duration::ZERO)
    }

    fn forget(&self, key: &str) {
        for l in &self.limiters {
            l.forget(key);
        }
    }

    fn num_requeues(&self, key: &str) -> u32 {
        self.limiters
            .iter()
            .map(|l| l.num_requeues(key))
            .max()
            .unwrap_or(0)
    }
}

/// 5ms..1000s per-key backoff combined with a 10 qps / 100 burst bucket
pub fn default_rate_limiter() -> MaxOfLimiter {
    MaxOfLimiter::new(vec![
        Box::new(ItemExponentialLimiter::new(
            Duration::from_millis(5),
            Duration::from_secs(1000),
        )),
        Box::new(BucketLimiter::new(10.0, 100)),
    ])
}

#[derive(Default)]
struct State {
    queue: VecDeque<String>,
    dirty: HashSet<String>,
    processing: HashSet<String>,
    shutting_down: bool,
}

pub struct WorkQueue {
    name: &'static str,
    state: Mutex<State>,
    notify: Notify,
    limiter: Box<dyn RateLimiter>,
}

impl WorkQueue {
    pub fn new(name: &'static str) -> Arc<Self> {
        Self::with_rate_limiter(name, Box::new(default_rate_limiter()))
    }

    pub fn with_rate_limiter(name: &'static str, limiter: Box<dyn RateLimiter>) -> Arc<Self> {
        Arc::new(Self {
            name,
            state: Mutex::new(State::default()),
            notify: Notify::new(),
            limiter,
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    fn depth_changed(&self, state: &State) {
        WORK_QUEUE_DEPTH
            .with_label_values(&[self.name])
            .set(state.queue.len() as f64);
    }

    pub fn add(&self, key: impl Into<String>) {
        let key = key.into();
        let mut state = locked(&self.state);
        if state.shutting_down || state.dirty.contains(&key) {
            return;
        }
        state.dirty.insert(key.clone());
        if state.processing.contains(&key) {
            return;
        }
        state.queue.push_back(key);
        self.depth_changed(&state);
        drop(state);
        self.notify.notify_one();
    }

    /// Add `key` once `delay` has elapsed
    pub fn add_after(self: &Arc<Self>, key: impl Into<String>, delay: Duration) {
        let key = key.into();
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Add `key` after the rate limiter says it may run again
    pub fn add_rate_limited(self: &Arc<Self>, key: impl Into<String>) {
        let key = key.into();
        let delay = self.limiter.when(&key);
        WORK_QUEUE_RETRIES.with_label_values(&[self.name]).inc();
        self.add_after(key, delay);
    }

    /// Clear the retry history of `key`
    pub fn forget(&self, key: &str) {
        self.limiter.forget(key);
    }

    pub fn num_requeues(&self, key: &str) -> u32 {
        self.limiter.num_requeues(key)
    }

    /// Wait for the next key. Returns `None` once the queue is shut down.
    pub async fn get(&self) -> Option<String> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = locked(&self.state);
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    self.depth_changed(&state);
                    return Some(key);
                }
            }

            notified.await;
        }
    }

    /// Release `key`. A re-add that arrived while it was held queues it again.
    pub fn done(&self, key: &str) {
        let mut state = locked(&self.state);
        state.processing.remove(key);
        if state.shutting_down || !state.dirty.contains(key) {
            return;
        }
        state.queue.push_back(key.to_string());
        self.depth_changed(&state);
        drop(state);
        self.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        locked(&self.state).queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_processing(&self, key: &str) -> bool {
        locked(&self.state).processing.contains(key)
    }

    pub fn shut_down(&self) {
        locked(&self.state).shutting_down = true;
        self.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        locked(&self.state).shutting_down
    }
}

/// What happened to a key after its handler returned
#[derive(Debug)]
pub enum ItemOutcome {
    Synced,
    Requeued(u32),
    /// The error is not retryable
    Dropped(Error),
    /// The key failed [`MAX_RETRIES`] times
    RetriesExhausted(Error),
}

/// Apply the retry policy to the result of handling `key` and release it
pub fn handle_result(queue: &Arc<WorkQueue>, key: &str, result: crate::Result<()>) -> ItemOutcome {
    let outcome = match result {
        Ok(()) => {
            queue.forget(key);
            ItemOutcome::Synced
        }
        Err(Error::Cancelled) => {
            debug!(queue = queue.name(), key, "Sync cancelled");
            queue.forget(key);
            ItemOutcome::Dropped(Error::Cancelled)
        }
        Err(err) if err.is_retryable() => {
            let attempts = queue.num_requeues(key);
            if attempts < MAX_RETRIES {
                warn!(queue = queue.name(), key, attempt = attempts + 1, error = %err, "Sync failed, requeuing");
                queue.add_rate_limited(key);
                ItemOutcome::Requeued(attempts + 1)
            } else {
                error!(queue = queue.name(), key, error = %err, "Sync failed too many times, dropping key");
                queue.forget(key);
                ItemOutcome::RetriesExhausted(err)
            }
        }
        Err(err) => {
            match &err {
                Error::Internal(_) => error!(queue = queue.name(), key, error = %err, "Dropping key"),
                _ => warn!(queue = queue.name(), key, error = %err, "Dropping key"),
            }
            queue.forget(key);
            ItemOutcome::Dropped(err)
        }
    };
    queue.done(key);
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_delay() -> Box<dyn RateLimiter> {
        Box::new(ItemExponentialLimiter::new(Duration::ZERO, Duration::ZERO))
    }

    #[tokio::test]
    async fn duplicate_adds_coalesce() {
        let q = WorkQueue::with_rate_limiter("test", no_delay());
        q.add("default/a");
        q.add("default/a");
        q.add("default/b");
        assert_eq!(q.len(), 2);

        assert_eq!(q.get().await.as_deref(), Some("default/a"));
        assert_eq!(q.get().await.as_deref(), Some("default/b"));
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn readd_while_processing_waits_for_done() {
        let q = WorkQueue::with_rate_limiter("test", no_delay());
        q.add("default/a");
        let key = q.get().await.unwrap();
        assert!(q.is_processing(&key));

        q.add("default/a");
        q.add("default/a");
        assert!(q.is_empty());

        q.done(&key);
        assert_eq!(q.len(), 1);
        assert_eq!(q.get().await.as_deref(), Some("default/a"));
        q.done("default/a");
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn shutdown_releases_waiting_workers() {
        let q = WorkQueue::with_rate_limiter("test", no_delay());
        let waiter = {
            let q = q.clone();
            tokio::spawn(async move { q.get().await })
        };
        tokio::task::yield_now().await;
        q.shut_down();
        assert!(q.is_shutting_down());
        assert_eq!(waiter.await.unwrap(), None);

        q.add("default/a");
        assert!(q.is_empty());
    }

    #[test]
    fn get_waits_until_a_key_arrives() {
        let q = WorkQueue::with_rate_limiter("test", no_delay());
        let mut get = tokio_test::task::spawn(q.get());
        tokio_test::assert_pending!(get.poll());

        q.add("default/a");
        assert!(get.is_woken());
        let key = tokio_test::assert_ready!(get.poll());
        assert_eq!(key.as_deref(), Some("default/a"));
    }

    #[tokio::test]
    async fn in_flight_key_is_not_requeued_after_shutdown() {
        let q = WorkQueue::with_rate_limiter("test", no_delay());
        q.add("default/a");
        let key = q.get().await.unwrap();
        q.add("default/a");
        q.shut_down();
        q.done(&key);
        assert!(q.is_empty());
    }

    #[test]
    fn exponential_backoff_doubles_and_caps() {
        let limiter =
            ItemExponentialLimiter::new(Duration::from_millis(5), Duration::from_millis(30));
        assert_eq!(limiter.when("k"), Duration::from_millis(5));
        assert_eq!(limiter.when("k"), Duration::from_millis(10));
        assert_eq!(limiter.when("k"), Duration::from_millis(20));
        assert_eq!(limiter.when("k"), Duration::from_millis(30));
        assert_eq!(limiter.num_requeues("k"), 4);

        limiter.forget("k");
        assert_eq!(limiter.num_requeues("k"), 0);
        assert_eq!(limiter.when("k"), Duration::from_millis(5));
    }

    #[tokio::test(start_paused = true)]
    async fn bucket_allows_burst_then_throttles() {
        let limiter = BucketLimiter::new(10.0, 2);
        assert_eq!(limiter.when("a"), Duration::ZERO);
        assert_eq!(limiter.when("b"), Duration::ZERO);
        assert!(limiter.when("c") > Duration::ZERO);
    }

    #[tokio::test]
    async fn retries_stop_after_max() {
        let q = WorkQueue::with_rate_limiter("test", no_delay());
        let key = "default/a";
        for attempt in 1..=MAX_RETRIES {
            q.add(key);
            let got = q.get().await.unwrap();
            let outcome = handle_result(&q, &got, Err(Error::Transient("down".to_string())));
            assert!(matches!(outcome, ItemOutcome::Requeued(n) if n == attempt));
        }
        let got = q.get().await.unwrap();
        let outcome = handle_result(&q, &got, Err(Error::Transient("down".to_string())));
        assert!(matches!(outcome, ItemOutcome::RetriesExhausted(_)));
        assert_eq!(q.num_requeues(key), 0);
    }

    #[tokio::test]
    async fn permanent_errors_are_dropped() {
        let q = WorkQueue::with_rate_limiter("test", no_delay());
        q.add("default/a");
        let key = q.get().await.unwrap();
        let outcome = handle_result(&q, &key, Err(Error::Permanent("no".to_string())));
        assert!(matches!(outcome, ItemOutcome::Dropped(_)));
        assert!(q.is_empty());
        assert!(!q.is_processing(&key));
    }
}
