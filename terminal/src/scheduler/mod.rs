//! # Request Scheduler
//!
//! Priority-ordered, rate-limited queue for outbound backend calls, with
//! response caching, per-key deduplication, and cooperative cancellation.
//!
//! Every backend call that must not overwhelm the server goes through one of
//! these. The scheduler is an explicitly constructed component: create one,
//! wrap it in an `Arc`, and hand it to whoever needs to enqueue work. There is
//! no process-wide instance.
//!
//! ## Guarantees
//!
//! - At most one live request per key: enqueuing under an existing key cancels
//!   and rejects the previous request first.
//! - Dispatches are spaced at least `min_interval` apart, across all keys.
//! - Successful responses are cached for `cache_ttl` and served without a
//!   network round-trip while valid.
//! - A rate-limited response is retried exactly once: wait `rate_limit_backoff`,
//!   then resolve from the cache (even a stale entry) or reject.
//! - `cancel_all` is synchronous and complete on return, so a caller tearing
//!   down an identity can be certain no stale response will surface later.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::core::error::RequestError;

/// Priority used when the caller has no ordering preference. Lower runs sooner.
pub const DEFAULT_PRIORITY: i32 = 10;

/// Scheduler tuning knobs.
///
/// The backoff window and cache TTL are configuration rather than constants;
/// deployments adjust them to the backend's actual rate limits.
#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    /// Minimum spacing between two dispatched calls.
    pub min_interval: Duration,
    /// Validity window of a cached response.
    pub cache_ttl: Duration,
    /// Wait applied after a rate-limited response before the cache fallback.
    pub rate_limit_backoff: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(500),
            cache_ttl: Duration::from_secs(30),
            rate_limit_backoff: Duration::from_secs(2),
        }
    }
}

type Invoke<T> = Box<dyn FnOnce() -> BoxFuture<'static, Result<T, RequestError>> + Send>;
type Reply<T> = oneshot::Sender<Result<T, RequestError>>;

struct QueuedRequest<T> {
    key: String,
    invoke: Invoke<T>,
    priority: i32,
    reply: Reply<T>,
}

/// The request currently owned by the processing loop. It stays registered
/// here through the rate-limit wait, the call itself, and any backoff, so
/// `cancel`/`cancel_all` can always reach it.
struct InFlight<T> {
    key: String,
    reply: Option<Reply<T>>,
    cancelled: bool,
}

struct CacheEntry<T> {
    value: T,
    stored_at: Instant,
}

struct Inner<T> {
    queue: Vec<QueuedRequest<T>>,
    cache: HashMap<String, CacheEntry<T>>,
    in_flight: Option<InFlight<T>>,
    last_dispatch: Option<Instant>,
    loop_running: bool,
}

impl<T> Inner<T> {
    fn cancel_key(&mut self, key: &str) {
        // Invariant: at most one queued entry per key exists.
        if let Some(pos) = self.queue.iter().position(|q| q.key == key) {
            let entry = self.queue.remove(pos);
            let _ = entry.reply.send(Err(RequestError::Cancelled));
        }
        if let Some(fl) = self.in_flight.as_mut() {
            if fl.key == key && !fl.cancelled {
                fl.cancelled = true;
                if let Some(tx) = fl.reply.take() {
                    let _ = tx.send(Err(RequestError::Cancelled));
                }
            }
        }
    }
}

/// A pending scheduled request. Resolves to the backend response, or to
/// [`RequestError::Cancelled`] when superseded or bulk-cancelled.
pub struct PendingRequest<T> {
    rx: oneshot::Receiver<Result<T, RequestError>>,
}

impl<T> Future for PendingRequest<T> {
    type Output = Result<T, RequestError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            // Sender dropped without a resolution: treat as cancellation.
            Poll::Ready(Err(_)) => Poll::Ready(Err(RequestError::Cancelled)),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Priority request scheduler. See the module docs for the contract.
pub struct RequestScheduler<T> {
    inner: Arc<Mutex<Inner<T>>>,
    config: SchedulerConfig,
}

impl<T: Clone + Send + 'static> RequestScheduler<T> {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                queue: Vec::new(),
                cache: HashMap::new(),
                in_flight: None,
                last_dispatch: None,
                loop_running: false,
            })),
            config,
        }
    }

    /// Enqueue a call under a logical key.
    ///
    /// Registration is synchronous: by the time this returns, any previous
    /// request under `key` has been cancelled and the new entry is either
    /// resolved from cache or queued. The returned future resolves when the
    /// call settles.
    pub fn enqueue<F, Fut>(&self, key: impl Into<String>, priority: i32, invoke: F) -> PendingRequest<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, RequestError>> + Send + 'static,
    {
        let key = key.into();
        let (tx, rx) = oneshot::channel();

        let mut inner = self.inner.lock();

        // Cancel-then-replace: the old promise is rejected before the new
        // entry is admitted, so no two live requests share a key.
        inner.cancel_key(&key);

        // Serve from cache while the entry is within its TTL. Stale entries
        // are left in place: the rate-limit fallback may still use them, and
        // a successful dispatch overwrites them.
        if let Some(entry) = inner.cache.get(&key) {
            if entry.stored_at.elapsed() < self.config.cache_ttl {
                trace!(key = %key, "request served from cache");
                let _ = tx.send(Ok(entry.value.clone()));
                return PendingRequest { rx };
            }
        }

        inner.queue.push(QueuedRequest {
            key,
            invoke: Box::new(move || Box::pin(invoke())),
            priority,
            reply: tx,
        });
        // Stable sort: equal priorities keep arrival order.
        inner.queue.sort_by_key(|q| q.priority);

        if !inner.loop_running {
            inner.loop_running = true;
            let inner_arc = Arc::clone(&self.inner);
            let config = self.config.clone();
            tokio::spawn(run_loop(inner_arc, config));
        }

        PendingRequest { rx }
    }

    /// Cancel the request under `key`, if any.
    ///
    /// A queued entry is removed and its promise rejected. An in-flight call
    /// is allowed to finish, but its caller is rejected now and its result is
    /// discarded (never cached).
    pub fn cancel(&self, key: &str) {
        self.inner.lock().cancel_key(key);
    }

    /// Cancel every queued and in-flight request.
    ///
    /// Synchronous: when this returns, every previously pending promise has
    /// been rejected with [`RequestError::Cancelled`] and any in-flight result
    /// will be discarded. Callers tearing down an identity invoke this before
    /// establishing a new one.
    pub fn cancel_all(&self) {
        let mut inner = self.inner.lock();
        let count = inner.queue.len();
        for entry in inner.queue.drain(..) {
            let _ = entry.reply.send(Err(RequestError::Cancelled));
        }
        if let Some(fl) = inner.in_flight.as_mut() {
            if !fl.cancelled {
                fl.cancelled = true;
                if let Some(tx) = fl.reply.take() {
                    let _ = tx.send(Err(RequestError::Cancelled));
                }
            }
        }
        if count > 0 || inner.in_flight.is_some() {
            debug!(cancelled = count, "scheduler queue cancelled");
        }
    }

    /// Number of queued plus in-flight requests (in-flight counts until its
    /// result settles, even when already cancelled).
    pub fn pending(&self) -> usize {
        let inner = self.inner.lock();
        inner.queue.len() + usize::from(inner.in_flight.is_some())
    }

    /// Number of cached responses, including stale ones awaiting overwrite.
    pub fn cache_len(&self) -> usize {
        self.inner.lock().cache.len()
    }
}

/// Single cooperative processing loop. Spawned when the first entry arrives
/// and exits when the queue drains; the next `enqueue` respawns it. Never
/// re-entrant: at most one of these runs per scheduler.
async fn run_loop<T: Clone + Send + 'static>(inner: Arc<Mutex<Inner<T>>>, config: SchedulerConfig) {
    loop {
        // Take the highest-priority head and register it as in-flight so
        // cancellation can reach it during the waits below.
        let (key, invoke) = {
            let mut guard = inner.lock();
            if guard.queue.is_empty() {
                guard.loop_running = false;
                return;
            }
            let entry = guard.queue.remove(0);
            guard.in_flight = Some(InFlight {
                key: entry.key.clone(),
                reply: Some(entry.reply),
                cancelled: false,
            });
            (entry.key, entry.invoke)
        };

        // Rate limit: space dispatches at least min_interval apart.
        let wait = {
            let guard = inner.lock();
            guard
                .last_dispatch
                .map(|t| (t + config.min_interval).saturating_duration_since(Instant::now()))
                .unwrap_or(Duration::ZERO)
        };
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }

        // The entry may have been cancelled while we waited.
        let proceed = {
            let mut guard = inner.lock();
            match guard.in_flight.as_ref() {
                Some(fl) if fl.cancelled => {
                    guard.in_flight = None;
                    false
                }
                Some(_) => {
                    guard.last_dispatch = Some(Instant::now());
                    true
                }
                None => false,
            }
        };
        if !proceed {
            continue;
        }

        trace!(key = %key, "dispatching request");
        let result = invoke().await;

        match result {
            Ok(value) => {
                let mut guard = inner.lock();
                if let Some(mut fl) = guard.in_flight.take() {
                    if !fl.cancelled {
                        guard.cache.insert(
                            fl.key.clone(),
                            CacheEntry {
                                value: value.clone(),
                                stored_at: Instant::now(),
                            },
                        );
                        if let Some(tx) = fl.reply.take() {
                            let _ = tx.send(Ok(value));
                        }
                    } else {
                        trace!(key = %key, "discarding result of cancelled request");
                    }
                }
            }
            Err(RequestError::RateLimited) => {
                warn!(
                    key = %key,
                    backoff_ms = config.rate_limit_backoff.as_millis() as u64,
                    "backend rate limited, backing off"
                );
                // Stay registered as in-flight through the backoff so a
                // cancellation arriving now still voids the entry.
                tokio::time::sleep(config.rate_limit_backoff).await;
                let mut guard = inner.lock();
                if let Some(mut fl) = guard.in_flight.take() {
                    if !fl.cancelled {
                        // Fall back to the cache even past its TTL; reject
                        // only when nothing was ever cached for this key.
                        let cached = guard.cache.get(&fl.key).map(|c| c.value.clone());
                        if let Some(tx) = fl.reply.take() {
                            let _ = match cached {
                                Some(value) => tx.send(Ok(value)),
                                None => tx.send(Err(RequestError::RateLimited)),
                            };
                        }
                    }
                }
            }
            Err(err) => {
                let mut guard = inner.lock();
                if let Some(mut fl) = guard.in_flight.take() {
                    if !fl.cancelled {
                        debug!(key = %key, error = %err, "request failed");
                        if let Some(tx) = fl.reply.take() {
                            let _ = tx.send(Err(err));
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_config() -> SchedulerConfig {
        SchedulerConfig {
            min_interval: Duration::from_millis(500),
            cache_ttl: Duration::from_secs(30),
            rate_limit_backoff: Duration::from_secs(2),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_key_supersedes_queued_entry() {
        let scheduler = RequestScheduler::new(test_config());
        let first_calls = Arc::new(AtomicUsize::new(0));
        let first_calls_clone = Arc::clone(&first_calls);

        let first = scheduler.enqueue("reg", DEFAULT_PRIORITY, move || async move {
            first_calls_clone.fetch_add(1, Ordering::SeqCst);
            Ok("first".to_string())
        });
        let second = scheduler.enqueue("reg", DEFAULT_PRIORITY, || async { Ok("second".to_string()) });

        assert_eq!(first.await, Err(RequestError::Cancelled));
        assert_eq!(second.await, Ok("second".to_string()));
        assert_eq!(first_calls.load(Ordering::SeqCst), 0);

        // Only the second result was cached.
        let cached = scheduler.enqueue("reg", DEFAULT_PRIORITY, || async { Ok("third".to_string()) });
        assert_eq!(cached.await, Ok("second".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_hit_skips_invoke() {
        let scheduler = RequestScheduler::new(test_config());
        let calls = Arc::new(AtomicUsize::new(0));

        let calls_a = Arc::clone(&calls);
        let first = scheduler.enqueue("bal", DEFAULT_PRIORITY, move || async move {
            calls_a.fetch_add(1, Ordering::SeqCst);
            Ok(42u64)
        });
        assert_eq!(first.await, Ok(42));

        let calls_b = Arc::clone(&calls);
        let second = scheduler.enqueue("bal", DEFAULT_PRIORITY, move || async move {
            calls_b.fetch_add(1, Ordering::SeqCst);
            Ok(99u64)
        });
        assert_eq!(second.await, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_expires_after_ttl() {
        let scheduler = RequestScheduler::new(test_config());

        let first = scheduler.enqueue("bal", DEFAULT_PRIORITY, || async { Ok(1u64) });
        assert_eq!(first.await, Ok(1));

        tokio::time::advance(Duration::from_secs(31)).await;

        let second = scheduler.enqueue("bal", DEFAULT_PRIORITY, || async { Ok(2u64) });
        assert_eq!(second.await, Ok(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all_rejects_everything() {
        let scheduler = RequestScheduler::new(test_config());

        let a = scheduler.enqueue("a", DEFAULT_PRIORITY, || async { Ok(1u64) });
        let b = scheduler.enqueue("b", DEFAULT_PRIORITY, || async { Ok(2u64) });
        let c = scheduler.enqueue("c", DEFAULT_PRIORITY, || async { Ok(3u64) });

        scheduler.cancel_all();
        assert_eq!(scheduler.pending(), 0);

        assert_eq!(a.await, Err(RequestError::Cancelled));
        assert_eq!(b.await, Err(RequestError::Cancelled));
        assert_eq!(c.await, Err(RequestError::Cancelled));

        // Nothing was cached for the cancelled entries.
        assert_eq!(scheduler.cache_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_min_interval_between_dispatches() {
        let scheduler = RequestScheduler::new(test_config());
        let stamps = Arc::new(Mutex::new(Vec::new()));

        let mut pending = Vec::new();
        for key in ["k1", "k2", "k3"] {
            let stamps = Arc::clone(&stamps);
            pending.push(scheduler.enqueue(key, DEFAULT_PRIORITY, move || async move {
                stamps.lock().push(Instant::now());
                Ok(())
            }));
        }
        for p in pending {
            assert_eq!(p.await, Ok(()));
        }

        let stamps = stamps.lock();
        assert_eq!(stamps.len(), 3);
        for pair in stamps.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(500));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_priority_order_and_arrival_ties() {
        let scheduler = RequestScheduler::new(test_config());
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut pending = Vec::new();
        for (key, priority) in [("low", 20), ("first", 5), ("second", 5), ("urgent", 1)] {
            let order = Arc::clone(&order);
            pending.push(scheduler.enqueue(key, priority, move || async move {
                order.lock().push(key);
                Ok(())
            }));
        }
        for p in pending {
            assert_eq!(p.await, Ok(()));
        }

        assert_eq!(*order.lock(), vec!["urgent", "first", "second", "low"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_falls_back_to_stale_cache() {
        let scheduler = RequestScheduler::new(test_config());

        let first = scheduler.enqueue("reg", DEFAULT_PRIORITY, || async { Ok("v1".to_string()) });
        assert_eq!(first.await, Ok("v1".to_string()));

        // Let the cached entry expire, then hit a rate limit: the scheduler
        // backs off once and serves the stale value.
        tokio::time::advance(Duration::from_secs(31)).await;

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);
        let second = scheduler.enqueue("reg", DEFAULT_PRIORITY, move || async move {
            calls_clone.fetch_add(1, Ordering::SeqCst);
            Err(RequestError::RateLimited)
        });
        assert_eq!(second.await, Ok("v1".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_without_cache_rejects() {
        let scheduler: RequestScheduler<String> = RequestScheduler::new(test_config());

        let pending = scheduler.enqueue("reg", DEFAULT_PRIORITY, || async {
            Err(RequestError::RateLimited)
        });
        assert_eq!(pending.await, Err(RequestError::RateLimited));
    }

    #[tokio::test(start_paused = true)]
    async fn test_other_failures_propagate_without_retry() {
        let scheduler: RequestScheduler<String> = RequestScheduler::new(test_config());
        let calls = Arc::new(AtomicUsize::new(0));

        let calls_clone = Arc::clone(&calls);
        let pending = scheduler.enqueue("reg", DEFAULT_PRIORITY, move || async move {
            calls_clone.fetch_add(1, Ordering::SeqCst);
            Err(RequestError::Backend("boom".to_string()))
        });
        assert_eq!(
            pending.await,
            Err(RequestError::Backend("boom".to_string()))
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.cache_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_in_flight_discards_result() {
        let scheduler = RequestScheduler::new(test_config());
        let (gate_tx, gate_rx) = oneshot::channel::<()>();

        let pending = scheduler.enqueue("slow", DEFAULT_PRIORITY, move || async move {
            let _ = gate_rx.await;
            Ok("late".to_string())
        });

        // Let the loop dispatch the call, then cancel while it is in flight.
        tokio::task::yield_now().await;
        scheduler.cancel("slow");
        assert_eq!(pending.await, Err(RequestError::Cancelled));

        // The call finishes, but its result is discarded, not cached.
        let _ = gate_tx.send(());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(scheduler.cache_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_distinct_keys_both_resolve_in_arrival_order() {
        // Two registration lookups under different keys with equal priority:
        // both resolve, spaced by the rate limit.
        let scheduler = RequestScheduler::new(test_config());
        let order = Arc::new(Mutex::new(Vec::new()));

        let order_a = Arc::clone(&order);
        let a = scheduler.enqueue("registration_0xABC", 5, move || async move {
            order_a.lock().push(("abc", Instant::now()));
            Ok("registered".to_string())
        });
        let order_b = Arc::clone(&order);
        let b = scheduler.enqueue("registration_0xDEF", 5, move || async move {
            order_b.lock().push(("def", Instant::now()));
            Ok("unregistered".to_string())
        });

        assert_eq!(a.await, Ok("registered".to_string()));
        assert_eq!(b.await, Ok("unregistered".to_string()));

        let order = order.lock();
        assert_eq!(order[0].0, "abc");
        assert_eq!(order[1].0, "def");
        assert!(order[1].1 - order[0].1 >= Duration::from_millis(500));
    }
}
