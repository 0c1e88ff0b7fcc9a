// Keyed single-flight registry
// Collapses concurrent identical async operations into one in-flight call

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::error::{ApiError, Result};

/// Retry and leak-protection settings for one `run` call
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DedupOptions {
    /// Retry the operation on failure
    pub retry: bool,

    /// Maximum number of retries after the first attempt
    pub retry_count: u32,

    /// Delay before the first retry
    pub retry_delay: Duration,

    /// Double the delay after every failed retry
    pub exponential_backoff: bool,

    /// Hard ceiling on how long an entry may stay registered
    pub ttl: Duration,
}

impl Default for DedupOptions {
    fn default() -> Self {
        Self {
            retry: false,
            retry_count: 3,
            retry_delay: Duration::from_millis(1000),
            exponential_backoff: false,
            ttl: Duration::from_secs(30),
        }
    }
}

impl DedupOptions {
    /// Bounded retry with exponential backoff
    pub fn with_backoff(retry_count: u32, retry_delay: Duration) -> Self {
        Self {
            retry: true,
            retry_count,
            retry_delay,
            exponential_backoff: true,
            ..Self::default()
        }
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    fn max_attempts(&self) -> u32 {
        if self.retry {
            self.retry_count + 1
        } else {
            1
        }
    }

    /// Delay after the given failed attempt (0-based)
    fn delay_for(&self, attempt: u32) -> Duration {
        if self.exponential_backoff {
            self.retry_delay
                .saturating_mul(2_u32.saturating_pow(attempt.min(16)))
        } else {
            self.retry_delay
        }
    }
}

type SharedOperation<T> = Shared<BoxFuture<'static, Result<T>>>;

/// Registered in-flight operation
struct InFlight<T> {
    id: u64,
    future: SharedOperation<T>,
    expires_at: Instant,
}

/// Keyed single-flight registry.
///
/// While an operation for `key` is in flight, every further `run` with the
/// same key awaits that operation instead of starting a new one. The entry
/// is removed as soon as the operation settles, or force-removed once it
/// outlives `ttl`.
pub struct Deduplicator<T> {
    entries: Arc<DashMap<String, InFlight<T>>>,
    next_id: AtomicU64,
}

impl<T> Default for Deduplicator<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Deduplicator<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Run `operation` unless an identical one is already in flight
    pub async fn run<F, Fut>(
        &self,
        key: impl Into<String>,
        operation: F,
        options: DedupOptions,
    ) -> Result<T>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let key = key.into();
        let now = Instant::now();

        let (future, deadline, started) = match self.entries.entry(key.clone()) {
            Entry::Occupied(entry) if entry.get().expires_at > now => {
                tracing::debug!(key = %key, "Joining in-flight operation");
                (entry.get().future.clone(), entry.get().expires_at, None)
            }
            Entry::Occupied(mut entry) => {
                tracing::warn!(key = %key, "Replacing stale in-flight operation");
                let (inflight, id) = self.register(&key, operation, options, now);
                let future = inflight.future.clone();
                let deadline = inflight.expires_at;
                entry.insert(inflight);
                (future, deadline, Some(id))
            }
            Entry::Vacant(entry) => {
                let (inflight, id) = self.register(&key, operation, options, now);
                let future = inflight.future.clone();
                let deadline = inflight.expires_at;
                entry.insert(inflight);
                (future, deadline, Some(id))
            }
        };

        if let Some(id) = started {
            self.spawn_driver(key.clone(), id, future.clone(), options.ttl);
        }

        // Callers give up together with the entry
        match tokio::time::timeout_at(deadline, future).await {
            Ok(result) => result,
            Err(_) => Err(ApiError::Network {
                kind: "timeout".to_string(),
                message: format!("Operation '{}' did not settle within its ttl", key),
            }),
        }
    }

    /// Check whether an operation is registered for `key`
    pub fn is_in_flight(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn register<F, Fut>(
        &self,
        key: &str,
        operation: F,
        options: DedupOptions,
        now: Instant,
    ) -> (InFlight<T>, u64)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let entries = Arc::clone(&self.entries);
        let op_key = key.to_string();

        let future = async move {
            let result = run_with_retry(&operation, &options, &op_key).await;
            entries.remove_if(&op_key, |_, inflight| inflight.id == id);
            result
        }
        .boxed()
        .shared();

        let inflight = InFlight {
            id,
            future,
            expires_at: now + options.ttl,
        };
        (inflight, id)
    }

    /// Drive the operation even if every caller goes away, and evict it at `ttl`
    fn spawn_driver(&self, key: String, id: u64, future: SharedOperation<T>, ttl: Duration) {
        let entries = Arc::clone(&self.entries);
        tokio::spawn(async move {
            if tokio::time::timeout(ttl, future).await.is_err() {
                tracing::warn!(key = %key, ttl_ms = ttl.as_millis() as u64, "Operation exceeded ttl, evicting");
                entries.remove_if(&key, |_, inflight| inflight.id == id);
            }
        });
    }
}

async fn run_with_retry<T, F, Fut>(operation: &F, options: &DedupOptions, key: &str) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = options.max_attempts();
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                attempt += 1;
                if attempt >= max_attempts {
                    return Err(e);
                }

                let delay = options.delay_for(attempt - 1);
                tracing::warn!(
                    key = %key,
                    error = %e,
                    "Operation failed, retrying after {}ms (attempt {}/{})",
                    delay.as_millis(),
                    attempt,
                    max_attempts - 1
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
