//! Fixed-window request rate limiting.
//!
//! The first hit for a key opens a window of `window_ms`; hits are counted
//! until `limit` is reached and rejected after that until the window ends.
//! Counters live in a [`RateLimitStore`]; the in-memory store provided here is
//! per process, so under horizontal scaling each instance enforces its own
//! limits.

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use thiserror::Error;
use tracing::debug;

use crate::clock::SharedClock;

/// Entries beyond which the in-memory store sweeps expired windows on access.
pub const DEFAULT_SWEEP_THRESHOLD: usize = 10_000;

/// Errors from the rate limiter.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RateLimitError {
    #[error("rate limit window must be greater than zero and representable")]
    InvalidWindow,

    #[error("rate limit exceeded, retry after {retry_after_seconds}s")]
    Exceeded { retry_after_seconds: u64 },
}

/// Outcome of a rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed { remaining: u32 },
    Limited { retry_after_seconds: u64 },
}

impl RateLimitDecision {
    #[must_use]
    pub const fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed { .. })
    }

    /// Turn a `Limited` decision into an error.
    ///
    /// # Errors
    ///
    /// Returns `RateLimitError::Exceeded` if the request was limited.
    pub const fn into_result(self) -> Result<u32, RateLimitError> {
        match self {
            Self::Allowed { remaining } => Ok(remaining),
            Self::Limited {
                retry_after_seconds,
            } => Err(RateLimitError::Exceeded {
                retry_after_seconds,
            }),
        }
    }
}

/// Counter state for one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCounter {
    pub count: u32,
    pub reset_at: DateTime<Utc>,
}

impl WindowCounter {
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.reset_at
    }
}

/// Result of recording a hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hit {
    pub counter: WindowCounter,
    pub accepted: bool,
}

/// Storage for rate limit counters.
///
/// `hit` must be atomic per key: concurrent hits on one key never push the
/// count past `limit`.
pub trait RateLimitStore: Send + Sync + fmt::Debug {
    /// Current live counter for `key`, if its window has not expired.
    fn get(&self, key: &str, now: DateTime<Utc>) -> Option<WindowCounter>;

    /// Record a hit, opening a fresh window ending at `reset_at` if none is live.
    fn hit(&self, key: &str, limit: u32, reset_at: DateTime<Utc>, now: DateTime<Utc>) -> Hit;

    /// Drop expired counters, returning how many were removed.
    fn evict_expired(&self, now: DateTime<Utc>) -> usize;
}

/// Mutex-guarded map of counters.
#[derive(Debug)]
pub struct InMemoryRateLimitStore {
    counters: Mutex<HashMap<String, WindowCounter>>,
    sweep_threshold: usize,
}

impl Default for InMemoryRateLimitStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRateLimitStore {
    #[must_use]
    pub fn new() -> Self {
        Self::with_sweep_threshold(DEFAULT_SWEEP_THRESHOLD)
    }

    #[must_use]
    pub fn with_sweep_threshold(sweep_threshold: usize) -> Self {
        Self {
            counters: Mutex::new(HashMap::new()),
            sweep_threshold,
        }
    }

    /// Number of keys currently tracked, including expired ones not yet swept.
    #[must_use]
    pub fn tracked_keys(&self) -> usize {
        self.lock().len()
    }

    /// Spawn a task that evicts expired counters every `interval`.
    ///
    /// The task runs until the returned handle is aborted or the runtime shuts down.
    pub fn start_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        clock: SharedClock,
    ) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let evicted = store.evict_expired(clock.now());
                if evicted > 0 {
                    debug!(evicted, "Swept expired rate limit counters");
                }
            }
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, WindowCounter>> {
        self.counters.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl RateLimitStore for InMemoryRateLimitStore {
    fn get(&self, key: &str, now: DateTime<Utc>) -> Option<WindowCounter> {
        self.lock()
            .get(key)
            .copied()
            .filter(|counter| !counter.is_expired(now))
    }

    fn hit(&self, key: &str, limit: u32, reset_at: DateTime<Utc>, now: DateTime<Utc>) -> Hit {
        let mut counters = self.lock();

        if counters.len() > self.sweep_threshold {
            counters.retain(|_, counter| !counter.is_expired(now));
        }

        let counter = counters
            .entry(key.to_owned())
            .and_modify(|counter| {
                if counter.is_expired(now) {
                    *counter = WindowCounter { count: 0, reset_at };
                }
            })
            .or_insert(WindowCounter { count: 0, reset_at });

        let accepted = counter.count < limit;
        if accepted {
            counter.count += 1;
        }

        Hit {
            counter: *counter,
            accepted,
        }
    }

    fn evict_expired(&self, now: DateTime<Utc>) -> usize {
        let mut counters = self.lock();
        let before = counters.len();
        counters.retain(|_, counter| !counter.is_expired(now));
        before - counters.len()
    }
}

/// Fixed-window rate limiter over a shared store.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    store: Arc<dyn RateLimitStore>,
    clock: SharedClock,
}

impl RateLimiter {
    #[must_use]
    pub fn new(store: Arc<dyn RateLimitStore>, clock: SharedClock) -> Self {
        Self { store, clock }
    }

    /// Limiter over a fresh in-memory store.
    #[must_use]
    pub fn in_memory(clock: SharedClock) -> Self {
        Self::new(Arc::new(InMemoryRateLimitStore::new()), clock)
    }

    /// Record a request for `key` and decide whether it may proceed.
    ///
    /// A `limit` of zero always limits.
    ///
    /// # Errors
    ///
    /// Returns `RateLimitError::InvalidWindow` if `window_ms` is zero or the
    /// window would end past the representable date range.
    pub fn check(
        &self,
        key: impl AsRef<str>,
        limit: u32,
        window_ms: u64,
    ) -> Result<RateLimitDecision, RateLimitError> {
        if window_ms == 0 {
            return Err(RateLimitError::InvalidWindow);
        }
        let key = key.as_ref();
        let now = self.clock.now();
        let reset_at = i64::try_from(window_ms)
            .ok()
            .and_then(TimeDelta::try_milliseconds)
            .and_then(|window| now.checked_add_signed(window))
            .ok_or(RateLimitError::InvalidWindow)?;

        if limit == 0 {
            debug!(key, "Rate limit is zero, rejecting");
            return Ok(RateLimitDecision::Limited {
                retry_after_seconds: retry_after(reset_at, now),
            });
        }

        let hit = self.store.hit(key, limit, reset_at, now);
        if hit.accepted {
            Ok(RateLimitDecision::Allowed {
                remaining: limit.saturating_sub(hit.counter.count),
            })
        } else {
            let retry_after_seconds = retry_after(hit.counter.reset_at, now);
            debug!(key, retry_after_seconds, "Rate limit exceeded");
            Ok(RateLimitDecision::Limited {
                retry_after_seconds,
            })
        }
    }

    /// Like [`RateLimiter::check`] but returns an error when limited.
    ///
    /// # Errors
    ///
    /// Returns `RateLimitError::Exceeded` when limited and
    /// `RateLimitError::InvalidWindow` for a zero window.
    pub fn enforce(
        &self,
        key: impl AsRef<str>,
        limit: u32,
        window_ms: u64,
    ) -> Result<u32, RateLimitError> {
        self.check(key, limit, window_ms)?.into_result()
    }
}

/// Whole seconds until `reset_at`, rounded up, at least 1.
fn retry_after(reset_at: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
    let remaining_ms = u64::try_from((reset_at - now).num_milliseconds()).unwrap_or(0);
    remaining_ms.div_ceil(1_000).max(1)
}

/// Builder for rate limit keys: `<operation>[:actor=<id>][:ip=<addr>]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimitKey(String);

impl RateLimitKey {
    #[must_use]
    pub fn new(operation: &str) -> Self {
        Self(operation.to_owned())
    }

    #[must_use]
    pub fn actor(mut self, id: impl fmt::Display) -> Self {
        self.0.push_str(&format!(":actor={id}"));
        self
    }

    #[must_use]
    pub fn ip(mut self, addr: IpAddr) -> Self {
        self.0.push_str(&format!(":ip={addr}"));
        self
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for RateLimitKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
