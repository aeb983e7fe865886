//! Single-flight, TTL- and LRU-bounded cache for phase results.
//!
//! Concurrent requests for one fingerprint share a single computation. The
//! computation runs on its own task, so it finishes (and populates the cache)
//! even when every caller has stopped waiting. Failures are handed to
//! everyone who waited on them and then forgotten, as are values the
//! retention predicate rejects.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::config::CacheConfig;
use crate::pipeline::types::Phase;

// ── Clock ───────────────────────────────────────────────────────────

/// Time source for expiry decisions.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when told to (for tests).
#[derive(Debug)]
pub struct ManualClock {
    base: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut offset = self.offset.lock().unwrap_or_else(PoisonError::into_inner);
        *offset += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + *self.offset.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ── Keys ────────────────────────────────────────────────────────────

/// SHA-256 over content hash, phase, model and prompt version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn new(content_hash: &str, phase: Phase, model: &str, prompt_version: &str) -> Self {
        let mut hasher = Sha256::new();
        for part in [content_hash, phase.as_str(), model, prompt_version] {
            hasher.update(part.as_bytes());
            hasher.update([0u8]);
        }
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form is enough to correlate log lines.
        f.write_str(&self.0[..self.0.len().min(12)])
    }
}

// ── Errors & stats ──────────────────────────────────────────────────

/// Failures of the cache machinery itself, as opposed to the computation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CacheError {
    #[error("cached computation aborted: {0}")]
    Aborted(String),
}

/// How a value was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheSource {
    /// Served from a stored entry.
    Hit,
    /// This caller started the computation.
    Computed,
    /// This caller waited on another caller's computation.
    Joined,
}

impl CacheSource {
    pub fn is_hit(&self) -> bool {
        matches!(self, Self::Hit)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub coalesced: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub size: usize,
}

// ── Cache ───────────────────────────────────────────────────────────

struct CacheEntry<V> {
    value: V,
    expires_at: Instant,
    last_access: u64,
}

type SharedCompute<V, E> = Shared<BoxFuture<'static, Result<V, E>>>;

struct CacheState<V, E> {
    entries: HashMap<Fingerprint, CacheEntry<V>>,
    in_flight: HashMap<Fingerprint, SharedCompute<V, E>>,
    /// Monotonic access counter for LRU ordering.
    tick: u64,
    stats: CacheStats,
}

impl<V, E> CacheState<V, E> {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    /// Live value for `key`, dropping it if expired.
    fn lookup(&mut self, key: &Fingerprint, now: Instant) -> Option<&mut CacheEntry<V>> {
        let expired = self.entries.get(key).is_some_and(|e| e.expires_at <= now);
        if expired {
            self.entries.remove(key);
            self.stats.expirations += 1;
            return None;
        }
        self.entries.get_mut(key)
    }

    fn insert(&mut self, key: Fingerprint, value: V, now: Instant, ttl: Duration, max_entries: usize) {
        if !self.entries.contains_key(&key) && self.entries.len() >= max_entries {
            self.purge_expired(now);
        }
        while !self.entries.contains_key(&key) && self.entries.len() >= max_entries {
            let Some(oldest) = self
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_access)
                .map(|(k, _)| k.clone())
            else {
                break;
            };
            self.entries.remove(&oldest);
            self.stats.evictions += 1;
        }
        let last_access = self.next_tick();
        self.entries.insert(
            key,
            CacheEntry {
                value,
                expires_at: now + ttl,
                last_access,
            },
        );
    }

    fn purge_expired(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| e.expires_at > now);
        let removed = before - self.entries.len();
        self.stats.expirations += removed as u64;
        removed
    }
}

/// Removes the in-flight entry if the computation task ends without
/// finishing normally (panic or abort).
struct InFlightGuard<V, E> {
    state: Arc<Mutex<CacheState<V, E>>>,
    key: Fingerprint,
    armed: bool,
}

impl<V, E> Drop for InFlightGuard<V, E> {
    fn drop(&mut self) {
        if self.armed {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.in_flight.remove(&self.key);
        }
    }
}

/// Memoizes successful computations by [`Fingerprint`].
pub struct AnalysisCache<V, E> {
    state: Arc<Mutex<CacheState<V, E>>>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
    max_entries: usize,
    retain: fn(&V) -> bool,
}

impl<V, E> AnalysisCache<V, E>
where
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + From<CacheError> + 'static,
{
    pub fn new(config: &CacheConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: &CacheConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Arc::new(Mutex::new(CacheState {
                entries: HashMap::new(),
                in_flight: HashMap::new(),
                tick: 0,
                stats: CacheStats::default(),
            })),
            clock,
            ttl: config.ttl,
            max_entries: config.max_entries.max(1),
            retain: |_| true,
        }
    }

    /// Only store values for which `retain` holds. Rejected values still
    /// reach every caller of the computation that produced them.
    pub fn retain_if(mut self, retain: fn(&V) -> bool) -> Self {
        self.retain = retain;
        self
    }

    fn lock(&self) -> MutexGuard<'_, CacheState<V, E>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Cached value, if present and not expired.
    pub fn get(&self, key: &Fingerprint) -> Option<V> {
        let now = self.clock.now();
        let mut state = self.lock();
        let tick = state.next_tick();
        let found = state.lookup(key, now).map(|entry| {
            entry.last_access = tick;
            entry.value.clone()
        });
        if found.is_some() {
            state.stats.hits += 1;
        } else {
            state.stats.misses += 1;
        }
        found
    }

    /// Return the cached value for `key`, join a computation already running
    /// for it, or start `compute`.
    ///
    /// `compute` is invoked under the cache lock and must only build the
    /// future; the work itself runs on a spawned task.
    pub async fn get_or_compute<F, Fut>(&self, key: Fingerprint, compute: F) -> Result<(V, CacheSource), E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        let (shared, source) = {
            let now = self.clock.now();
            let mut state = self.lock();
            let tick = state.next_tick();

            if let Some(entry) = state.lookup(&key, now) {
                entry.last_access = tick;
                let value = entry.value.clone();
                state.stats.hits += 1;
                return Ok((value, CacheSource::Hit));
            }

            if let Some(existing) = state.in_flight.get(&key) {
                let shared = existing.clone();
                state.stats.coalesced += 1;
                debug!(fingerprint = %key, "Joining in-flight computation");
                (shared, CacheSource::Joined)
            } else {
                state.stats.misses += 1;
                let shared = self.spawn_compute(key.clone(), compute());
                state.in_flight.insert(key.clone(), shared.clone());
                (shared, CacheSource::Computed)
            }
        };

        shared.await.map(|value| (value, source))
    }

    fn spawn_compute<Fut>(&self, key: Fingerprint, fut: Fut) -> SharedCompute<V, E>
    where
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        let state = Arc::clone(&self.state);
        let clock = Arc::clone(&self.clock);
        let ttl = self.ttl;
        let max_entries = self.max_entries;
        let retain = self.retain;

        let handle = tokio::spawn(async move {
            let mut guard = InFlightGuard {
                state: Arc::clone(&state),
                key: key.clone(),
                armed: true,
            };
            let result = fut.await;

            let mut locked = state.lock().unwrap_or_else(PoisonError::into_inner);
            locked.in_flight.remove(&key);
            if let Ok(ref value) = result
                && retain(value)
            {
                locked.insert(key, value.clone(), clock.now(), ttl, max_entries);
                locked.stats.size = locked.entries.len();
            }
            drop(locked);
            guard.armed = false;
            result
        });

        async move {
            match handle.await {
                Ok(result) => result,
                Err(join_err) => {
                    warn!(error = %join_err, "Cached computation did not complete");
                    Err(E::from(CacheError::Aborted(join_err.to_string())))
                }
            }
        }
        .boxed()
        .shared()
    }

    /// Drop `key`. In-flight computations are unaffected.
    pub fn invalidate(&self, key: &Fingerprint) -> bool {
        self.lock().entries.remove(key).is_some()
    }

    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        self.lock().purge_expired(now)
    }

    pub fn clear(&self) {
        self.lock().entries.clear();
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn in_flight(&self) -> usize {
        self.lock().in_flight.len()
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.lock();
        CacheStats {
            size: state.entries.len(),
            ..state.stats
        }
    }
}
