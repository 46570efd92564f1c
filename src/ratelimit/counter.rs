//! In-memory counter store.
//!
//! Counters live in a `DashMap`, so every operation on a key runs under that
//! key's shard lock and increments never race. Time is read from
//! `tokio::time::Instant`, which lets tests pause and advance the clock.
//!
//! Expired counters are dropped lazily when their key is hit again, and
//! swept from the whole map every `sweep_every` writes so keys that never
//! return do not accumulate.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::backend::{
    clamp_ttl, parse_token_limits, CounterStore, Hit, KeyTtl, StoreError, TokenLimits, LIMIT_FIELD,
    TTL_FIELD,
};

/// Writes between two sweeps of expired counters.
pub const DEFAULT_SWEEP_INTERVAL: u64 = 1024;

/// Deadline for a window of `ttl` opened at `now`.
///
/// `None` only if the clamped deadline still does not fit in an `Instant`.
fn expiry_at(now: Instant, ttl: Duration) -> Option<Instant> {
    now.checked_add(clamp_ttl(ttl))
}

/// State of a single counter key.
#[derive(Debug, Default, Clone, Copy)]
struct CounterState {
    /// Hits counted in the current window
    count: u64,
    /// When the key is deleted; `None` means it never expires
    expires_at: Option<Instant>,
}

impl CounterState {
    fn is_expired(&self, now: Instant) -> bool {
        matches!(self.expires_at, Some(at) if at <= now)
    }

    fn remaining(&self, now: Instant) -> KeyTtl {
        match self.expires_at {
            None => KeyTtl::Persistent,
            Some(at) => KeyTtl::Expires(at.saturating_duration_since(now)),
        }
    }
}

/// A process-local [`CounterStore`].
///
/// Suitable for tests and single-instance deployments. Override records are
/// kept as raw string fields, mirroring how a remote hash store holds them.
#[derive(Debug)]
pub struct MemoryStore {
    /// Counters indexed by counter key
    counters: DashMap<String, CounterState>,
    /// Override records indexed by token (field -> raw value)
    overrides: RwLock<HashMap<String, HashMap<String, String>>>,
    /// Counter writes since creation
    writes: AtomicU64,
    /// Sweep expired counters every this many writes; 0 disables sweeping
    sweep_every: u64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self {
            counters: DashMap::new(),
            overrides: RwLock::new(HashMap::new()),
            writes: AtomicU64::new(0),
            sweep_every: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty store that sweeps expired counters every `writes`
    /// counter writes. `0` turns the sweep off.
    pub fn with_sweep_interval(writes: u64) -> Self {
        Self {
            sweep_every: writes,
            ..Self::default()
        }
    }

    /// Remove every expired counter. Returns how many were removed.
    pub fn cleanup(&self) -> usize {
        let now = Instant::now();
        let before = self.counters.len();
        self.counters.retain(|_, state| !state.is_expired(now));
        let removed = before.saturating_sub(self.counters.len());
        if removed > 0 {
            debug!(removed, "Swept expired counters");
        }
        removed
    }

    /// Count a write and sweep when the interval is reached.
    ///
    /// Must be called with no map guard held; `retain` locks every shard.
    fn note_write(&self) {
        if self.sweep_every == 0 {
            return;
        }
        let writes = self.writes.fetch_add(1, Ordering::Relaxed) + 1;
        if writes % self.sweep_every == 0 {
            self.cleanup();
        }
    }

    /// Write a single raw field of a token's override record.
    pub fn set_token_field(&self, token: &str, field: &str, value: impl Into<String>) {
        self.overrides
            .write()
            .entry(token.to_string())
            .or_default()
            .insert(field.to_string(), value.into());
    }

    /// Get the current count for a key, ignoring expired state.
    pub fn current_count(&self, key: &str) -> Option<u64> {
        let now = Instant::now();
        self.counters
            .get(key)
            .filter(|state| !state.is_expired(now))
            .map(|state| state.count)
    }

    /// Get the number of live counters.
    pub fn counter_count(&self) -> usize {
        self.cleanup();
        self.counters.len()
    }

    /// Clear all counters.
    pub fn clear(&self) {
        self.counters.clear();
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn increment(&self, key: &str) -> Result<u64, StoreError> {
        let now = Instant::now();
        let count = {
            let mut state = self.counters.entry(key.to_string()).or_default();
            if state.is_expired(now) {
                *state = CounterState::default();
            }
            state.count += 1;
            state.count
        };
        self.note_write();
        Ok(count)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        let now = Instant::now();
        if let Some(mut state) = self.counters.get_mut(key) {
            if !state.is_expired(now) {
                state.expires_at = expiry_at(now, ttl);
            }
        }
        Ok(())
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl, StoreError> {
        let now = Instant::now();
        self.counters.remove_if(key, |_, state| state.is_expired(now));
        Ok(self
            .counters
            .get(key)
            .map_or(KeyTtl::Missing, |state| state.remaining(now)))
    }

    async fn reset(&self, key: &str) -> Result<(), StoreError> {
        self.counters.remove(key);
        Ok(())
    }

    async fn get_token_limits(&self, token: &str) -> Result<TokenLimits, StoreError> {
        let overrides = self.overrides.read();
        let record = overrides.get(token);
        let field = |name: &str| record.and_then(|r| r.get(name)).map(String::as_str);
        parse_token_limits(token, field(LIMIT_FIELD), field(TTL_FIELD))
    }

    async fn put_token_limits(&self, token: &str, limits: TokenLimits) -> Result<(), StoreError> {
        self.set_token_field(token, LIMIT_FIELD, limits.limit.to_string());
        self.set_token_field(token, TTL_FIELD, limits.ttl_secs.to_string());
        Ok(())
    }

    async fn increment_with_expiry(&self, key: &str, ttl: Duration) -> Result<Hit, StoreError> {
        let now = Instant::now();
        let count = {
            let mut state = self.counters.entry(key.to_string()).or_default();
            if state.is_expired(now) {
                *state = CounterState::default();
            }
            state.count += 1;

            // A counter without an expiry would never reset; attach one even
            // when this is not the first hit.
            if state.count == 1 || state.expires_at.is_none() {
                trace!(key = %key, ttl = ?ttl, "Opening counter window");
                state.expires_at = expiry_at(now, ttl);
            }
            state.count
        };
        self.note_write();
        Ok(Hit::counted(count))
    }
}
