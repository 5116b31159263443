//! Cooldown bookkeeping and least-recently-used key selection
//!
//! The pool owns an ordered list of key ids and, per key, the instant of its
//! last hand-out (`None` until first use). Both live side by side at the same
//! index, so the set of tracked keys can never drift from the configured ids.
//!
//! All reads and writes of the last-used table go through one `std::sync::Mutex`.
//! The critical section is pure bookkeeping: no I/O, no awaits, no sleeping.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::clock::{Clock, MonotonicClock};
use crate::error::{Error, Result};

/// Cooldown state of a single key at the time of the query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyStatus {
    pub id: String,
    /// Time until the key may be handed out again. Zero when eligible now.
    pub remaining: Duration,
    /// Whether the key has ever been handed out.
    pub used: bool,
}

impl KeyStatus {
    pub fn is_eligible(&self) -> bool {
        self.remaining.is_zero()
    }

    /// Whole seconds until eligible, rounded up, so any wait reports at least 1.
    pub fn remaining_secs(&self) -> u64 {
        ceil_secs(self.remaining)
    }
}

/// Rotation pool over a fixed set of interchangeable keys.
///
/// Construct once and share (typically as `Arc<Pool>`). `acquire` is safe to
/// call from any number of threads; each call hands out at most one key and
/// no key is handed out twice within `cooldown`.
#[derive(Debug)]
pub struct Pool<C: Clock = MonotonicClock> {
    ids: Vec<String>,
    last_used: Mutex<Vec<Option<Instant>>>,
    cooldown: Duration,
    clock: C,
}

impl Pool<MonotonicClock> {
    /// Create a pool over `ids` using the process monotonic clock.
    ///
    /// Fails with `Configuration` if `ids` is empty or contains blank or
    /// duplicate entries.
    pub fn new(ids: Vec<String>, cooldown: Duration) -> Result<Self> {
        Self::with_clock(ids, cooldown, MonotonicClock)
    }

    /// Create a pool from a signed cooldown in seconds, as read from config.
    ///
    /// Negative values are rejected with `Configuration`.
    pub fn from_secs(ids: Vec<String>, cooldown_secs: i64) -> Result<Self> {
        let secs = u64::try_from(cooldown_secs).map_err(|_| {
            Error::Configuration(format!(
                "cooldown must not be negative, got {cooldown_secs}s"
            ))
        })?;
        Self::new(ids, Duration::from_secs(secs))
    }
}

impl<C: Clock> Pool<C> {
    /// Create a pool that reads time from `clock`.
    pub fn with_clock(ids: Vec<String>, cooldown: Duration, clock: C) -> Result<Self> {
        if ids.is_empty() {
            return Err(Error::Configuration("key list is empty".into()));
        }
        for (idx, id) in ids.iter().enumerate() {
            if id.trim().is_empty() {
                return Err(Error::Configuration(format!(
                    "key id at position {idx} is blank"
                )));
            }
            if ids[..idx].contains(id) {
                return Err(Error::Configuration(format!("duplicate key id: {id}")));
            }
        }

        info!(
            keys = ids.len(),
            cooldown_secs = cooldown.as_secs_f64(),
            "key pool initialized"
        );
        let last_used = Mutex::new(vec![None; ids.len()]);
        Ok(Self {
            ids,
            last_used,
            cooldown,
            clock,
        })
    }

    /// Hand out the eligible key that has been idle the longest.
    ///
    /// A key is eligible once `cooldown` has elapsed since its last hand-out;
    /// keys never handed out are always eligible and rank ahead of used ones.
    /// Ties go to the earliest key in construction order. The chosen key is
    /// stamped with the current time before the lock is released.
    ///
    /// Returns `Exhausted` without touching any state when no key is eligible.
    pub fn acquire(&self) -> Result<String> {
        let mut last_used = self.lock();
        let now = self.clock.now();

        let selected = last_used
            .iter()
            .enumerate()
            .filter(|(_, last)| self.remaining(**last, now).is_zero())
            .min_by_key(|(_, last)| **last)
            .map(|(idx, _)| idx);

        let Some(idx) = selected else {
            let retry_after = last_used
                .iter()
                .map(|last| self.remaining(*last, now))
                .min()
                .unwrap_or_default();
            drop(last_used);

            warn!(
                keys = self.ids.len(),
                retry_after_ms = retry_after.as_millis() as u64,
                "key pool exhausted, all keys cooling down"
            );
            metrics::counter!("key_pool_acquire_total", "outcome" => "exhausted").increment(1);
            return Err(Error::Exhausted {
                total: self.ids.len(),
                retry_after,
            });
        };

        let stamp = last_used[idx].map_or(now, |prev| prev.max(now));
        last_used[idx] = Some(stamp);
        drop(last_used);

        let id = &self.ids[idx];
        debug!(key_id = %id, "key acquired");
        metrics::counter!("key_pool_acquire_total", "outcome" => "granted").increment(1);
        metrics::counter!("key_pool_grants_total", "key_id" => id.clone()).increment(1);
        Ok(id.clone())
    }

    /// Per-key cooldown status in construction order.
    pub fn status(&self) -> Vec<KeyStatus> {
        let last_used = self.lock();
        let now = self.clock.now();
        self.ids
            .iter()
            .zip(last_used.iter())
            .map(|(id, last)| KeyStatus {
                id: id.clone(),
                remaining: self.remaining(*last, now),
                used: last.is_some(),
            })
            .collect()
    }

    /// Pool health summary for the health endpoint.
    ///
    /// Status mapping: all keys eligible → healthy, some eligible → degraded,
    /// none eligible → unhealthy.
    pub fn health(&self) -> serde_json::Value {
        let statuses = self.status();
        let total = statuses.len();
        let available = statuses.iter().filter(|s| s.is_eligible()).count();

        let keys: Vec<serde_json::Value> = statuses
            .iter()
            .map(|s| {
                if s.is_eligible() {
                    serde_json::json!({ "id": s.id, "status": "available" })
                } else {
                    serde_json::json!({
                        "id": s.id,
                        "status": "cooling_down",
                        "cooldown_remaining_secs": s.remaining_secs()
                    })
                }
            })
            .collect();

        let pool_status = if available == total {
            "healthy"
        } else if available > 0 {
            "degraded"
        } else {
            "unhealthy"
        };

        serde_json::json!({
            "status": pool_status,
            "keys_total": total,
            "keys_available": available,
            "keys_cooling_down": total - available,
            "cooldown_secs": self.cooldown.as_secs(),
            "keys": keys
        })
    }

    /// Configured key ids in construction order.
    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Always false; construction rejects empty key lists.
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// Time left before a key stamped at `last` is eligible at `now`.
    fn remaining(&self, last: Option<Instant>, now: Instant) -> Duration {
        match last {
            None => Duration::ZERO,
            Some(at) => self
                .cooldown
                .saturating_sub(now.saturating_duration_since(at)),
        }
    }

    // Every write under the lock is a single slot store, so a panic elsewhere
    // cannot leave the table half-updated.
    fn lock(&self) -> MutexGuard<'_, Vec<Option<Instant>>> {
        self.last_used.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[cfg(test)]
    fn last_used_snapshot(&self) -> Vec<Option<Instant>> {
        self.lock().clone()
    }
}

/// Whole seconds in `d`, rounded up. Zero only for a zero duration.
pub fn ceil_secs(d: Duration) -> u64 {
    if d.subsec_nanos() > 0 {
        d.as_secs() + 1
    } else {
        d.as_secs()
    }
}
