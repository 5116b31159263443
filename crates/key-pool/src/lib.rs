//! Cooldown-enforcing rotation pool for interchangeable API keys
//!
//! Holds a fixed, ordered set of key identifiers and hands out one at a time.
//! Each hand-out starts a cooldown for that key; a key is only handed out again
//! once the cooldown has fully elapsed. Among the keys that are eligible, the
//! one idle the longest wins, with ties going to construction order.
//!
//! Key lifecycle:
//! 1. Pool constructed with ids and a cooldown → every key eligible
//! 2. `acquire()` picks the least-recently-used eligible key and stamps it
//! 3. Stamped key is skipped until `cooldown` has elapsed since the stamp
//! 4. No key eligible → `Error::Exhausted` with a retry hint; the pool never waits
//!
//! Callers never return a key. The cooldown clock starts at hand-out.

pub mod clock;
pub mod error;
pub mod pool;

pub use clock::{Clock, ManualClock, MonotonicClock};
pub use error::{Error, Result};
pub use pool::{KeyStatus, Pool, ceil_secs};
