//! Tick-based time source.
//!
//! Expiration instants stored in sliding headers are 100 ns ticks counted
//! from 0001-01-01T00:00:00Z, so that items stay readable by other clients
//! using the same layout. Durations use the same unit.

use std::fmt::Debug;
use std::ops::{Add, Sub};
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};

/// 100 ns ticks; either an instant or a span depending on context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Ticks(pub i64);

impl Ticks {
    pub const PER_SECOND: i64 = 10_000_000;
    pub const PER_DAY: i64 = 86_400 * Self::PER_SECOND;

    /// Ticks at the Unix epoch.
    pub const UNIX_EPOCH: Ticks = Ticks(621_355_968_000_000_000);

    pub const ZERO: Ticks = Ticks(0);
    pub const ONE_SECOND: Ticks = Ticks(Self::PER_SECOND);

    pub const fn from_secs(secs: i64) -> Self {
        Ticks(secs * Self::PER_SECOND)
    }

    /// Convert a span, saturating at `i64::MAX` ticks.
    pub fn from_duration(duration: Duration) -> Self {
        let ticks = duration.as_nanos() / 100;
        Ticks(i64::try_from(ticks).unwrap_or(i64::MAX))
    }

    /// Convert an absolute UTC instant.
    pub fn from_datetime(instant: DateTime<Utc>) -> Self {
        let secs = instant.timestamp();
        let sub = i64::from(instant.timestamp_subsec_nanos()) / 100;
        Self::UNIX_EPOCH
            .saturating_add(Ticks(secs.saturating_mul(Self::PER_SECOND)))
            .saturating_add(Ticks(sub))
    }

    pub const fn as_i64(self) -> i64 {
        self.0
    }

    pub fn saturating_add(self, other: Ticks) -> Ticks {
        Ticks(self.0.saturating_add(other.0))
    }

    /// Whole seconds, rounded up. Negative spans clamp to zero.
    pub fn ceil_secs(self) -> u64 {
        if self.0 <= 0 {
            return 0;
        }
        let secs = self.0 / Self::PER_SECOND;
        if self.0 % Self::PER_SECOND == 0 {
            secs as u64
        } else {
            secs as u64 + 1
        }
    }
}

impl Add for Ticks {
    type Output = Ticks;

    fn add(self, rhs: Ticks) -> Ticks {
        self.saturating_add(rhs)
    }
}

impl Sub for Ticks {
    type Output = Ticks;

    fn sub(self, rhs: Ticks) -> Ticks {
        Ticks(self.0.saturating_sub(rhs.0))
    }
}

/// Source of the current instant.
pub trait Clock: Send + Sync + Debug {
    fn now(&self) -> Ticks;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Ticks {
        Ticks::from_datetime(Utc::now())
    }
}

/// Clock that only moves when told to. Starts at the wall-clock time of
/// creation.
#[derive(Debug)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::starting_at(SystemClock.now())
    }

    pub fn starting_at(now: Ticks) -> Self {
        Self {
            now: AtomicI64::new(now.0),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.now
            .fetch_add(Ticks::from_duration(by).0, Ordering::SeqCst);
    }

    pub fn set(&self, now: Ticks) {
        self.now.store(now.0, Ordering::SeqCst);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Ticks {
        Ticks(self.now.load(Ordering::SeqCst))
    }
}
