//! Restart-safe coarse monotonic clock.
//!
//! The deduplication index only compares durations between events, so the
//! clock is anchored to wall time (values stay meaningful across process
//! restarts) and guarded so it never moves backwards within a process even
//! if the underlying source does.

use std::ops::{Add, Sub};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Opaque coarse time point. The default value is the `UNSET` sentinel,
/// distinguishable from anything a clock returns.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CoarseTimePoint(Duration);

impl CoarseTimePoint {
    pub const UNSET: CoarseTimePoint = CoarseTimePoint(Duration::ZERO);

    pub const fn from_micros(micros: u64) -> Self {
        CoarseTimePoint(Duration::from_micros(micros))
    }

    pub fn as_micros(&self) -> u64 {
        self.0.as_micros().min(u128::from(u64::MAX)) as u64
    }

    pub fn is_unset(&self) -> bool {
        self.0 == Duration::ZERO
    }

    /// Move backwards by `delta`, clamping at the epoch rather than
    /// underflowing. A clamped result compares below every clock value.
    pub fn saturating_sub(&self, delta: Duration) -> CoarseTimePoint {
        CoarseTimePoint(self.0.saturating_sub(delta))
    }
}

impl Add<Duration> for CoarseTimePoint {
    type Output = CoarseTimePoint;

    fn add(self, rhs: Duration) -> CoarseTimePoint {
        CoarseTimePoint(self.0 + rhs)
    }
}

impl Sub<CoarseTimePoint> for CoarseTimePoint {
    type Output = Duration;

    fn sub(self, rhs: CoarseTimePoint) -> Duration {
        self.0.saturating_sub(rhs.0)
    }
}

/// Source of coarse wall-anchored time.
pub trait TimeSource: Send + Sync {
    fn coarse_now(&self) -> CoarseTimePoint;
}

/// System wall clock source.
#[derive(Debug, Default)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn coarse_now(&self) -> CoarseTimePoint {
        let since_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        CoarseTimePoint(since_epoch)
    }
}

/// Manually advanced source for tests and simulations.
#[derive(Debug, Default)]
pub struct ManualTimeSource {
    micros: AtomicU64,
}

impl ManualTimeSource {
    pub fn new(start: Duration) -> Self {
        Self {
            micros: AtomicU64::new(start.as_micros().min(u128::from(u64::MAX)) as u64),
        }
    }

    pub fn advance(&self, delta: Duration) {
        let micros = delta.as_micros().min(u128::from(u64::MAX)) as u64;
        self.micros.fetch_add(micros, Ordering::Relaxed);
    }
}

impl TimeSource for ManualTimeSource {
    fn coarse_now(&self) -> CoarseTimePoint {
        CoarseTimePoint::from_micros(self.micros.load(Ordering::Relaxed))
    }
}

/// Monotonic clock over a [`TimeSource`]. `now` never returns `UNSET` and
/// never moves backwards: the floor only ratchets forward, even when the
/// source stalls or jumps back.
pub struct RestartSafeClock {
    source: Arc<dyn TimeSource>,
    floor_micros: AtomicU64,
}

impl RestartSafeClock {
    pub fn system() -> Self {
        Self::new(Arc::new(SystemTimeSource))
    }

    pub fn new(source: Arc<dyn TimeSource>) -> Self {
        Self {
            source,
            floor_micros: AtomicU64::new(1),
        }
    }

    pub fn now(&self) -> CoarseTimePoint {
        let raw = self.source.coarse_now().as_micros();
        let prev = self.floor_micros.fetch_max(raw, Ordering::Relaxed);
        CoarseTimePoint::from_micros(prev.max(raw))
    }
}
