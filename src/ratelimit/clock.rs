//! Wall-clock time source for admission windows.

use std::fmt::Debug;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::warn;

/// How far the anchored reading may fall behind the system clock before
/// [`SystemClock`] re-anchors.
pub const MAX_CLOCK_LAG: Duration = Duration::from_secs(2);

/// Port for obtaining the current wall-clock time.
pub trait Clock: Send + Sync + Debug {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy)]
struct Anchor {
    wall: DateTime<Utc>,
    instant: Instant,
}

/// Wall clock anchored to Tokio's monotonic clock.
///
/// The wall time is read once at construction and then advanced by
/// monotonic elapsed time, so pausing or advancing Tokio's clock moves
/// this clock too.
///
/// The monotonic clock stops while the host is suspended. A clock built
/// with [`SystemClock::new`] therefore re-anchors to the system time once
/// its reading lags behind by more than [`MAX_CLOCK_LAG`]. A clock built
/// with [`SystemClock::starting_at`] never re-anchors.
#[derive(Debug)]
pub struct SystemClock {
    anchor: Mutex<Anchor>,
    follows_system: bool,
}

impl SystemClock {
    /// Create a clock reading the current wall time.
    pub fn new() -> Self {
        Self::anchored(Utc::now(), true)
    }

    /// Create a clock that reads `wall` right now and advances from there.
    pub fn starting_at(wall: DateTime<Utc>) -> Self {
        Self::anchored(wall, false)
    }

    fn anchored(wall: DateTime<Utc>, follows_system: bool) -> Self {
        Self {
            anchor: Mutex::new(Anchor {
                wall,
                instant: Instant::now(),
            }),
            follows_system,
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        let mut anchor = self.anchor.lock();
        let elapsed = chrono::Duration::from_std(anchor.instant.elapsed())
            .unwrap_or_else(|_| chrono::Duration::zero());
        let anchored = anchor.wall + elapsed;
        if !self.follows_system {
            return anchored;
        }

        // paused test time only ever runs ahead of the system clock
        let system = Utc::now();
        let lag = (system - anchored).to_std().unwrap_or_default();
        if lag > MAX_CLOCK_LAG {
            warn!(lag = ?lag, "Wall clock fell behind system time, re-anchoring");
            *anchor = Anchor {
                wall: system,
                instant: Instant::now(),
            };
            return system;
        }
        anchored
    }
}
