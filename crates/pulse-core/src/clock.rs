//! Millisecond time sources.
//!
//! All scheduling math runs on monotonic milliseconds; wall-clock stamps only
//! appear on samples and events for display. On Linux the monotonic source is
//! `CLOCK_MONOTONIC` via `clock_gettime`; elsewhere an `Instant`-based
//! fallback is used.

use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::time::{SystemTime, UNIX_EPOCH};

/// A source of monotonic and wall-clock time in milliseconds.
pub trait Clock: Send + Sync {
    /// Monotonic milliseconds from an arbitrary epoch. Never goes backwards.
    fn monotonic_ms(&self) -> u64;
    /// Wall-clock milliseconds since the Unix epoch.
    fn wall_ms(&self) -> u64;
}

/// The host OS clock.
pub struct SystemClock;

impl Clock for SystemClock {
    #[inline]
    fn monotonic_ms(&self) -> u64 {
        #[cfg(target_os = "linux")]
        {
            let mut ts = libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            };
            unsafe {
                libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
            }
            (ts.tv_sec as u64) * 1_000 + (ts.tv_nsec as u64) / 1_000_000
        }
        #[cfg(not(target_os = "linux"))]
        {
            use std::time::Instant;
            static EPOCH: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
            let epoch = EPOCH.get_or_init(Instant::now);
            epoch.elapsed().as_millis() as u64
        }
    }

    fn wall_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }
}

/// A manually advanced clock for deterministic tests and simulations.
///
/// Both axes start at zero; `advance` moves them in lockstep so wall stamps
/// stay correlated with monotonic scheduling time.
#[derive(Default)]
pub struct ManualClock {
    monotonic: AtomicU64,
    wall: AtomicU64,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts the wall axis at `wall_ms` while monotonic stays at zero.
    pub fn starting_at(wall_ms: u64) -> Self {
        Self {
            monotonic: AtomicU64::new(0),
            wall: AtomicU64::new(wall_ms),
        }
    }

    pub fn advance(&self, ms: u64) {
        self.monotonic.fetch_add(ms, Relaxed);
        self.wall.fetch_add(ms, Relaxed);
    }
}

impl Clock for ManualClock {
    fn monotonic_ms(&self) -> u64 {
        self.monotonic.load(Relaxed)
    }

    fn wall_ms(&self) -> u64 {
        self.wall.load(Relaxed)
    }
}
