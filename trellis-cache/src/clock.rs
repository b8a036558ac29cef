//! Time sources.
//!
//! Wall time stamps entry expiry; monotonic time orders transaction starts
//! against local invalidations.

use std::fmt;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;
use trellis_core::Timestamp;

/// Source of wall and monotonic time.
pub trait Clock: Send + Sync {
    /// Current wall time.
    fn now(&self) -> Timestamp;

    /// Current monotonic time.
    fn monotonic(&self) -> Instant;
}

/// The operating system clocks.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Utc::now()
    }

    fn monotonic(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when told to.
///
/// `advance` moves both readings together. `set_now` moves the wall reading
/// alone, which is how tests model clock skew between database sessions.
pub struct ManualClock {
    state: Mutex<ManualState>,
}

struct ManualState {
    wall: Timestamp,
    monotonic: Instant,
}

impl ManualClock {
    /// Start at the current system time.
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    /// Start at the given wall time.
    pub fn starting_at(wall: Timestamp) -> Self {
        Self {
            state: Mutex::new(ManualState {
                wall,
                monotonic: Instant::now(),
            }),
        }
    }

    /// Move both clocks forward.
    pub fn advance(&self, by: Duration) {
        let mut state = self.state.lock();
        state.monotonic += by;
        if let Ok(delta) = chrono::Duration::from_std(by) {
            if let Some(wall) = state.wall.checked_add_signed(delta) {
                state.wall = wall;
            }
        }
    }

    /// Set the wall clock, leaving the monotonic clock where it is.
    pub fn set_now(&self, wall: Timestamp) {
        self.state.lock().wall = wall;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        self.state.lock().wall
    }

    fn monotonic(&self) -> Instant {
        self.state.lock().monotonic
    }
}

impl fmt::Debug for ManualClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ManualClock")
            .field("wall", &state.wall)
            .field("monotonic", &state.monotonic)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_stands_still() {
        let clock = ManualClock::new();
        let (wall, mono) = (clock.now(), clock.monotonic());
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(clock.now(), wall);
        assert_eq!(clock.monotonic(), mono);
    }

    #[test]
    fn test_manual_clock_advance_moves_both() {
        let clock = ManualClock::new();
        let (wall, mono) = (clock.now(), clock.monotonic());
        clock.advance(Duration::from_secs(90));
        assert_eq!(clock.now() - wall, chrono::Duration::seconds(90));
        assert_eq!(clock.monotonic() - mono, Duration::from_secs(90));
    }

    #[test]
    fn test_set_now_only_moves_wall_time() {
        let clock = ManualClock::new();
        let mono = clock.monotonic();
        let earlier = clock.now() - chrono::Duration::hours(1);
        clock.set_now(earlier);
        assert_eq!(clock.now(), earlier);
        assert_eq!(clock.monotonic(), mono);
    }

    #[test]
    fn test_system_clock_is_monotonic() {
        let clock = SystemClock;
        let a = clock.monotonic();
        let b = clock.monotonic();
        assert!(b >= a);
    }
}
