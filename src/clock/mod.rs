//! Boot-time anchor for converting kernel timestamps to wall-clock time.
//!
//! Kernel events carry monotonic nanoseconds since boot. Sinks need absolute
//! timestamps, so the boot instant is estimated once (wall clock minus the
//! monotonic clock) and added to every event timestamp. The anchor is fixed
//! for the process lifetime; long-term drift handling is out of scope.

use std::time::{Duration, SystemTime};

/// Estimated boot instant of the machine.
#[derive(Debug, Clone, Copy)]
pub struct BootClock {
    anchor: SystemTime,
}

impl BootClock {
    /// Estimate the machine's boot time from the current wall and monotonic
    /// clocks.
    pub fn estimate() -> Self {
        Self {
            anchor: SystemTime::now() - Duration::from_nanos(monotonic_ns()),
        }
    }

    /// Build a clock from a known anchor. Test seam.
    pub fn from_anchor(anchor: SystemTime) -> Self {
        Self { anchor }
    }

    /// The estimated boot instant.
    pub fn anchor(&self) -> SystemTime {
        self.anchor
    }

    /// Convert a monotonic kernel timestamp to absolute wall-clock time.
    pub fn absolute(&self, timestamp_ns: u64) -> SystemTime {
        self.anchor + Duration::from_nanos(timestamp_ns)
    }
}

/// Current monotonic clock value in nanoseconds.
pub fn monotonic_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `clock_gettime(CLOCK_MONOTONIC, ...)` is thread-safe and only
    // requires a valid out-pointer.
    if unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) } == 0 {
        (ts.tv_sec as u64)
            .saturating_mul(1_000_000_000)
            .saturating_add(ts.tv_nsec as u64)
    } else {
        0
    }
}
