//! 32.32 fixed-point monotonic time.
//!
//! The top 32 bits are whole seconds, the bottom 32 bits are a fraction of a
//! second. Comparisons must never use ordering operators directly —
//! only differences — so that wraparound near the 63-bit boundary stays
//! safe. [`MonoTime::is_after`]/[`MonoTime::is_before`] and subtraction are
//! the only sanctioned comparisons.

use std::time::Duration;

/// A monotonic timestamp, seconds in the high 32 bits and a fraction of a
/// second in the low 32 bits. Zero is a sentinel for "unset";
/// [`MonoTime::bump_if_zero`] exists to turn a genuine zero into `1` so it
/// stops meaning "unset".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MonoTime(pub i64);

impl MonoTime {
    pub const ZERO: MonoTime = MonoTime(0);

    /// Read the current value of `CLOCK_MONOTONIC`.
    pub fn now() -> MonoTime {
        let ts = nix::time::clock_gettime(nix::time::ClockId::CLOCK_MONOTONIC)
            .unwrap_or_else(|_| nix::sys::time::TimeSpec::new(0, 0));
        let secs = ts.tv_sec() as u64;
        let nanos = ts.tv_nsec() as u64;
        let frac = ((nanos << 32) / 1_000_000_000) & 0xFFFF_FFFF;
        MonoTime(((secs << 32) | frac) as i64)
    }

    pub fn from_secs(secs: i64) -> MonoTime {
        MonoTime(secs << 32)
    }

    /// Difference `self - other`, safe across wraparound because it is a
    /// plain wrapping subtraction, never an ordered comparison.
    pub fn diff(self, other: MonoTime) -> i64 {
        self.0.wrapping_sub(other.0)
    }

    pub fn is_after(self, other: MonoTime) -> bool {
        self.diff(other) > 0
    }

    pub fn is_before(self, other: MonoTime) -> bool {
        self.diff(other) < 0
    }

    pub fn add(self, delta: MonoTime) -> MonoTime {
        MonoTime(self.0.wrapping_add(delta.0))
    }

    pub fn add_secs(self, secs: i64) -> MonoTime {
        self.add(MonoTime::from_secs(secs))
    }

    /// Bump a genuinely-zero timestamp to `1` ("Zero is a
    /// sentinel meaning unset; implementations must bump any genuinely-zero
    /// timestamp to 1").
    pub fn bump_if_zero(self) -> MonoTime {
        if self.0 == 0 { MonoTime(1) } else { self }
    }

    pub fn is_unset(self) -> bool {
        self.0 == 0
    }

    /// Convert a (non-negative) difference into a `Duration`, for passing to
    /// the selector as a timeout.
    pub fn diff_as_duration(self, other: MonoTime) -> Duration {
        let d = self.diff(other);
        if d <= 0 {
            return Duration::ZERO;
        }
        let secs = (d as u64) >> 32;
        let frac = (d as u64) & 0xFFFF_FFFF;
        let nanos = (frac * 1_000_000_000) >> 32;
        Duration::new(secs, nanos as u32)
    }
}

impl std::fmt::Display for MonoTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let secs = (self.0 as u64) >> 32;
        write!(f, "{secs}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diff_survives_wraparound() {
        let near_wrap = MonoTime(i64::MAX - 10);
        let after_wrap = MonoTime(near_wrap.0.wrapping_add(20));
        // a naive `after_wrap.0 > near_wrap.0` would be false here because
        // wrapping_add overflowed past i64::MAX into negative territory.
        assert!(after_wrap.0 < near_wrap.0);
        // but the sanctioned diff-based comparison still sees it as "after".
        assert!(after_wrap.is_after(near_wrap));
        assert_eq!(after_wrap.diff(near_wrap), 20);
    }

    #[test]
    fn bump_if_zero_only_touches_zero() {
        assert_eq!(MonoTime(0).bump_if_zero(), MonoTime(1));
        assert_eq!(MonoTime(5).bump_if_zero(), MonoTime(5));
    }

    #[test]
    fn add_secs_matches_from_secs() {
        let t = MonoTime::from_secs(10);
        assert_eq!(t.add_secs(5), MonoTime::from_secs(15));
    }
}
