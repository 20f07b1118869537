//! Fixed-precision time.
//!
//! Every timestamp and duration in the daemon is a [`CdTime`]: an unsigned
//! 64-bit count of 2^-30 second ticks. The upper 34 bits hold whole seconds,
//! the lower 30 bits the fraction, which gives slightly better than
//! nanosecond resolution with cheap shift-based conversions.

use std::fmt::{self, Display, Formatter};
use std::ops::{Add, AddAssign, Div, Mul, Sub};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// SECTION 1: CDTIME
// ============================================================================

/// Number of fractional bits in a [`CdTime`].
pub const CDTIME_FRACTION_BITS: u32 = 30;

const FRACTION_MASK: u64 = (1 << CDTIME_FRACTION_BITS) - 1;
const TICKS_PER_SECOND: f64 = (1u64 << CDTIME_FRACTION_BITS) as f64;

/// Time or duration in units of 2^-30 seconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
#[repr(transparent)]
pub struct CdTime(u64);

impl CdTime {
    pub const ZERO: CdTime = CdTime(0);
    pub const MAX: CdTime = CdTime(u64::MAX);

    /// Wrap a raw tick count.
    #[inline]
    pub const fn from_raw(ticks: u64) -> Self {
        Self(ticks)
    }

    #[inline]
    pub const fn as_raw(&self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn from_secs(secs: u64) -> Self {
        Self(secs << CDTIME_FRACTION_BITS)
    }

    /// Convert from fractional seconds. Negative and NaN inputs clamp to zero.
    pub fn from_secs_f64(secs: f64) -> Self {
        if !(secs > 0.0) {
            return Self::ZERO;
        }
        Self((secs * TICKS_PER_SECOND).round() as u64)
    }

    /// Convert from milliseconds, rounding the fraction to the nearest tick.
    pub const fn from_millis(ms: u64) -> Self {
        let whole = (ms / 1000) << CDTIME_FRACTION_BITS;
        let frac = (((ms % 1000) << CDTIME_FRACTION_BITS) + 500) / 1000;
        Self(whole | frac)
    }

    pub const fn from_nanos(ns: u64) -> Self {
        let whole = (ns / 1_000_000_000) << CDTIME_FRACTION_BITS;
        let frac = (((ns % 1_000_000_000) << CDTIME_FRACTION_BITS) + 500_000_000) / 1_000_000_000;
        Self(whole | frac)
    }

    pub fn from_duration(d: Duration) -> Self {
        let whole = d.as_secs() << CDTIME_FRACTION_BITS;
        let nanos = d.subsec_nanos() as u64;
        let frac = ((nanos << CDTIME_FRACTION_BITS) + 500_000_000) / 1_000_000_000;
        Self(whole | frac)
    }

    /// Current wall-clock time.
    pub fn now() -> Self {
        let since_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self::from_duration(since_epoch)
    }

    #[inline]
    pub const fn whole_secs(&self) -> u64 {
        self.0 >> CDTIME_FRACTION_BITS
    }

    #[inline]
    pub fn as_secs_f64(&self) -> f64 {
        self.0 as f64 / TICKS_PER_SECOND
    }

    pub const fn as_millis(&self) -> u64 {
        let whole = (self.0 >> CDTIME_FRACTION_BITS) * 1000;
        let frac = ((self.0 & FRACTION_MASK) * 1000 + (1 << (CDTIME_FRACTION_BITS - 1)))
            >> CDTIME_FRACTION_BITS;
        whole + frac
    }

    pub const fn as_nanos(&self) -> u64 {
        let whole = (self.0 >> CDTIME_FRACTION_BITS) * 1_000_000_000;
        let frac = ((self.0 & FRACTION_MASK) * 1_000_000_000 + (1 << (CDTIME_FRACTION_BITS - 1)))
            >> CDTIME_FRACTION_BITS;
        whole + frac
    }

    pub fn as_duration(&self) -> Duration {
        Duration::from_nanos(self.as_nanos())
    }

    #[inline]
    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn saturating_sub(self, rhs: CdTime) -> CdTime {
        CdTime(self.0.saturating_sub(rhs.0))
    }

    #[inline]
    pub fn checked_sub(self, rhs: CdTime) -> Option<CdTime> {
        self.0.checked_sub(rhs.0).map(CdTime)
    }

    #[inline]
    pub fn saturating_mul(self, factor: u64) -> CdTime {
        CdTime(self.0.saturating_mul(factor))
    }

    /// Smallest multiple of `interval` strictly greater than `self`.
    pub fn next_multiple_of(self, interval: CdTime) -> CdTime {
        if interval.is_zero() {
            return self;
        }
        CdTime((self.0 / interval.0).saturating_add(1).saturating_mul(interval.0))
    }

    /// Wall-clock time as a UTC date.
    pub fn to_datetime(&self) -> DateTime<Utc> {
        let nanos = self.as_nanos();
        Utc.timestamp_opt((nanos / 1_000_000_000) as i64, (nanos % 1_000_000_000) as u32)
            .single()
            .unwrap_or_default()
    }

    /// RFC 3339 with second precision.
    pub fn to_rfc3339(&self) -> String {
        self.to_datetime().to_rfc3339_opts(SecondsFormat::Secs, true)
    }

    /// RFC 3339 with nanosecond precision.
    pub fn to_rfc3339_nanos(&self) -> String {
        self.to_datetime().to_rfc3339_opts(SecondsFormat::Nanos, true)
    }
}

impl Display for CdTime {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:.3}", self.as_secs_f64())
    }
}

impl From<Duration> for CdTime {
    fn from(d: Duration) -> Self {
        CdTime::from_duration(d)
    }
}

impl From<CdTime> for Duration {
    fn from(t: CdTime) -> Self {
        t.as_duration()
    }
}

impl Add for CdTime {
    type Output = CdTime;

    fn add(self, rhs: CdTime) -> CdTime {
        CdTime(self.0.saturating_add(rhs.0))
    }
}

impl AddAssign for CdTime {
    fn add_assign(&mut self, rhs: CdTime) {
        self.0 = self.0.saturating_add(rhs.0);
    }
}

impl Sub for CdTime {
    type Output = CdTime;

    fn sub(self, rhs: CdTime) -> CdTime {
        self.saturating_sub(rhs)
    }
}

impl Mul<u64> for CdTime {
    type Output = CdTime;

    fn mul(self, rhs: u64) -> CdTime {
        self.saturating_mul(rhs)
    }
}

impl Mul<f64> for CdTime {
    type Output = CdTime;

    fn mul(self, rhs: f64) -> CdTime {
        CdTime::from_secs_f64(self.as_secs_f64() * rhs)
    }
}

impl Div<u64> for CdTime {
    type Output = CdTime;

    fn div(self, rhs: u64) -> CdTime {
        CdTime(self.0.checked_div(rhs).unwrap_or(0))
    }
}

// ============================================================================
// SECTION 2: TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_conversions() {
        let t = CdTime::from_secs(10);
        assert_eq!(t.as_raw(), 10 << 30);
        assert_eq!(t.whole_secs(), 10);
        assert_eq!(t.as_secs_f64(), 10.0);
        assert_eq!(CdTime::from_secs_f64(10.0), t);
        assert_eq!(CdTime::from_secs_f64(-3.0), CdTime::ZERO);
        assert_eq!(CdTime::from_secs_f64(f64::NAN), CdTime::ZERO);
    }

    #[test]
    fn test_millis_round_trip() {
        for ms in [0u64, 1, 999, 1000, 1500, 10_250, 86_400_000] {
            assert_eq!(CdTime::from_millis(ms).as_millis(), ms);
        }
    }

    #[test]
    fn test_duration_conversion() {
        let d = Duration::from_millis(2500);
        let t = CdTime::from(d);
        assert_eq!(t.as_millis(), 2500);
        assert_eq!(t.as_duration().as_millis(), 2500);
    }

    #[test]
    fn test_half_second_is_exact() {
        assert_eq!(CdTime::from_millis(500).as_raw(), 1 << 29);
    }

    #[test]
    fn test_next_multiple_of() {
        let interval = CdTime::from_secs(10);
        assert_eq!(CdTime::from_secs(3).next_multiple_of(interval), CdTime::from_secs(10));
        assert_eq!(CdTime::from_secs(10).next_multiple_of(interval), CdTime::from_secs(20));
        assert_eq!(CdTime::from_secs(3).next_multiple_of(CdTime::ZERO), CdTime::from_secs(3));
    }

    #[test]
    fn test_rfc3339() {
        let t = CdTime::from_secs(1_700_000_000);
        assert_eq!(t.to_rfc3339(), "2023-11-14T22:13:20Z");
        assert_eq!(t.to_rfc3339_nanos(), "2023-11-14T22:13:20.000000000Z");
    }

    #[test]
    fn test_arithmetic_saturates() {
        let a = CdTime::from_secs(5);
        let b = CdTime::from_secs(7);
        assert_eq!(a - b, CdTime::ZERO);
        assert_eq!(b - a, CdTime::from_secs(2));
        assert_eq!(a * 2u64, CdTime::from_secs(10));
        assert_eq!(CdTime::MAX + a, CdTime::MAX);
        assert_eq!(a / 0, CdTime::ZERO);
    }

    #[test]
    fn test_display() {
        assert_eq!(CdTime::from_millis(1500).to_string(), "1.500");
    }
}
