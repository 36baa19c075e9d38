//! Signed seconds + nanoseconds arithmetic used throughout the protocol engine.
//!
//! `TimeInternal` mirrors the 32-bit field widths carried on the wire. Values are
//! kept sign-consistent: after `normalize`, seconds and nanoseconds never have
//! opposite signs and `|nanoseconds| < 1e9`. Arithmetic wraps at the i32 range
//! without checks; callers never hold spans anywhere near 68 years.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::ops::{Add, Neg, Sub};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub const NANOS_PER_SEC: i32 = 1_000_000_000;
const NANOS_PER_SEC_I64: i64 = 1_000_000_000;

/// Largest seconds value representable in the 48-bit wire field.
const WIRE_SECONDS_MAX: u64 = (1 << 48) - 1;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeInternal {
    pub seconds: i32,
    pub nanoseconds: i32,
}

/// Unsigned wire timestamp (48-bit seconds, 32-bit nanoseconds).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Timestamp {
    pub seconds: u64,
    pub nanoseconds: u32,
}

impl TimeInternal {
    pub const ZERO: TimeInternal = TimeInternal { seconds: 0, nanoseconds: 0 };

    pub fn new(seconds: i32, nanoseconds: i32) -> Self {
        TimeInternal { seconds, nanoseconds }.normalize()
    }

    pub fn from_nanos(ns: i64) -> Self {
        TimeInternal {
            seconds: (ns / NANOS_PER_SEC_I64) as i32,
            nanoseconds: (ns % NANOS_PER_SEC_I64) as i32,
        }
    }

    pub fn to_nanos(&self) -> i64 {
        self.seconds as i64 * NANOS_PER_SEC_I64 + self.nanoseconds as i64
    }

    pub fn as_secs_f64(&self) -> f64 {
        self.seconds as f64 + self.nanoseconds as f64 / 1e9
    }

    /// Carry nanoseconds into seconds and make both fields share a sign.
    pub fn normalize(self) -> Self {
        let mut seconds = self.seconds.wrapping_add(self.nanoseconds / NANOS_PER_SEC);
        let mut nanoseconds = self.nanoseconds % NANOS_PER_SEC;

        if seconds > 0 && nanoseconds < 0 {
            seconds -= 1;
            nanoseconds += NANOS_PER_SEC;
        } else if seconds < 0 && nanoseconds > 0 {
            seconds += 1;
            nanoseconds -= NANOS_PER_SEC;
        }

        TimeInternal { seconds, nanoseconds }
    }

    pub fn add(self, other: TimeInternal) -> Self {
        TimeInternal {
            seconds: self.seconds.wrapping_add(other.seconds),
            nanoseconds: self.nanoseconds.wrapping_add(other.nanoseconds),
        }
        .normalize()
    }

    pub fn sub(self, other: TimeInternal) -> Self {
        TimeInternal {
            seconds: self.seconds.wrapping_sub(other.seconds),
            nanoseconds: self.nanoseconds.wrapping_sub(other.nanoseconds),
        }
        .normalize()
    }

    /// Halve the value, rounding nanoseconds toward zero.
    pub fn div2(self) -> Self {
        let t = self.normalize();
        TimeInternal {
            seconds: t.seconds / 2,
            nanoseconds: (t.nanoseconds + (t.seconds % 2) * NANOS_PER_SEC) / 2,
        }
        .normalize()
    }

    pub fn abs(self) -> Self {
        let t = self.normalize();
        TimeInternal {
            seconds: t.seconds.wrapping_abs(),
            nanoseconds: t.nanoseconds.wrapping_abs(),
        }
    }

    pub fn is_negative(&self) -> bool {
        let t = self.normalize();
        t.seconds < 0 || (t.seconds == 0 && t.nanoseconds < 0)
    }

    pub fn is_zero(&self) -> bool {
        self.seconds == 0 && self.nanoseconds == 0
    }

    pub fn gt(&self, other: &TimeInternal) -> bool {
        self.cmp(other) == Ordering::Greater
    }

    pub fn is_close(&self, other: &TimeInternal, tolerance_ns: i64) -> bool {
        (self.to_nanos() - other.to_nanos()).abs() <= tolerance_ns
    }

    /// Wire timestamps are unsigned; negative values saturate to zero.
    pub fn to_wire(&self) -> Timestamp {
        let t = self.normalize();
        if t.is_negative() {
            return Timestamp::default();
        }
        Timestamp {
            seconds: t.seconds as u64,
            nanoseconds: t.nanoseconds as u32,
        }
    }

    /// Wire seconds above the i32 range saturate at `i32::MAX`.
    pub fn from_wire(ts: &Timestamp) -> Self {
        let seconds = ts.seconds.min(i32::MAX as u64) as i32;
        let nanoseconds = ts.nanoseconds.min(i32::MAX as u32) as i32;
        TimeInternal { seconds, nanoseconds }.normalize()
    }

    /// correctionField is nanoseconds scaled by 2^16.
    pub fn from_correction(scaled_ns: i64) -> Self {
        Self::from_nanos(scaled_ns >> 16)
    }

    pub fn to_correction(&self) -> i64 {
        self.to_nanos().saturating_mul(1 << 16)
    }

    pub fn from_system_time(t: SystemTime) -> Self {
        match t.duration_since(UNIX_EPOCH) {
            Ok(d) => d.into(),
            Err(e) => -TimeInternal::from(e.duration()),
        }
    }

    /// Interval of `2^log_interval` seconds, as used by the message interval fields.
    pub fn from_log_interval(log_interval: i8) -> Self {
        TimeInternal::from_nanos((2f64.powi(log_interval as i32) * 1e9) as i64)
    }
}

impl From<Duration> for TimeInternal {
    fn from(d: Duration) -> Self {
        TimeInternal {
            seconds: d.as_secs() as i32,
            nanoseconds: d.subsec_nanos() as i32,
        }
    }
}

impl Timestamp {
    pub fn new(seconds: u64, nanoseconds: u32) -> Self {
        Timestamp {
            seconds: seconds.min(WIRE_SECONDS_MAX),
            nanoseconds,
        }
    }
}

impl Ord for TimeInternal {
    fn cmp(&self, other: &Self) -> Ordering {
        self.to_nanos().cmp(&other.to_nanos())
    }
}

impl PartialOrd for TimeInternal {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Add for TimeInternal {
    type Output = TimeInternal;
    fn add(self, rhs: TimeInternal) -> TimeInternal {
        TimeInternal::add(self, rhs)
    }
}

impl Sub for TimeInternal {
    type Output = TimeInternal;
    fn sub(self, rhs: TimeInternal) -> TimeInternal {
        TimeInternal::sub(self, rhs)
    }
}

impl Neg for TimeInternal {
    type Output = TimeInternal;
    fn neg(self) -> TimeInternal {
        TimeInternal {
            seconds: self.seconds.wrapping_neg(),
            nanoseconds: self.nanoseconds.wrapping_neg(),
        }
        .normalize()
    }
}

impl fmt::Display for TimeInternal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let t = self.normalize();
        let sign = if t.is_negative() { "-" } else { "" };
        write!(f, "{}{}.{:09}", sign, t.seconds.unsigned_abs(), t.nanoseconds.unsigned_abs())
    }
}
