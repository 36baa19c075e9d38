//! Offset/delay smoothing filters and pluggable outlier rejection.
//!
//! ## Smoothing
//! - `OffsetFilter`: two-sample FIR average of offset from master.
//! - `DelayFilter`: first-order IIR on the mean path delay,
//!   `s*y[n] - (s-1)*y[n-1] = x[n]/2 + x[n-1]/2`, where the stiffness `s`
//!   ramps from 1 up to `2^stiffness` so the first samples converge quickly.
//!
//! ## Outlier rejection
//! Raw delay samples can carry scheduler or queueing spikes. An `OutlierFilter`
//! decides per sample whether it enters the pipeline at all. The MAD variant keeps
//! a rolling window and rejects samples further than `k * MAD` from the median;
//! a run of consecutive rejections is accepted as a real step change.

use log::debug;
use std::collections::VecDeque;

use crate::config::OutlierFilterConfig;
use crate::time::TimeInternal;

// ============================================================================
// SMOOTHING FILTERS
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct OffsetFilter {
    nsec_prev: i64,
    y: i64,
    primed: bool,
}

impl OffsetFilter {
    /// Sub-second offsets only; anything with a seconds part passes through and clears state.
    pub fn filter(&mut self, sample: TimeInternal) -> TimeInternal {
        if sample.seconds != 0 {
            self.reset();
            return sample;
        }
        let x = sample.nanoseconds as i64;
        if !self.primed {
            self.nsec_prev = x;
            self.primed = true;
        }
        self.y = x / 2 + self.nsec_prev / 2;
        self.nsec_prev = x;
        TimeInternal::from_nanos(self.y)
    }

    pub fn reset(&mut self) {
        *self = OffsetFilter::default();
    }
}

#[derive(Debug, Clone, Default)]
pub struct DelayFilter {
    nsec_prev: i64,
    y: i64,
    s_exp: i64,
}

impl DelayFilter {
    pub fn filter(&mut self, sample: TimeInternal, stiffness: u32) -> TimeInternal {
        if sample.seconds != 0 {
            self.reset();
            return sample;
        }
        let x = sample.nanoseconds as i64;

        // Lower the stiffness while the accumulator could overflow 32 bits
        let mut s = stiffness.min(30);
        while s > 0 && (self.y.abs() >> (31 - s)) != 0 {
            s -= 1;
        }

        if self.s_exp < 1 {
            self.s_exp = 1;
            self.nsec_prev = x;
        } else if self.s_exp < (1 << s) {
            self.s_exp += 1;
        } else if self.s_exp > (1 << s) {
            self.s_exp = 1 << s;
        }

        self.y = (self.s_exp - 1) * self.y / self.s_exp + (x / 2 + self.nsec_prev / 2) / self.s_exp;
        self.nsec_prev = x;
        TimeInternal::from_nanos(self.y)
    }

    pub fn reset(&mut self) {
        *self = DelayFilter::default();
    }

    pub fn stiffness_exponent(&self) -> i64 {
        self.s_exp
    }
}

// ============================================================================
// OUTLIER FILTERS
// ============================================================================

/// Result of offering a sample to an outlier filter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FilterResult {
    pub accepted: bool,
    pub median: f64,
    pub mad: f64,
    pub threshold: f64,
}

impl FilterResult {
    fn pass() -> Self {
        FilterResult {
            accepted: true,
            median: 0.0,
            mad: 0.0,
            threshold: f64::MAX,
        }
    }
}

pub trait OutlierFilter {
    fn accept(&mut self, sample_ns: i64) -> FilterResult;
    fn reset(&mut self);
    fn describe(&self) -> String;
    /// (samples seen, samples rejected)
    fn stats(&self) -> (u64, u64);
}

pub fn build_outlier_filter(config: &OutlierFilterConfig) -> Box<dyn OutlierFilter> {
    match *config {
        OutlierFilterConfig::None => Box::new(PassThrough::default()),
        OutlierFilterConfig::Mad { window, k, max_consecutive } => {
            Box::new(MadFilter::new(window, k, max_consecutive))
        }
    }
}

#[derive(Debug, Default)]
pub struct PassThrough {
    samples: u64,
}

impl OutlierFilter for PassThrough {
    fn accept(&mut self, _sample_ns: i64) -> FilterResult {
        self.samples += 1;
        FilterResult::pass()
    }

    fn reset(&mut self) {}

    fn describe(&self) -> String {
        "none".to_string()
    }

    fn stats(&self) -> (u64, u64) {
        (self.samples, 0)
    }
}

/// MAD floor keeps very quiet links from rejecting nanosecond-level noise.
const MIN_MAD_FLOOR_NS: f64 = 500.0;
/// Samples collected before rejection activates.
const WARMUP_SAMPLES: usize = 5;

#[derive(Debug)]
pub struct MadFilter {
    history: VecDeque<f64>,
    window_size: usize,
    k: f64,
    min_mad: f64,
    consecutive_rejects: usize,
    max_consecutive: usize,

    total_samples: u64,
    rejected: u64,
}

impl MadFilter {
    pub fn new(window_size: usize, k: f64, max_consecutive: usize) -> Self {
        let window_size = window_size.max(WARMUP_SAMPLES);
        MadFilter {
            history: VecDeque::with_capacity(window_size + 1),
            window_size,
            k,
            min_mad: MIN_MAD_FLOOR_NS,
            consecutive_rejects: 0,
            max_consecutive: max_consecutive.max(1),
            total_samples: 0,
            rejected: 0,
        }
    }

    fn median(sorted: &[f64]) -> f64 {
        sorted[sorted.len() / 2]
    }
}

impl OutlierFilter for MadFilter {
    fn accept(&mut self, sample_ns: i64) -> FilterResult {
        let sample = sample_ns as f64;
        self.total_samples += 1;

        self.history.push_back(sample);
        if self.history.len() > self.window_size {
            self.history.pop_front();
        }

        if self.history.len() < WARMUP_SAMPLES {
            return FilterResult::pass();
        }

        let mut sorted: Vec<f64> = self.history.iter().cloned().collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let median = Self::median(&sorted);

        let mut deviations: Vec<f64> = sorted.iter().map(|&x| (x - median).abs()).collect();
        deviations.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let mad = Self::median(&deviations);

        let threshold = self.k * mad.max(self.min_mad);
        let deviation = (sample - median).abs();

        let accepted = if deviation > threshold {
            self.consecutive_rejects += 1;
            if self.consecutive_rejects >= self.max_consecutive {
                debug!(
                    "[Filter] Accepting step change after {} consecutive outliers: {}ns",
                    self.consecutive_rejects, sample_ns
                );
                self.consecutive_rejects = 0;
                true
            } else {
                self.rejected += 1;
                debug!(
                    "[Filter] Rejected {}ns (median={:.0}, MAD={:.0}, threshold={:.0})",
                    sample_ns, median, mad, threshold
                );
                false
            }
        } else {
            self.consecutive_rejects = 0;
            true
        };

        FilterResult { accepted, median, mad, threshold }
    }

    fn reset(&mut self) {
        self.history.clear();
        self.consecutive_rejects = 0;
    }

    fn describe(&self) -> String {
        format!("mad(window={}, k={:.1})", self.window_size, self.k)
    }

    fn stats(&self) -> (u64, u64) {
        (self.total_samples, self.rejected)
    }
}
