use log::{debug, info, warn};
use std::collections::VecDeque;
use std::time::Duration;

use crate::config::{DtMethod, ServoConfig};

const MIN_GAIN: f64 = 0.000001;

/// PI controller turning offset-from-master (ns) into a frequency correction (ppb).
///
/// The integral term is the observed oscillator drift; it is what gets persisted
/// across restarts. The caller applies `-output` to the clock.
pub struct PiServo {
    kp: f64,
    ki: f64,
    max_output: f64,
    dt_method: DtMethod,
    dt: f64,
    max_dt: f64,

    input: f64,
    output: f64,
    observed_drift: f64,
    last_update: Option<Duration>,
    running_max_output: bool,

    stability: Option<StabilityTracker>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StabilityEvent {
    Unchanged,
    BecameStable,
    LostStability,
    /// No stability reached within the timeout window.
    TimedOut,
}

impl PiServo {
    pub fn new(config: &ServoConfig) -> Self {
        PiServo {
            kp: config.kp.max(MIN_GAIN),
            ki: config.ki.max(MIN_GAIN),
            max_output: config.max_ppb,
            dt_method: config.dt_method,
            dt: 1.0,
            max_dt: config.max_dt,
            input: 0.0,
            output: 0.0,
            observed_drift: 0.0,
            last_update: None,
            running_max_output: false,
            stability: config.stability_detection.then(|| StabilityTracker::new(config)),
        }
    }

    /// Nominal update interval, taken from the sync interval.
    pub fn set_interval(&mut self, log_sync_interval: i8) {
        self.dt = 2f64.powi(log_sync_interval as i32);
    }

    pub fn reset(&mut self) {
        self.observed_drift = 0.0;
        self.output = 0.0;
        self.input = 0.0;
        self.last_update = None;
        self.running_max_output = false;
        if let Some(stability) = self.stability.as_mut() {
            stability.reset();
        }
    }

    /// Run one controller update. `now` is a monotonic reading used by the MEASURED dT policy.
    pub fn run(&mut self, input_ns: i64, now: Duration) -> f64 {
        let mut dt = match self.dt_method {
            DtMethod::None => 1.0,
            DtMethod::Constant => self.dt,
            DtMethod::Measured => match self.last_update {
                Some(last) if now > last => (now - last).as_secs_f64().min(self.max_dt * self.dt),
                Some(_) => 0.0,
                None => self.dt,
            },
        };
        if dt <= 0.0 {
            dt = 1.0;
        }
        self.last_update = Some(now);

        self.input = input_ns as f64;
        self.observed_drift += dt * self.input * self.ki;

        let mut saturated = false;
        if self.observed_drift >= self.max_output {
            self.observed_drift = self.max_output;
            saturated = true;
        } else if self.observed_drift <= -self.max_output {
            self.observed_drift = -self.max_output;
            saturated = true;
        }

        let raw = self.kp * self.input + self.observed_drift;
        self.output = raw.clamp(-self.max_output, self.max_output);
        if self.output != raw {
            saturated = true;
        }
        self.running_max_output = saturated;

        debug!(
            "[Servo] dt={:.6}s input={}ns output={:.3}ppb drift={:.3}ppb{}",
            dt,
            input_ns,
            self.output,
            self.observed_drift,
            if saturated { " (saturated)" } else { "" }
        );

        self.output
    }

    /// Feed the current drift into the stability tracker, if enabled.
    pub fn update_stability(&mut self) -> StabilityEvent {
        let drift = self.observed_drift;
        let Some(stability) = self.stability.as_mut() else {
            return StabilityEvent::Unchanged;
        };

        let event = stability.update(drift);
        match event {
            StabilityEvent::BecameStable => info!(
                "[Servo] Clock servo now stable: drift std dev {:.3} ppb",
                stability.std_dev
            ),
            StabilityEvent::LostStability => warn!(
                "[Servo] Clock servo no longer stable: drift std dev {:.3} ppb",
                stability.std_dev
            ),
            StabilityEvent::TimedOut => warn!(
                "[Servo] Clock servo not stable after {} updates",
                stability.timeout
            ),
            StabilityEvent::Unchanged => {}
        }
        event
    }

    pub fn observed_drift(&self) -> f64 {
        self.observed_drift
    }

    /// Seed the integrator with a restored drift value.
    pub fn set_observed_drift(&mut self, drift: f64) {
        self.observed_drift = drift.clamp(-self.max_output, self.max_output);
    }

    pub fn output(&self) -> f64 {
        self.output
    }

    pub fn max_output(&self) -> f64 {
        self.max_output
    }

    pub fn running_max_output(&self) -> bool {
        self.running_max_output
    }

    pub fn is_stable(&self) -> bool {
        self.stability.as_ref().map(|s| s.is_stable).unwrap_or(false)
    }

    pub fn drift_std_dev(&self) -> Option<f64> {
        self.stability.as_ref().map(|s| s.std_dev)
    }
}

// ============================================================================
// DRIFT STABILITY
// ============================================================================

/// Rolling standard deviation of observed drift with a consecutive-update stability gate.
struct StabilityTracker {
    window: VecDeque<f64>,
    window_size: usize,
    threshold: f64,
    period: u32,
    timeout: u32,

    stable_count: u32,
    unstable_updates: u32,
    is_stable: bool,
    std_dev: f64,
}

impl StabilityTracker {
    fn new(config: &ServoConfig) -> Self {
        StabilityTracker {
            window: VecDeque::with_capacity(config.stats_window),
            window_size: config.stats_window.max(2),
            threshold: config.stability_threshold,
            period: config.stability_period.max(1),
            timeout: config.stability_timeout.max(1),
            stable_count: 0,
            unstable_updates: 0,
            is_stable: false,
            std_dev: 0.0,
        }
    }

    fn reset(&mut self) {
        self.window.clear();
        self.stable_count = 0;
        self.unstable_updates = 0;
        self.is_stable = false;
        self.std_dev = 0.0;
    }

    fn update(&mut self, drift: f64) -> StabilityEvent {
        self.window.push_back(drift);
        if self.window.len() > self.window_size {
            self.window.pop_front();
        }
        if self.window.len() < 2 {
            return StabilityEvent::Unchanged;
        }

        let n = self.window.len() as f64;
        let mean = self.window.iter().sum::<f64>() / n;
        let variance = self.window.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (n - 1.0);
        self.std_dev = variance.sqrt();

        if self.std_dev <= self.threshold {
            self.unstable_updates = 0;
            if self.is_stable {
                return StabilityEvent::Unchanged;
            }
            self.stable_count += 1;
            if self.stable_count >= self.period {
                self.is_stable = true;
                return StabilityEvent::BecameStable;
            }
            return StabilityEvent::Unchanged;
        }

        self.stable_count = 0;
        if self.is_stable {
            self.is_stable = false;
            return StabilityEvent::LostStability;
        }

        self.unstable_updates += 1;
        if self.unstable_updates >= self.timeout {
            self.unstable_updates = 0;
            return StabilityEvent::TimedOut;
        }
        StabilityEvent::Unchanged
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(kp: f64, ki: f64, max_ppb: f64) -> ServoConfig {
        ServoConfig {
            kp,
            ki,
            max_ppb,
            dt_method: DtMethod::Constant,
            ..Default::default()
        }
    }

    #[test]
    fn test_servo_proportional() {
        let mut servo = PiServo::new(&config(0.5, 0.0, 500_000.0));
        // ki is floored at 1e-6, so the integral contributes almost nothing
        let out = servo.run(1000, Duration::ZERO);
        assert!((out - 500.0).abs() < 0.01, "out={}", out);
    }

    #[test]
    fn test_servo_integral_accumulation() {
        let mut servo = PiServo::new(&config(0.0, 0.001, 500_000.0));
        servo.run(1000, Duration::ZERO);
        assert!((servo.observed_drift() - 1.0).abs() < 1e-9);
        servo.run(1000, Duration::ZERO);
        assert!((servo.observed_drift() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_servo_saturation_latches_and_clears() {
        let mut servo = PiServo::new(&config(0.1, 0.001, 500_000.0));

        for i in 0..200 {
            let out = servo.run(10_000_000, Duration::from_secs(i));
            assert!(out <= 500_000.0);
        }
        assert_eq!(servo.output(), 500_000.0);
        assert!(servo.running_max_output());

        let mut cleared = false;
        for i in 200..400 {
            servo.run(-1_000, Duration::from_secs(i));
            if !servo.running_max_output() {
                cleared = true;
                break;
            }
        }
        assert!(cleared);
        assert!(servo.output() < 500_000.0);
    }

    #[test]
    fn test_servo_negative_saturation() {
        let mut servo = PiServo::new(&config(1.0, 0.01, 1000.0));
        for _ in 0..10 {
            servo.run(-5_000_000, Duration::ZERO);
        }
        assert_eq!(servo.output(), -1000.0);
        assert_eq!(servo.observed_drift(), -1000.0);
        assert!(servo.running_max_output());
    }

    #[test]
    fn test_servo_reset() {
        let mut servo = PiServo::new(&config(0.1, 0.001, 500_000.0));
        servo.run(1_000_000, Duration::ZERO);
        assert!(servo.observed_drift() != 0.0);

        servo.reset();
        assert_eq!(servo.observed_drift(), 0.0);
        assert_eq!(servo.output(), 0.0);
        assert!(!servo.running_max_output());
    }

    #[test]
    fn test_dt_policies() {
        let mut c = config(0.0, 0.001, 500_000.0);

        c.dt_method = DtMethod::Constant;
        let mut servo = PiServo::new(&c);
        servo.set_interval(-2); // 0.25 s
        servo.run(1000, Duration::ZERO);
        assert!((servo.observed_drift() - 0.25).abs() < 1e-9);

        c.dt_method = DtMethod::None;
        let mut servo = PiServo::new(&c);
        servo.set_interval(-2);
        servo.run(1000, Duration::ZERO);
        assert!((servo.observed_drift() - 1.0).abs() < 1e-9);

        c.dt_method = DtMethod::Measured;
        c.max_dt = 4.0;
        let mut servo = PiServo::new(&c);
        servo.set_interval(0);
        servo.run(1000, Duration::from_secs(10)); // first update uses the nominal 1 s
        servo.run(1000, Duration::from_millis(12_000)); // 2 s measured
        assert!((servo.observed_drift() - 3.0).abs() < 1e-9);
        servo.run(1000, Duration::from_secs(100)); // clamped at 4 x 1 s
        assert!((servo.observed_drift() - 7.0).abs() < 1e-9);
    }

    #[test]
    fn test_restored_drift_is_clamped() {
        let mut servo = PiServo::new(&config(0.1, 0.001, 1000.0));
        servo.set_observed_drift(5000.0);
        assert_eq!(servo.observed_drift(), 1000.0);
    }

    #[test]
    fn test_stability_detection() {
        let mut c = config(0.1, 0.001, 500_000.0);
        c.stability_detection = true;
        c.stability_threshold = 5.0;
        c.stability_period = 3;
        c.stability_timeout = 4;
        c.stats_window = 4;
        let mut servo = PiServo::new(&c);

        let mut events = Vec::new();
        for drift in [100.0, 101.0, 100.5, 100.0, 101.0] {
            servo.set_observed_drift(drift);
            events.push(servo.update_stability());
        }
        assert!(events.contains(&StabilityEvent::BecameStable));
        assert!(servo.is_stable());

        servo.set_observed_drift(400.0);
        assert_eq!(servo.update_stability(), StabilityEvent::LostStability);
        assert!(!servo.is_stable());

        let mut timed_out = false;
        for drift in [-400.0, 400.0, -400.0, 400.0, -400.0] {
            servo.set_observed_drift(drift);
            if servo.update_stability() == StabilityEvent::TimedOut {
                timed_out = true;
            }
        }
        assert!(timed_out);
    }
}
