//! Offset and path delay computation, and the clock discipline decision
//! (step, slew or servo).

use log::{debug, error, info, warn};

use super::PtpPort;
use crate::clock::SystemClock;
use crate::datasets::{DelayMechanism, PortState};
use crate::servo::StabilityEvent;
use crate::time::TimeInternal;
use crate::timer::{PtpTimer, TimerService};
use crate::traits::{DriftStore, PtpNetwork};

const ONE_SECOND_NS: i64 = 1_000_000_000;

impl<C, N, D, T> PtpPort<C, N, D, T>
where
    C: SystemClock,
    N: PtpNetwork,
    D: DriftStore,
    T: TimerService,
{
    // ========================================================================
    // MEASUREMENTS
    // ========================================================================

    /// Offset from a (t1, t2) pair. Returns false when the sample is dropped.
    pub(super) fn update_offset(&mut self, t1: TimeInternal, t2: TimeInternal, correction: TimeInternal) -> bool {
        let delay_ms = t2 - t1 - correction;

        let verdict = self.outlier_ms.accept(delay_ms.to_nanos());
        if !verdict.accepted {
            self.counters.outlier_rejections += 1;
            debug!(
                "[PTP] Master-to-slave delay {} rejected ({}, median {:.0}, threshold {:.0})",
                delay_ms,
                self.outlier_ms.describe(),
                verdict.median,
                verdict.threshold
            );
            return false;
        }

        let max_delay = self.config.clock.max_delay_ns;
        if max_delay > 0 && delay_ms.to_nanos().abs() > max_delay {
            self.counters.max_delay_drops += 1;
            self.consecutive_max_delay += 1;
            debug!("[PTP] Master-to-slave delay {} above max_delay, dropped", delay_ms);

            let limit = self.config.clock.max_delay_max_rejected;
            if limit > 0 && self.consecutive_max_delay >= limit {
                warn!(
                    "[PTP] {} consecutive samples above max_delay, resetting delay estimate",
                    self.consecutive_max_delay
                );
                self.consecutive_max_delay = 0;
                self.delay_filter.reset();
                self.ds.current_ds.mean_path_delay = TimeInternal::ZERO;
            }
            return false;
        }
        self.consecutive_max_delay = 0;
        self.sync.delay_ms = Some(delay_ms);

        let path_delay = match self.ds.port_ds.delay_mechanism {
            DelayMechanism::P2P => self.ds.port_ds.peer_mean_path_delay,
            _ => self.ds.current_ds.mean_path_delay,
        };
        let offset = delay_ms - path_delay + TimeInternal::from_nanos(self.config.clock.offset_shift_ns);
        self.ds.current_ds.offset_from_master = self.offset_filter.filter(offset);
        true
    }

    /// E2E mean path delay from the last (t1, t2) and this (t3, t4).
    pub(super) fn update_delay(&mut self, t3: TimeInternal, t4: TimeInternal, correction: TimeInternal) {
        let Some(delay_ms) = self.sync.delay_ms else {
            debug!("[PTP] Delay_Resp before any Sync, ignored");
            return;
        };
        let delay_sm = t4 - t3 - correction;

        let verdict = self.outlier_sm.accept(delay_sm.to_nanos());
        if !verdict.accepted {
            self.counters.outlier_rejections += 1;
            debug!("[PTP] Slave-to-master delay {} rejected ({})", delay_sm, self.outlier_sm.describe());
            return;
        }

        let sample = (delay_ms + delay_sm).div2();
        if sample.is_negative() {
            debug!("[PTP] Negative path delay {} discarded", sample);
            return;
        }
        let max_delay = self.config.clock.max_delay_ns;
        if max_delay > 0 && sample.to_nanos() > max_delay {
            self.counters.max_delay_drops += 1;
            debug!("[PTP] Path delay {} above max_delay, dropped", sample);
            return;
        }

        let stiffness = self.config.filter.delay_stiffness;
        self.ds.current_ds.mean_path_delay = self.delay_filter.filter(sample, stiffness);
        debug!(
            "[PTP] Path delay sample {} -> mean {}",
            sample, self.ds.current_ds.mean_path_delay
        );
    }

    /// Peer delay. `t3` is None when the responder is one-step and folded
    /// its turnaround into the correction field.
    pub(super) fn update_peer_delay(&mut self, t3: Option<TimeInternal>) {
        self.pdelay.waiting_for_response = false;
        self.pdelay.waiting_for_follow_up = false;

        let p = &self.pdelay;
        let sample = match t3 {
            Some(t3) => ((p.t4 - t3) + (p.t2 - p.t1) - p.correction).div2(),
            None => (p.t4 - p.t1 - p.correction).div2(),
        };
        if sample.is_negative() {
            debug!("[PTP] Negative peer delay {} discarded", sample);
            return;
        }

        let stiffness = self.config.filter.delay_stiffness;
        self.ds.port_ds.peer_mean_path_delay = self.peer_delay_filter.filter(sample, stiffness);
    }

    // ========================================================================
    // CLOCK DISCIPLINE
    // ========================================================================

    pub(super) fn update_clock(&mut self) {
        let offset = self.ds.current_ds.offset_from_master;
        let offset_ns = offset.to_nanos();
        let c = &self.config.clock;

        if c.max_offset_ns > 0 && offset_ns.abs() > c.max_offset_ns {
            warn!("[Clock] Offset {} above max_offset, not applied", offset);
            return;
        }

        if c.enable_panic_mode && !self.panic_over {
            if self.panic_mode {
                if offset_ns.abs() < c.panic_mode_exit_threshold_ns {
                    info!("[Clock] Offset {} back under panic threshold, leaving panic mode", offset);
                    self.panic_mode = false;
                    self.timers.stop(PtpTimer::PanicMode);
                } else {
                    return;
                }
            } else if offset_ns.abs() >= ONE_SECOND_NS {
                let minutes = c.panic_mode_duration.max(1);
                warn!(
                    "[Clock] Offset {} above 1 s, entering panic mode for {} min",
                    offset, minutes
                );
                self.panic_mode = true;
                self.counters.panic_mode_entries += 1;
                self.timers.start(PtpTimer::PanicMode, minutes as f64 * 60.0);
                return;
            }
        }

        let beyond_threshold = offset_ns.abs() >= c.step_threshold_ns;
        let forced = c.step_force && !self.past_startup;
        let after_panic = self.panic_over && offset_ns.abs() >= ONE_SECOND_NS;

        if beyond_threshold || forced || after_panic {
            let may_step = !c.no_reset_clock && !(c.step_once && self.stepped_once);
            if may_step {
                warn!("[Clock] Offset {} from master, stepping clock", offset);
                self.panic_over = false;
                self.step_clock(offset);
            } else {
                let max = self.servo.max_output();
                let slew = if offset.is_negative() { max } else { -max };
                debug!("[Clock] Clock steps disabled, slewing at {:.0} ppb", slew);
                self.set_frequency(slew);
            }
        } else {
            let output = self.servo.run(offset_ns, self.uptime);
            self.set_frequency(-output);
        }

        self.clock_updated();
    }

    fn clock_updated(&mut self) {
        self.counters.offset_updates += 1;
        self.past_startup = true;

        let timeout = self.config.clock.clock_update_timeout;
        if timeout > 0 {
            self.timers.start(PtpTimer::ClockUpdate, timeout as f64);
        }

        match self.servo.update_stability() {
            StabilityEvent::BecameStable | StabilityEvent::TimedOut => self.save_drift(),
            StabilityEvent::LostStability | StabilityEvent::Unchanged => {}
        }

        if self.state() == PortState::Uncalibrated && self.calibrated {
            self.to_state(PortState::Slave);
        }
    }

    /// Apply a frequency correction in ppb. No-op with `no_adjust`.
    pub(super) fn set_frequency(&mut self, ppb: f64) {
        if self.config.clock.no_adjust {
            return;
        }
        match self.clock.adjust_frequency(ppb) {
            Ok(()) => self.frequency_ppb = ppb,
            Err(e) => warn!("[Clock] Frequency adjustment to {:.3} ppb failed: {:#}", ppb, e),
        }
    }

    /// Remove `offset` from the clock in one jump, then restart the servo from
    /// the saved drift.
    pub(super) fn step_clock(&mut self, offset: TimeInternal) {
        if self.config.clock.no_adjust {
            warn!("[Clock] Clock adjustment disabled, not stepping by {}", -offset);
            return;
        }
        if let Err(e) = self.clock.step_clock(-offset) {
            error!("[Clock] Failed to step clock by {}: {:#}", -offset, e);
            return;
        }
        info!("[Clock] Clock stepped by {}", -offset);

        self.counters.clock_steps += 1;
        self.stepped_once = true;
        self.past_startup = true;

        self.offset_filter.reset();
        self.delay_filter.reset();
        self.peer_delay_filter.reset();
        self.outlier_ms.reset();
        self.outlier_sm.reset();
        self.sync.delay_ms = None;
        self.ds.current_ds.offset_from_master = TimeInternal::ZERO;
        self.ds.current_ds.mean_path_delay = TimeInternal::ZERO;

        self.servo.reset();
        self.restore_drift();

        #[cfg(target_os = "linux")]
        if self.config.clock.set_rtc {
            match crate::rtc::update_rtc(self.clock.now()) {
                Ok(()) => info!("[Clock] Hardware clock updated"),
                Err(e) => warn!("[Clock] Failed to update hardware clock: {:#}", e),
            }
        }
    }
}
