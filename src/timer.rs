//! Named protocol timers.
//!
//! Timers are periodic: on expiry they latch an expired flag and reload. The
//! port sweeps them once per iteration via `expired`, which consumes the flag.
//! Time only moves through `tick`, so the whole engine can be driven
//! deterministically from tests.

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PtpTimer {
    AnnounceReceipt,
    SyncReceipt,
    DelayReceipt,
    Qualification,
    Calibration,
    ClockUpdate,
    SyncInterval,
    AnnounceInterval,
    DelayReqInterval,
    PdelayReqInterval,
    UnicastGrant,
    FaultRetry,
    PanicMode,
    Statistics,
}

impl PtpTimer {
    pub const ALL: [PtpTimer; 14] = [
        PtpTimer::AnnounceReceipt,
        PtpTimer::SyncReceipt,
        PtpTimer::DelayReceipt,
        PtpTimer::Qualification,
        PtpTimer::Calibration,
        PtpTimer::ClockUpdate,
        PtpTimer::SyncInterval,
        PtpTimer::AnnounceInterval,
        PtpTimer::DelayReqInterval,
        PtpTimer::PdelayReqInterval,
        PtpTimer::UnicastGrant,
        PtpTimer::FaultRetry,
        PtpTimer::PanicMode,
        PtpTimer::Statistics,
    ];

    fn index(self) -> usize {
        self as usize
    }
}

#[cfg_attr(test, mockall::automock)]
pub trait TimerService {
    /// (Re)arm `timer` with a period of `interval` seconds. Clears a pending expiry.
    fn start(&mut self, timer: PtpTimer, interval: f64);
    fn stop(&mut self, timer: PtpTimer);
    /// True once per expiry.
    fn expired(&mut self, timer: PtpTimer) -> bool;
    fn is_running(&self, timer: PtpTimer) -> bool;
    fn tick(&mut self, elapsed: Duration);
    /// Time until the earliest running timer fires.
    fn next_deadline(&self) -> Option<Duration>;
}

#[derive(Debug, Clone, Copy, Default)]
struct Slot {
    interval: Duration,
    left: Duration,
    running: bool,
    expired: bool,
}

#[derive(Debug, Default)]
pub struct IntervalTimers {
    slots: [Slot; PtpTimer::ALL.len()],
}

impl IntervalTimers {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TimerService for IntervalTimers {
    fn start(&mut self, timer: PtpTimer, interval: f64) {
        let interval = Duration::from_secs_f64(interval.max(0.0));
        self.slots[timer.index()] = Slot {
            interval,
            left: interval,
            running: true,
            expired: false,
        };
    }

    fn stop(&mut self, timer: PtpTimer) {
        let slot = &mut self.slots[timer.index()];
        slot.running = false;
        slot.expired = false;
    }

    fn expired(&mut self, timer: PtpTimer) -> bool {
        let slot = &mut self.slots[timer.index()];
        std::mem::take(&mut slot.expired)
    }

    fn is_running(&self, timer: PtpTimer) -> bool {
        self.slots[timer.index()].running
    }

    fn tick(&mut self, elapsed: Duration) {
        for slot in self.slots.iter_mut().filter(|s| s.running) {
            if elapsed >= slot.left {
                slot.expired = true;
                let overshoot = elapsed - slot.left;
                slot.left = if slot.interval.is_zero() {
                    Duration::ZERO
                } else {
                    let rem = overshoot.as_nanos() % slot.interval.as_nanos();
                    slot.interval - Duration::from_nanos(rem as u64)
                };
            } else {
                slot.left -= elapsed;
            }
        }
    }

    fn next_deadline(&self) -> Option<Duration> {
        self.slots.iter().filter(|s| s.running).map(|s| s.left).min()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn test_timer_fires_and_reloads() {
        let mut t = IntervalTimers::new();
        t.start(PtpTimer::SyncInterval, 1.0);
        t.tick(ms(999));
        assert!(!t.expired(PtpTimer::SyncInterval));
        t.tick(ms(1));
        assert!(t.expired(PtpTimer::SyncInterval));
        // consumed
        assert!(!t.expired(PtpTimer::SyncInterval));
        t.tick(ms(1000));
        assert!(t.expired(PtpTimer::SyncInterval));
    }

    #[test]
    fn test_overshoot_keeps_phase() {
        let mut t = IntervalTimers::new();
        t.start(PtpTimer::AnnounceInterval, 2.0);
        t.tick(ms(2500));
        assert!(t.expired(PtpTimer::AnnounceInterval));
        assert_eq!(t.next_deadline(), Some(ms(1500)));
    }

    #[test]
    fn test_stop_clears_pending_expiry() {
        let mut t = IntervalTimers::new();
        t.start(PtpTimer::AnnounceReceipt, 0.5);
        t.tick(ms(600));
        t.stop(PtpTimer::AnnounceReceipt);
        assert!(!t.expired(PtpTimer::AnnounceReceipt));
        assert!(!t.is_running(PtpTimer::AnnounceReceipt));
        t.tick(ms(600));
        assert!(!t.expired(PtpTimer::AnnounceReceipt));
    }

    #[test]
    fn test_next_deadline_is_earliest_running() {
        let mut t = IntervalTimers::new();
        assert_eq!(t.next_deadline(), None);
        t.start(PtpTimer::Statistics, 30.0);
        t.start(PtpTimer::SyncInterval, 0.25);
        assert_eq!(t.next_deadline(), Some(ms(250)));
        t.stop(PtpTimer::SyncInterval);
        assert_eq!(t.next_deadline(), Some(Duration::from_secs(30)));
    }
}
