use super::SystemClock;
use crate::time::{TimeInternal, NANOS_PER_SEC};
use anyhow::{anyhow, Result};
use libc::{self, adjtimex, clock_gettime, clock_settime, timespec, timex, ADJ_FREQUENCY, CLOCK_REALTIME};
use log::{debug, info};
use std::mem;

/// adjtimex freq units are ppm scaled by 2^16.
fn ppb_to_freq(ppb: f64) -> i64 {
    (ppb / 1000.0 * 65536.0) as i64
}

fn freq_to_ppb(freq: i64) -> f64 {
    freq as f64 / 65536.0 * 1000.0
}

/// Current time shifted by `offset`, normalized into a timespec.
fn shifted(now: &timespec, offset: TimeInternal) -> timespec {
    let mut tv_sec = now.tv_sec as i64 + offset.seconds as i64;
    let mut tv_nsec = now.tv_nsec as i64 + offset.nanoseconds as i64;

    while tv_nsec >= NANOS_PER_SEC as i64 {
        tv_sec += 1;
        tv_nsec -= NANOS_PER_SEC as i64;
    }
    while tv_nsec < 0 {
        tv_sec -= 1;
        tv_nsec += NANOS_PER_SEC as i64;
    }

    let mut ts: timespec = unsafe { mem::zeroed() };
    ts.tv_sec = tv_sec as libc::time_t;
    ts.tv_nsec = tv_nsec as _;
    ts
}

pub struct LinuxClock {
    original_freq: i64,
}

impl LinuxClock {
    pub fn new() -> Result<Self> {
        let mut tx: timex = unsafe { mem::zeroed() };
        tx.modes = 0; // Query mode

        let ret = unsafe { adjtimex(&mut tx) };
        if ret < 0 {
            return Err(anyhow!("adjtimex failed (are you root?)"));
        }

        debug!("[Clock] Kernel frequency at startup: {:.3} ppb", freq_to_ppb(tx.freq as i64));
        Ok(LinuxClock {
            original_freq: tx.freq as i64,
        })
    }
}

impl SystemClock for LinuxClock {
    fn now(&self) -> TimeInternal {
        let mut ts: timespec = unsafe { mem::zeroed() };
        unsafe { clock_gettime(CLOCK_REALTIME, &mut ts) };
        TimeInternal::new(ts.tv_sec as i32, ts.tv_nsec as i32)
    }

    fn adjust_frequency(&mut self, ppb: f64) -> Result<()> {
        let mut tx: timex = unsafe { mem::zeroed() };
        tx.modes = ADJ_FREQUENCY;
        tx.freq = ppb_to_freq(ppb) as _;

        let ret = unsafe { adjtimex(&mut tx) };
        if ret < 0 {
            return Err(anyhow!("adjtimex failed to set frequency"));
        }

        Ok(())
    }

    fn step_clock(&mut self, offset: TimeInternal) -> Result<()> {
        let mut now: timespec = unsafe { mem::zeroed() };
        unsafe { clock_gettime(CLOCK_REALTIME, &mut now) };

        let ts = shifted(&now, offset);
        let ret = unsafe { clock_settime(CLOCK_REALTIME, &ts) };
        if ret < 0 {
            return Err(anyhow!("clock_settime failed: {}", std::io::Error::last_os_error()));
        }
        info!("[Clock] Stepped clock by {} s", offset);
        Ok(())
    }

    fn frequency(&self) -> Result<f64> {
        let mut tx: timex = unsafe { mem::zeroed() };
        tx.modes = 0;
        let ret = unsafe { adjtimex(&mut tx) };
        if ret < 0 {
            return Err(anyhow!("adjtimex query failed: {}", std::io::Error::last_os_error()));
        }
        Ok(freq_to_ppb(tx.freq as i64))
    }
}

impl Drop for LinuxClock {
    fn drop(&mut self) {
        let mut tx: timex = unsafe { mem::zeroed() };
        tx.modes = ADJ_FREQUENCY;
        tx.freq = self.original_freq as _;
        unsafe { adjtimex(&mut tx) };
    }
}

// ============================================================================
// TESTS
// ============================================================================
