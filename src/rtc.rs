#![cfg(target_os = "linux")]

use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, Timelike, Utc};
use nix::ioctl_write_ptr;
use std::fs::OpenOptions;
use std::os::unix::io::AsRawFd;

use crate::time::TimeInternal;

pub const RTC_DEVICE: &str = "/dev/rtc0";

// Linux RTC Time Struct
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RtcTime {
    pub tm_sec: i32,
    pub tm_min: i32,
    pub tm_hour: i32,
    pub tm_mday: i32,
    pub tm_mon: i32,
    pub tm_year: i32,
    pub tm_wday: i32,
    pub tm_yday: i32,
    pub tm_isdst: i32,
}

// Magic 'p' (0x70), number 0x0a
const RTC_MAGIC: u8 = b'p';
const RTC_SET_TIME_CMD: u8 = 0x0a;

ioctl_write_ptr!(rtc_set_time, RTC_MAGIC, RTC_SET_TIME_CMD, RtcTime);

/// The RTC is kept in UTC.
pub fn rtc_time(time: TimeInternal) -> Option<RtcTime> {
    let dt: DateTime<Utc> = DateTime::from_timestamp(time.seconds as i64, 0)?;
    Some(RtcTime {
        tm_sec: dt.second() as i32,
        tm_min: dt.minute() as i32,
        tm_hour: dt.hour() as i32,
        tm_mday: dt.day() as i32,
        tm_mon: dt.month0() as i32,       // rtc_time tm_mon is 0-11
        tm_year: dt.year() - 1900,        // rtc_time tm_year is years since 1900
        tm_wday: 0,                       // Ignored by RTC_SET_TIME
        tm_yday: 0,
        tm_isdst: 0,
    })
}

/// Copy the system time into the hardware clock after a step.
pub fn update_rtc(time: TimeInternal) -> Result<()> {
    let rtc_val = rtc_time(time).context("time out of RTC range")?;

    let file = OpenOptions::new()
        .write(true)
        .open(RTC_DEVICE)
        .with_context(|| format!("Failed to open {}", RTC_DEVICE))?;

    unsafe {
        rtc_set_time(file.as_raw_fd(), &rtc_val)?;
    }

    Ok(())
}
