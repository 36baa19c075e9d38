pub mod time;
pub mod ptp;
pub mod datasets;
pub mod config;
pub mod counters;
pub mod traits;
pub mod clock;
pub mod timer;
pub mod servo;
pub mod filter;
pub mod foreign;
pub mod bmc;
pub mod unicast;
pub mod drift;
pub mod net;
pub mod status;
pub mod protocol;

#[cfg(target_os = "linux")]
pub mod rtc;
