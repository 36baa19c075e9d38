use anyhow::Result;

use crate::time::TimeInternal;

#[cfg(target_os = "linux")]
pub mod linux;

#[cfg(target_os = "linux")]
pub use linux::LinuxClock;

/// The clock being disciplined.
#[cfg_attr(test, mockall::automock)]
pub trait SystemClock {
    fn now(&self) -> TimeInternal;

    /// Set the frequency correction, in ppb. Positive speeds the clock up.
    fn adjust_frequency(&mut self, ppb: f64) -> Result<()>;

    /// Add `offset` to the current time.
    fn step_clock(&mut self, offset: TimeInternal) -> Result<()>;

    /// Frequency correction currently in effect, in ppb.
    fn frequency(&self) -> Result<f64>;
}
