//! Observed-drift persistence.
//!
//! The servo integrator is the oscillator's frequency error. Saving it lets a
//! restarted daemon resume close to lock instead of converging from zero.

use anyhow::{Context, Result};
use log::{debug, info, warn};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::clock::SystemClock;
use crate::config::DriftRecovery;
use crate::datasets::{is_master_only_class, PortState};
use crate::traits::DriftStore;

/// Drift kept in a one-line text file, in ppb.
pub struct FileDriftStore {
    path: PathBuf,
}

impl FileDriftStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileDriftStore { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DriftStore for FileDriftStore {
    fn load(&mut self) -> Result<Option<f64>> {
        let text = match fs::read_to_string(&self.path) {
            Ok(t) => t,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read drift file {}", self.path.display()))
            }
        };
        let value = text
            .trim()
            .parse::<f64>()
            .with_context(|| format!("Invalid drift value in {}", self.path.display()))?;
        Ok(Some(value))
    }

    fn save(&mut self, drift_ppb: f64) -> Result<()> {
        fs::write(&self.path, format!("{:.0}\n", drift_ppb))
            .with_context(|| format!("Failed to write drift file {}", self.path.display()))
    }
}

/// Used when no drift file is configured.
#[derive(Debug, Default)]
pub struct NoDriftStore;

impl DriftStore for NoDriftStore {
    fn load(&mut self) -> Result<Option<f64>> {
        Ok(None)
    }

    fn save(&mut self, _drift_ppb: f64) -> Result<()> {
        Ok(())
    }
}

/// Whether the current drift is worth keeping.
pub fn should_save(state: PortState, clock_class: u8, drift_ppb: f64, servo_saturated: bool) -> bool {
    if matches!(state, PortState::Passive | PortState::Master) {
        return false;
    }
    if is_master_only_class(clock_class) {
        return false;
    }
    if state == PortState::Listening && drift_ppb == 0.0 {
        return false;
    }
    !servo_saturated
}

/// Persist `drift_ppb`, returning the rounded value to cache. Store failures are logged only.
pub fn save_drift<S: DriftStore + ?Sized>(store: &mut S, method: DriftRecovery, drift_ppb: f64) -> f64 {
    let rounded = drift_ppb.round();
    if method == DriftRecovery::File {
        match store.save(rounded) {
            Ok(()) => info!("[Drift] Saved observed drift {:.0} ppb", rounded),
            Err(e) => warn!("[Drift] Could not save observed drift: {:#}", e),
        }
    } else {
        debug!("[Drift] Cached observed drift {:.0} ppb", rounded);
    }
    rounded
}

/// Drift to seed the servo with. The in-memory cache wins; otherwise `method`
/// decides. A file that cannot be read falls back to the kernel frequency.
pub fn restore_drift<C, S>(method: DriftRecovery, cached: Option<f64>, clock: &C, store: &mut S) -> f64
where
    C: SystemClock + ?Sized,
    S: DriftStore + ?Sized,
{
    if let Some(drift) = cached {
        debug!("[Drift] Restoring cached drift {:.0} ppb", drift);
        return drift;
    }

    let from_kernel = |clock: &C| match clock.frequency() {
        Ok(freq) => {
            info!("[Drift] Observed drift {:.0} ppb taken from kernel", -freq);
            -freq
        }
        Err(e) => {
            warn!("[Drift] Could not read kernel frequency: {:#}", e);
            0.0
        }
    };

    match method {
        DriftRecovery::Reset => 0.0,
        DriftRecovery::Kernel => from_kernel(clock),
        DriftRecovery::File => match store.load() {
            Ok(Some(drift)) => {
                info!("[Drift] Observed drift {:.0} ppb loaded from file", drift);
                drift
            }
            Ok(None) => {
                info!("[Drift] No saved drift, using kernel frequency");
                from_kernel(clock)
            }
            Err(e) => {
                warn!("[Drift] {:#}, using kernel frequency", e);
                from_kernel(clock)
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockSystemClock;
    use crate::traits::MockDriftStore;

    #[test]
    fn test_file_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FileDriftStore::new(dir.path().join("drift"));
        assert_eq!(store.load().unwrap(), None);
        store.save(-1234.6).unwrap();
        assert_eq!(store.load().unwrap(), Some(-1235.0));
    }

    #[test]
    fn test_file_store_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("drift");
        fs::write(&path, "fast\n").unwrap();
        let mut store = FileDriftStore::new(&path);
        assert!(store.load().is_err());
    }

    #[test]
    fn test_should_save() {
        assert!(should_save(PortState::Slave, 248, 150.0, false));
        assert!(!should_save(PortState::Slave, 248, 150.0, true));
        assert!(!should_save(PortState::Master, 248, 150.0, false));
        assert!(!should_save(PortState::Passive, 248, 150.0, false));
        assert!(!should_save(PortState::Slave, 6, 150.0, false));
        assert!(!should_save(PortState::Listening, 248, 0.0, false));
        assert!(should_save(PortState::Listening, 248, 10.0, false));
    }

    #[test]
    fn test_restore_prefers_cache() {
        let clock = MockSystemClock::new();
        let mut store = MockDriftStore::new();
        store.expect_load().times(0);
        assert_eq!(restore_drift(DriftRecovery::File, Some(42.0), &clock, &mut store), 42.0);
    }

    #[test]
    fn test_restore_methods() {
        let mut clock = MockSystemClock::new();
        clock.expect_frequency().returning(|| Ok(-300.0));
        let mut store = MockDriftStore::new();
        store.expect_load().returning(|| Ok(Some(55.0)));

        assert_eq!(restore_drift(DriftRecovery::Reset, None, &clock, &mut store), 0.0);
        assert_eq!(restore_drift(DriftRecovery::Kernel, None, &clock, &mut store), 300.0);
        assert_eq!(restore_drift(DriftRecovery::File, None, &clock, &mut store), 55.0);
    }

    #[test]
    fn test_restore_file_failure_falls_back_to_kernel() {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut clock = MockSystemClock::new();
        clock.expect_frequency().times(1).returning(|| Ok(120.0));
        let mut store = MockDriftStore::new();
        store
            .expect_load()
            .times(1)
            .returning(|| Err(anyhow::anyhow!("permission denied")));

        assert_eq!(restore_drift(DriftRecovery::File, None, &clock, &mut store), -120.0);
    }

    #[test]
    fn test_restore_kernel_failure_leaves_zero() {
        let mut clock = MockSystemClock::new();
        clock
            .expect_frequency()
            .returning(|| Err(anyhow::anyhow!("adjtimex query failed")));
        let mut store = MockDriftStore::new();
        assert_eq!(restore_drift(DriftRecovery::Kernel, None, &clock, &mut store), 0.0);
    }

    #[test]
    fn test_save_only_writes_file_for_file_method() {
        let mut store = MockDriftStore::new();
        store
            .expect_save()
            .with(mockall::predicate::eq(-40.0))
            .times(1)
            .returning(|_| Ok(()));
        assert_eq!(save_drift(&mut store, DriftRecovery::File, -40.4), -40.0);
        assert_eq!(save_drift(&mut store, DriftRecovery::Kernel, 10.0), 10.0);
    }
}
