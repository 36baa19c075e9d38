use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Snapshot of the port published after every iteration.
///
/// Shared through `Arc<RwLock<SyncStatus>>`; the daemon renders it to the
/// status file on the statistics interval.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct SyncStatus {
    /// PortState name, e.g. "SLAVE"
    pub port_state: String,

    /// Current offset from master (nanoseconds)
    pub offset_ns: i64,

    /// Filtered mean path delay (nanoseconds)
    pub mean_path_delay_ns: i64,

    /// Frequency correction applied to the clock (ppb)
    pub frequency_ppb: f64,

    /// Servo integrator, persisted across restarts (ppb)
    pub observed_drift_ppb: f64,

    pub parent_port_identity: Option<String>,
    pub grandmaster_identity: Option<String>,
    pub steps_removed: u16,
    pub current_utc_offset: i16,

    /// True once the servo reports a stable drift (stability detection only)
    pub servo_stable: bool,

    /// True after the first clock update from a master
    pub settled: bool,

    /// Unix timestamp of last status update
    pub updated_ts: u64,
}

impl Default for SyncStatus {
    fn default() -> Self {
        SyncStatus {
            port_state: "INITIALIZING".to_string(),
            offset_ns: 0,
            mean_path_delay_ns: 0,
            frequency_ppb: 0.0,
            observed_drift_ppb: 0.0,
            parent_port_identity: None,
            grandmaster_identity: None,
            steps_removed: 0,
            current_utc_offset: 0,
            servo_stable: false,
            settled: false,
            updated_ts: 0,
        }
    }
}

/// Write the status as JSON, replacing the file atomically.
pub fn write_status_file(path: &Path, status: &SyncStatus, counters: &impl Serialize) -> Result<()> {
    let doc = serde_json::json!({
        "status": status,
        "counters": counters,
    });
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, serde_json::to_vec_pretty(&doc)?)
        .with_context(|| format!("Failed to write {}", tmp.display()))?;
    std::fs::rename(&tmp, path).with_context(|| format!("Failed to replace {}", path.display()))?;
    Ok(())
}
