use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use crate::datasets::{DelayMechanism, TimePropertiesDs};

/// Largest frequency adjustment accepted by the kernel (adjtimex limit).
pub const ADJ_FREQ_MAX_PPB: f64 = 500_000.0;
/// Consecutive Sync sequence errors tolerated before a protocol reset.
pub const MAX_SEQ_ERRORS: u32 = 50;
pub const UNICAST_MAX_DESTINATIONS: usize = 16;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PtpConfig {
    pub global: GlobalConfig,
    pub ptpengine: EngineConfig,
    pub unicast: UnicastConfig,
    pub servo: ServoConfig,
    pub clock: ClockConfig,
    pub filter: FilterConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalConfig {
    pub interface: Option<String>,
    pub lock_file: PathBuf,
    pub status_file: Option<PathBuf>,
    pub statistics_interval: u32,     // seconds between status log lines / status file writes
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpMode {
    Multicast,
    Unicast,
    Hybrid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub domain_number: u8,
    pub any_domain: bool,
    pub prefer_configured_domain: bool,
    pub prefer_lower_domain: bool,
    pub port_number: u16,
    pub port_disabled: bool,
    pub slave_only: bool,
    pub two_step: bool,
    pub priority1: u8,
    pub priority2: u8,
    pub clock_class: u8,
    pub clock_accuracy: u8,
    pub offset_scaled_log_variance: u16,
    pub time_properties: TimePropertiesDs,

    pub log_announce_interval: i8,
    pub announce_receipt_timeout: u8,
    pub log_sync_interval: i8,
    pub log_min_delay_req_interval: i8,
    pub log_min_pdelay_req_interval: i8,
    pub delay_mechanism: DelayMechanism,
    pub ip_mode: IpMode,

    pub max_foreign_records: usize,
    pub foreign_master_threshold: u16,  // Announces needed before a foreign master qualifies
    pub announce_timeout_grace_period: u32,
    pub max_listen: u32,                // listening resets before a full network restart
    pub sync_sequence_checking: bool,
    pub max_sequence_errors: u32,
    pub calibration_delay: u32,         // seconds in UNCALIBRATED before offsets count
    pub fault_retry_interval: u32,      // seconds spent FAULTY before re-initializing
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UnicastConfig {
    pub negotiation: bool,
    pub negotiation_listening: bool,
    pub destinations: Vec<Ipv4Addr>,
    pub grant_duration: u32,
    pub max_grant_duration: u32,
    pub accept_any: bool,
    pub port_mask: u16,
    pub max_destinations: usize,
    pub log_max_announce_interval: i8,
    pub log_max_sync_interval: i8,
    pub log_max_delay_req_interval: i8,
    pub log_max_pdelay_req_interval: i8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DtMethod {
    None,
    Constant,
    Measured,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServoConfig {
    pub kp: f64,
    pub ki: f64,
    pub max_ppb: f64,
    pub dt_method: DtMethod,
    pub max_dt: f64,                    // MEASURED dT ceiling, in multiples of the sync interval
    pub stability_detection: bool,
    pub stability_threshold: f64,       // ppb std dev of observed drift
    pub stability_period: u32,          // consecutive in-threshold updates to declare stable
    pub stability_timeout: u32,         // updates before giving up waiting for stability
    pub stats_window: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriftRecovery {
    Reset,
    Kernel,
    File,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClockConfig {
    pub no_adjust: bool,
    pub no_reset_clock: bool,
    pub step_force: bool,
    pub step_once: bool,
    pub step_threshold_ns: i64,
    pub max_offset_ns: i64,             // 0 disables
    pub max_delay_ns: i64,              // 0 disables
    pub max_delay_max_rejected: u32,    // consecutive max_delay drops before the delay estimate is reset
    pub inbound_latency_ns: i64,
    pub outbound_latency_ns: i64,
    pub offset_shift_ns: i64,
    pub drift_handling: DriftRecovery,
    pub drift_file: Option<PathBuf>,
    pub set_rtc: bool,
    pub enable_panic_mode: bool,
    pub panic_mode_duration: u32,       // minutes
    pub panic_mode_exit_threshold_ns: i64,
    pub clock_update_timeout: u32,      // seconds, 0 disables
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OutlierFilterConfig {
    None,
    Mad { window: usize, k: f64, max_consecutive: usize },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    pub delay_stiffness: u32,
    pub outlier: OutlierFilterConfig,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        GlobalConfig {
            interface: None,
            lock_file: PathBuf::from("/var/run/ptpsync.lock"),
            status_file: None,
            statistics_interval: 30,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            domain_number: 0,
            any_domain: false,
            prefer_configured_domain: true,
            prefer_lower_domain: false,
            port_number: 1,
            port_disabled: false,
            slave_only: false,
            two_step: true,
            priority1: 128,
            priority2: 128,
            clock_class: 248,
            clock_accuracy: 0xfe,
            offset_scaled_log_variance: 0xffff,
            time_properties: TimePropertiesDs {
                current_utc_offset: 37,
                time_source: 0xa0, // INTERNAL_OSCILLATOR
                ..Default::default()
            },
            log_announce_interval: 1,
            announce_receipt_timeout: 6,
            log_sync_interval: 0,
            log_min_delay_req_interval: 0,
            log_min_pdelay_req_interval: 1,
            delay_mechanism: DelayMechanism::E2E,
            ip_mode: IpMode::Multicast,
            max_foreign_records: 5,
            foreign_master_threshold: 2,
            announce_timeout_grace_period: 0,
            max_listen: 5,
            sync_sequence_checking: false,
            max_sequence_errors: MAX_SEQ_ERRORS,
            calibration_delay: 0,
            fault_retry_interval: 10,
        }
    }
}

impl Default for UnicastConfig {
    fn default() -> Self {
        UnicastConfig {
            negotiation: false,
            negotiation_listening: false,
            destinations: Vec::new(),
            grant_duration: 300,
            max_grant_duration: 3600,
            accept_any: false,
            port_mask: 0,
            max_destinations: UNICAST_MAX_DESTINATIONS,
            log_max_announce_interval: 5,
            log_max_sync_interval: 5,
            log_max_delay_req_interval: 5,
            log_max_pdelay_req_interval: 5,
        }
    }
}

impl Default for ServoConfig {
    fn default() -> Self {
        ServoConfig {
            kp: 0.1,
            ki: 0.001,
            max_ppb: ADJ_FREQ_MAX_PPB,
            dt_method: DtMethod::Constant,
            max_dt: 5.0,
            stability_detection: false,
            stability_threshold: 10.0,
            stability_period: 10,
            stability_timeout: 300,
            stats_window: 30,
        }
    }
}

impl Default for ClockConfig {
    fn default() -> Self {
        ClockConfig {
            no_adjust: false,
            no_reset_clock: false,
            step_force: false,
            step_once: false,
            step_threshold_ns: 1_000_000_000,
            max_offset_ns: 0,
            max_delay_ns: 0,
            max_delay_max_rejected: 0,
            inbound_latency_ns: 0,
            outbound_latency_ns: 0,
            offset_shift_ns: 0,
            drift_handling: DriftRecovery::Reset,
            drift_file: None,
            set_rtc: false,
            enable_panic_mode: false,
            panic_mode_duration: 2,
            panic_mode_exit_threshold_ns: 0,
            clock_update_timeout: 0,
        }
    }
}

impl Default for FilterConfig {
    fn default() -> Self {
        FilterConfig {
            delay_stiffness: 6,
            outlier: OutlierFilterConfig::None,
        }
    }
}

impl PtpConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: PtpConfig = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let e = &self.ptpengine;
        let u = &self.unicast;

        if e.max_foreign_records == 0 {
            bail!("ptpengine.max_foreign_records must be at least 1");
        }
        if e.announce_receipt_timeout < 2 {
            bail!("ptpengine.announce_receipt_timeout must be at least 2");
        }
        if e.foreign_master_threshold == 0 {
            bail!("ptpengine.foreign_master_threshold must be at least 1");
        }
        if e.port_number == 0 || e.port_number == 0xffff {
            bail!("ptpengine.port_number {} is reserved", e.port_number);
        }
        if e.delay_mechanism == crate::datasets::DelayMechanism::P2P && e.ip_mode == IpMode::Hybrid {
            bail!("hybrid IP mode requires the E2E delay mechanism");
        }
        if u.max_destinations == 0 {
            bail!("unicast.max_destinations must be at least 1");
        }
        if u.destinations.len() > u.max_destinations {
            bail!(
                "{} unicast destinations configured, at most {} allowed",
                u.destinations.len(),
                u.max_destinations
            );
        }
        if e.ip_mode == IpMode::Unicast && u.destinations.is_empty() && !u.negotiation_listening {
            bail!("unicast IP mode needs unicast.destinations or negotiation_listening");
        }
        for (name, min, max) in [
            ("announce", e.log_announce_interval, u.log_max_announce_interval),
            ("sync", e.log_sync_interval, u.log_max_sync_interval),
            ("delay_req", e.log_min_delay_req_interval, u.log_max_delay_req_interval),
            ("pdelay_req", e.log_min_pdelay_req_interval, u.log_max_pdelay_req_interval),
        ] {
            if min > max {
                bail!("{} interval: minimum {} above maximum {}", name, min, max);
            }
        }
        if u.negotiation && (u.grant_duration < 10 || u.grant_duration > u.max_grant_duration) {
            bail!(
                "unicast.grant_duration {} must be within 10..={}",
                u.grant_duration,
                u.max_grant_duration
            );
        }
        if !(1.0..=ADJ_FREQ_MAX_PPB).contains(&self.servo.max_ppb) {
            bail!("servo.max_ppb must be within 1..={}", ADJ_FREQ_MAX_PPB);
        }
        if self.servo.stats_window < 2 {
            bail!("servo.stats_window must be at least 2");
        }
        if self.clock.drift_handling == DriftRecovery::File && self.clock.drift_file.is_none() {
            bail!("clock.drift_handling = file requires clock.drift_file");
        }
        if self.clock.step_threshold_ns <= 0 {
            bail!("clock.step_threshold_ns must be positive");
        }
        if self.filter.delay_stiffness == 0 || self.filter.delay_stiffness > 30 {
            bail!("filter.delay_stiffness must be within 1..=30");
        }
        if let OutlierFilterConfig::Mad { window, k, .. } = self.filter.outlier {
            if window < 3 || k <= 0.0 {
                bail!("filter.outlier: MAD window must be >= 3 and k positive");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        PtpConfig::default().validate().unwrap();
    }

    #[test]
    fn test_load_partial_json_uses_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "ptpengine": {{ "domain_number": 4, "slave_only": true, "delay_mechanism": "p2p" }},
                "servo": {{ "kp": 0.7, "dt_method": "measured" }},
                "filter": {{ "outlier": {{ "type": "mad", "window": 9, "k": 4.0, "max_consecutive": 5 }} }}
            }}"#
        )
        .unwrap();

        let config = PtpConfig::load(file.path()).unwrap();
        assert_eq!(config.ptpengine.domain_number, 4);
        assert!(config.ptpengine.slave_only);
        assert_eq!(config.ptpengine.delay_mechanism, DelayMechanism::P2P);
        assert_eq!(config.ptpengine.priority1, 128);
        assert_eq!(config.servo.kp, 0.7);
        assert_eq!(config.servo.ki, 0.001);
        assert_eq!(config.servo.dt_method, DtMethod::Measured);
        assert_eq!(
            config.filter.outlier,
            OutlierFilterConfig::Mad { window: 9, k: 4.0, max_consecutive: 5 }
        );
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut c = PtpConfig::default();
        c.ptpengine.max_foreign_records = 0;
        assert!(c.validate().is_err());

        let mut c = PtpConfig::default();
        c.ptpengine.ip_mode = IpMode::Unicast;
        assert!(c.validate().is_err());
        c.unicast.destinations.push(Ipv4Addr::new(10, 0, 0, 1));
        assert!(c.validate().is_ok());

        let mut c = PtpConfig::default();
        c.ptpengine.log_sync_interval = 6;
        assert!(c.validate().is_err());

        let mut c = PtpConfig::default();
        c.clock.drift_handling = DriftRecovery::File;
        assert!(c.validate().is_err());

        let mut c = PtpConfig::default();
        c.servo.max_ppb = 1e9;
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_load_reports_parse_errors() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();
        let err = PtpConfig::load(file.path()).unwrap_err();
        assert!(err.to_string().contains("Failed to parse"));
    }
}
