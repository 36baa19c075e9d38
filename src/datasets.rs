//! PTP data sets (IEEE 1588-2008 clause 8) and the identities they are keyed by.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::time::TimeInternal;

/// EUI-64 clock identity. Ordering is byte-wise, lower compares as better in BMC tie-breaks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClockIdentity(pub [u8; 8]);

impl ClockIdentity {
    /// EUI-48 to EUI-64 by inserting FF:FE in the middle.
    pub fn from_mac(mac: [u8; 6]) -> Self {
        ClockIdentity([mac[0], mac[1], mac[2], 0xff, 0xfe, mac[3], mac[4], mac[5]])
    }

    pub fn random() -> Self {
        let bytes = uuid::Uuid::new_v4();
        let mut id = [0u8; 8];
        id.copy_from_slice(&bytes.as_bytes()[..8]);
        ClockIdentity(id)
    }

    pub fn is_all_ones(&self) -> bool {
        self.0 == [0xff; 8]
    }
}

impl fmt::Display for ClockIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02x}{:02x}{:02x}.{:02x}{:02x}.{:02x}{:02x}{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]
        )
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PortIdentity {
    pub clock_identity: ClockIdentity,
    pub port_number: u16,
}

impl PortIdentity {
    /// Wildcard used as targetPortIdentity when the peer is not yet known.
    pub const ALL_ONES: PortIdentity = PortIdentity {
        clock_identity: ClockIdentity([0xff; 8]),
        port_number: 0xffff,
    };

    pub fn new(clock_identity: ClockIdentity, port_number: u16) -> Self {
        PortIdentity { clock_identity, port_number }
    }

    pub fn is_empty(&self) -> bool {
        *self == PortIdentity::default()
    }

    /// Compare ignoring the port-number bits set in `mask`.
    pub fn matches(&self, other: &PortIdentity, mask: u16) -> bool {
        self.clock_identity == other.clock_identity
            && (self.port_number & !mask) == (other.port_number & !mask)
    }
}

impl fmt::Display for PortIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{:02x}", self.clock_identity, self.port_number)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClockQuality {
    pub clock_class: u8,
    pub clock_accuracy: u8,
    pub offset_scaled_log_variance: u16,
}

impl Default for ClockQuality {
    fn default() -> Self {
        ClockQuality {
            clock_class: 248,
            clock_accuracy: 0xfe,
            offset_scaled_log_variance: 0xffff,
        }
    }
}

/// Clock classes 1..=127 may only act as masters or stay passive.
pub fn is_master_only_class(clock_class: u8) -> bool {
    (1..=127).contains(&clock_class)
}

pub const CLOCK_CLASS_SLAVE_ONLY: u8 = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DelayMechanism {
    E2E,
    P2P,
    Disabled,
}

impl DelayMechanism {
    pub fn wire_value(&self) -> u8 {
        match self {
            DelayMechanism::E2E => 0x01,
            DelayMechanism::P2P => 0x02,
            DelayMechanism::Disabled => 0xfe,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PortState {
    Initializing,
    Faulty,
    Disabled,
    Listening,
    PreMaster,
    Master,
    Passive,
    Uncalibrated,
    Slave,
}

impl PortState {
    /// portState enumeration value from Table 8.
    pub fn code(&self) -> u8 {
        match self {
            PortState::Initializing => 1,
            PortState::Faulty => 2,
            PortState::Disabled => 3,
            PortState::Listening => 4,
            PortState::PreMaster => 5,
            PortState::Master => 6,
            PortState::Passive => 7,
            PortState::Uncalibrated => 8,
            PortState::Slave => 9,
        }
    }

    pub fn is_slave_like(&self) -> bool {
        matches!(self, PortState::Slave | PortState::Uncalibrated)
    }
}

impl fmt::Display for PortState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PortState::Initializing => "INITIALIZING",
            PortState::Faulty => "FAULTY",
            PortState::Disabled => "DISABLED",
            PortState::Listening => "LISTENING",
            PortState::PreMaster => "PRE_MASTER",
            PortState::Master => "MASTER",
            PortState::Passive => "PASSIVE",
            PortState::Uncalibrated => "UNCALIBRATED",
            PortState::Slave => "SLAVE",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DefaultDs {
    pub two_step_flag: bool,
    pub clock_identity: ClockIdentity,
    pub number_ports: u16,
    pub clock_quality: ClockQuality,
    pub priority1: u8,
    pub priority2: u8,
    pub domain_number: u8,
    pub slave_only: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CurrentDs {
    pub steps_removed: u16,
    pub offset_from_master: TimeInternal,
    pub mean_path_delay: TimeInternal,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParentDs {
    pub parent_port_identity: PortIdentity,
    pub parent_stats: bool,
    pub grandmaster_identity: ClockIdentity,
    pub grandmaster_clock_quality: ClockQuality,
    pub grandmaster_priority1: u8,
    pub grandmaster_priority2: u8,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimePropertiesDs {
    pub current_utc_offset: i16,
    pub current_utc_offset_valid: bool,
    pub leap59: bool,
    pub leap61: bool,
    pub time_traceable: bool,
    pub frequency_traceable: bool,
    pub ptp_timescale: bool,
    pub time_source: u8,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PortDs {
    pub port_identity: PortIdentity,
    pub port_state: PortState,
    pub log_min_delay_req_interval: i8,
    pub peer_mean_path_delay: TimeInternal,
    pub log_announce_interval: i8,
    pub announce_receipt_timeout: u8,
    pub log_sync_interval: i8,
    pub delay_mechanism: DelayMechanism,
    pub log_min_pdelay_req_interval: i8,
    pub version_number: u8,
}

/// All data sets of the single port this process runs.
#[derive(Debug, Clone, PartialEq)]
pub struct Datasets {
    pub default_ds: DefaultDs,
    pub current_ds: CurrentDs,
    pub parent_ds: ParentDs,
    pub time_properties_ds: TimePropertiesDs,
    pub port_ds: PortDs,
}
