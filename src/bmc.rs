//! Best Master Clock selection (IEEE 1588-2008 9.3).
//!
//! `decide` is pure: it ranks the eligible foreign records against the local
//! clock and returns the recommended state plus the winning record. The port
//! applies the matching data set update (`m1`, `s1` or `p1`) together with the
//! state change in one step.

use log::info;
use std::cmp::Ordering;

use crate::datasets::{
    is_master_only_class, ClockIdentity, ClockQuality, Datasets, DefaultDs, PortIdentity, PortState,
    TimePropertiesDs, CLOCK_CLASS_SLAVE_ONLY,
};
use crate::foreign::{ForeignKey, ForeignMasterRecord};
use crate::ptp::{AnnounceBody, Header, UNICAST_MESSAGE_INTERVAL};

// ============================================================================
// DATA SET COMPARISON
// ============================================================================

/// The subset of an Announce (or of the local default data set) the comparison looks at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComparisonDataset {
    pub gm_priority1: u8,
    pub gm_identity: ClockIdentity,
    pub gm_clock_quality: ClockQuality,
    pub gm_priority2: u8,
    pub steps_removed: u16,
    pub sender: PortIdentity,
    pub domain_number: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatasetOrdering {
    Better,
    BetterByTopology,
    /// Receiver and sender are the same port.
    Error1,
    /// The two data sets are indistinguishable.
    Error2,
    WorseByTopology,
    Worse,
}

impl DatasetOrdering {
    pub fn is_better(&self) -> bool {
        matches!(self, DatasetOrdering::Better | DatasetOrdering::BetterByTopology)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, DatasetOrdering::Error1 | DatasetOrdering::Error2)
    }

    fn reverse(self) -> Self {
        match self {
            DatasetOrdering::Better => DatasetOrdering::Worse,
            DatasetOrdering::BetterByTopology => DatasetOrdering::WorseByTopology,
            DatasetOrdering::WorseByTopology => DatasetOrdering::BetterByTopology,
            DatasetOrdering::Worse => DatasetOrdering::Better,
            e => e,
        }
    }
}

impl ComparisonDataset {
    pub fn from_announce(header: &Header, announce: &AnnounceBody) -> Self {
        ComparisonDataset {
            gm_priority1: announce.grandmaster_priority1,
            gm_identity: announce.grandmaster_identity,
            gm_clock_quality: announce.grandmaster_clock_quality,
            gm_priority2: announce.grandmaster_priority2,
            steps_removed: announce.steps_removed,
            sender: header.source_port_identity,
            domain_number: header.domain_number,
        }
    }

    pub fn from_local(default_ds: &DefaultDs, port_identity: PortIdentity) -> Self {
        ComparisonDataset {
            gm_priority1: default_ds.priority1,
            gm_identity: default_ds.clock_identity,
            gm_clock_quality: default_ds.clock_quality,
            gm_priority2: default_ds.priority2,
            steps_removed: 0,
            sender: port_identity,
            domain_number: default_ds.domain_number,
        }
    }

    /// Compare `self` (A) against `other` (B) as seen by `receiver`. Lower values win
    /// at every step.
    pub fn compare(&self, other: &ComparisonDataset, receiver: &PortIdentity) -> DatasetOrdering {
        if self.gm_identity != other.gm_identity {
            return self.compare_grandmasters(other);
        }
        self.compare_topology(other, receiver)
    }

    fn compare_grandmasters(&self, other: &ComparisonDataset) -> DatasetOrdering {
        let a = &self.gm_clock_quality;
        let b = &other.gm_clock_quality;
        let ordering = self
            .gm_priority1
            .cmp(&other.gm_priority1)
            .then(a.clock_class.cmp(&b.clock_class))
            .then(a.clock_accuracy.cmp(&b.clock_accuracy))
            .then(a.offset_scaled_log_variance.cmp(&b.offset_scaled_log_variance))
            .then(self.gm_priority2.cmp(&other.gm_priority2))
            .then(self.gm_identity.cmp(&other.gm_identity));

        match ordering {
            Ordering::Less => DatasetOrdering::Better,
            Ordering::Greater => DatasetOrdering::Worse,
            Ordering::Equal => DatasetOrdering::Error2,
        }
    }

    fn compare_topology(&self, other: &ComparisonDataset, receiver: &PortIdentity) -> DatasetOrdering {
        let a_steps = self.steps_removed as u32;
        let b_steps = other.steps_removed as u32;

        if a_steps > b_steps + 1 {
            return DatasetOrdering::Worse;
        }
        if a_steps + 1 < b_steps {
            return DatasetOrdering::Better;
        }

        if a_steps > b_steps {
            return match receiver.cmp(&self.sender) {
                Ordering::Less => DatasetOrdering::Worse,
                Ordering::Greater => DatasetOrdering::WorseByTopology,
                Ordering::Equal => DatasetOrdering::Error1,
            };
        }
        if a_steps < b_steps {
            return match receiver.cmp(&other.sender) {
                Ordering::Less => DatasetOrdering::Better,
                Ordering::Greater => DatasetOrdering::BetterByTopology,
                Ordering::Equal => DatasetOrdering::Error1,
            };
        }

        match self.sender.cmp(&other.sender) {
            Ordering::Less => DatasetOrdering::BetterByTopology,
            Ordering::Greater => DatasetOrdering::WorseByTopology,
            // Same sender on the same receiving port
            Ordering::Equal => DatasetOrdering::Error2,
        }
    }
}

// ============================================================================
// STATE DECISION
// ============================================================================

#[derive(Debug, Clone, Copy)]
pub struct BmcOptions {
    pub domain_number: u8,
    pub any_domain: bool,
    pub prefer_configured_domain: bool,
    pub prefer_lower_domain: bool,
    pub slave_only: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecommendedState {
    Master,
    Slave,
    Passive,
    Listening,
    Faulty,
}

impl RecommendedState {
    pub fn port_state(&self) -> PortState {
        match self {
            RecommendedState::Master => PortState::Master,
            RecommendedState::Slave => PortState::Slave,
            RecommendedState::Passive => PortState::Passive,
            RecommendedState::Listening => PortState::Listening,
            RecommendedState::Faulty => PortState::Faulty,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub state: RecommendedState,
    pub best: Option<ForeignKey>,
    /// Comparisons that could only be settled by source address.
    pub ties: u32,
}

/// Domain preference between two candidates, if it settles the order.
fn rank_domain(a: &ForeignMasterRecord, b: &ForeignMasterRecord, options: &BmcOptions) -> Option<Ordering> {
    let a_domain = a.header.domain_number;
    let b_domain = b.header.domain_number;
    if !options.any_domain || a_domain == b_domain {
        return None;
    }
    if options.prefer_configured_domain {
        if a_domain == options.domain_number {
            return Some(Ordering::Less);
        }
        if b_domain == options.domain_number {
            return Some(Ordering::Greater);
        }
    }
    options.prefer_lower_domain.then(|| a_domain.cmp(&b_domain))
}

fn compare_records(a: &ForeignMasterRecord, b: &ForeignMasterRecord, receiver: &PortIdentity) -> DatasetOrdering {
    let da = ComparisonDataset::from_announce(&a.header, &a.announce);
    let db = ComparisonDataset::from_announce(&b.header, &b.announce);
    da.compare(&db, receiver)
}

/// Rank two candidates. `Less` means `a` is the better master.
fn rank(a: &ForeignMasterRecord, b: &ForeignMasterRecord, options: &BmcOptions, receiver: &PortIdentity) -> Ordering {
    if let Some(ordering) = rank_domain(a, b, options) {
        return ordering;
    }
    let ordering = compare_records(a, b, receiver);
    if ordering.is_error() {
        a.key.cmp(&b.key)
    } else if ordering.is_better() {
        Ordering::Less
    } else {
        Ordering::Greater
    }
}

/// Whether only the source address tells `a` and `b` apart.
fn is_tie(a: &ForeignMasterRecord, b: &ForeignMasterRecord, options: &BmcOptions, receiver: &PortIdentity) -> bool {
    rank_domain(a, b, options).is_none() && compare_records(a, b, receiver).is_error()
}

fn candidates<'a, 'r>(
    records: &'r [&'a ForeignMasterRecord],
    options: &'r BmcOptions,
) -> impl Iterator<Item = &'a ForeignMasterRecord> + 'r {
    records
        .iter()
        .copied()
        .filter(move |r| options.any_domain || r.header.domain_number == options.domain_number)
}

/// Pick the best eligible record. Records from other domains are only
/// considered with `any_domain`.
pub fn best_record<'a>(
    records: &[&'a ForeignMasterRecord],
    options: &BmcOptions,
    receiver: &PortIdentity,
) -> Option<&'a ForeignMasterRecord> {
    candidates(records, options).min_by(|a, b| rank(a, b, options, receiver))
}

pub fn decide(
    local: &ComparisonDataset,
    records: &[&ForeignMasterRecord],
    options: &BmcOptions,
    current_state: PortState,
) -> Decision {
    let receiver = local.sender;
    let slave_only = options.slave_only || local.gm_clock_quality.clock_class == CLOCK_CLASS_SLAVE_ONLY;

    let Some(best) = best_record(records, options, &receiver) else {
        // A port already on its way to master keeps going.
        let state = if matches!(current_state, PortState::Master | PortState::PreMaster) && !slave_only {
            RecommendedState::Master
        } else {
            RecommendedState::Listening
        };
        return Decision {
            state,
            best: None,
            ties: 0,
        };
    };
    let ties = candidates(records, options)
        .filter(|r| r.key != best.key && is_tie(best, r, options, &receiver))
        .count() as u32;

    if slave_only {
        return Decision {
            state: RecommendedState::Slave,
            best: Some(best.key),
            ties,
        };
    }

    let foreign = ComparisonDataset::from_announce(&best.header, &best.announce);
    let ordering = local.compare(&foreign, &receiver);

    let state = if ordering.is_error() {
        RecommendedState::Faulty
    } else if is_master_only_class(local.gm_clock_quality.clock_class) {
        if ordering.is_better() {
            RecommendedState::Master
        } else {
            RecommendedState::Passive
        }
    } else if ordering.is_better() {
        RecommendedState::Master
    } else {
        RecommendedState::Slave
    };

    Decision {
        state,
        best: Some(best.key),
        ties,
    }
}

// ============================================================================
// DATA SET UPDATES
// ============================================================================

/// Local clock is the grandmaster.
pub fn m1(ds: &mut Datasets, configured: &TimePropertiesDs) {
    ds.current_ds.steps_removed = 0;
    ds.current_ds.offset_from_master = Default::default();
    ds.current_ds.mean_path_delay = Default::default();

    let parent = &mut ds.parent_ds;
    parent.parent_port_identity = PortIdentity::new(ds.default_ds.clock_identity, 0);
    parent.grandmaster_identity = ds.default_ds.clock_identity;
    parent.grandmaster_clock_quality = ds.default_ds.clock_quality;
    parent.grandmaster_priority1 = ds.default_ds.priority1;
    parent.grandmaster_priority2 = ds.default_ds.priority2;

    ds.time_properties_ds = *configured;
}

/// Track the master that sent `announce`. `granted_interval` overrides the
/// header interval when the Announce rate was negotiated.
pub fn s1(ds: &mut Datasets, header: &Header, announce: &AnnounceBody, granted_interval: Option<i8>) {
    ds.current_ds.steps_removed = announce.steps_removed.saturating_add(1);
    copy_parent(ds, header, announce);

    if let Some(interval) = granted_interval {
        ds.port_ds.log_announce_interval = interval;
    } else if header.log_message_interval != UNICAST_MESSAGE_INTERVAL {
        ds.port_ds.log_announce_interval = header.log_message_interval;
    }

    let previous = ds.time_properties_ds;
    let flags = &header.flags;
    let updated = TimePropertiesDs {
        current_utc_offset: announce.current_utc_offset,
        current_utc_offset_valid: flags.current_utc_offset_valid,
        leap59: flags.leap59,
        leap61: flags.leap61,
        time_traceable: flags.time_traceable,
        frequency_traceable: flags.frequency_traceable,
        ptp_timescale: flags.ptp_timescale,
        time_source: announce.time_source,
    };

    if previous.current_utc_offset != updated.current_utc_offset {
        info!(
            "[BMC] UTC offset changed from {} to {}",
            previous.current_utc_offset, updated.current_utc_offset
        );
    }
    if (previous.leap59, previous.leap61) != (updated.leap59, updated.leap61) {
        match (updated.leap59, updated.leap61) {
            (false, false) => info!("[BMC] Leap second event cleared by master"),
            (true, _) => info!("[BMC] Master announced leap second deletion (leap59)"),
            (_, true) => info!("[BMC] Master announced leap second insertion (leap61)"),
        }
    }

    ds.time_properties_ds = updated;
}

/// Record a better master this port does not synchronize to.
pub fn p1(ds: &mut Datasets, header: &Header, announce: &AnnounceBody, configured: &TimePropertiesDs) {
    copy_parent(ds, header, announce);
    ds.time_properties_ds = *configured;
}

fn copy_parent(ds: &mut Datasets, header: &Header, announce: &AnnounceBody) {
    let parent = &mut ds.parent_ds;
    parent.parent_port_identity = header.source_port_identity;
    parent.grandmaster_identity = announce.grandmaster_identity;
    parent.grandmaster_clock_quality = announce.grandmaster_clock_quality;
    parent.grandmaster_priority1 = announce.grandmaster_priority1;
    parent.grandmaster_priority2 = announce.grandmaster_priority2;
}
