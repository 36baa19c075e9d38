//! Unicast negotiation grant bookkeeping (IEEE 1588-2008 16.1).
//!
//! A `UnicastGrantTable` holds one row per peer with a grant record for each
//! negotiable message type. The port keeps two tables: the configured
//! destinations it requests service from (slave side) and the slaves it has
//! granted service to (master side). The table itself does no I/O; ticks and
//! refreshes return the signaling work the port has to send.

use log::{debug, info, warn};
use std::collections::HashMap;
use std::net::Ipv4Addr;

use crate::config::{EngineConfig, UnicastConfig};
use crate::datasets::{DelayMechanism, PortIdentity};
use crate::ptp::MessageType;

/// Renew a grant once this many seconds or fewer are left.
pub const GRANT_REFRESH_MARGIN: u32 = 10;
/// Unacknowledged CANCEL attempts before the grant is dropped anyway.
pub const GRANT_CANCEL_ACK_RETRIES: u8 = 3;

pub const GRANT_MESSAGE_TYPES: [MessageType; 4] = [
    MessageType::Announce,
    MessageType::Sync,
    MessageType::DelayResp,
    MessageType::PdelayResp,
];

fn grant_index(message_type: MessageType) -> Option<usize> {
    GRANT_MESSAGE_TYPES.iter().position(|&t| t == message_type)
}

#[derive(Debug, Clone)]
pub struct UnicastGrantData {
    pub message_type: MessageType,
    pub log_interval: i8,
    pub log_min_interval: i8,
    pub log_max_interval: i8,
    /// Seconds granted.
    pub duration: u32,
    pub time_left: u32,
    pub requestable: bool,
    pub requested: bool,
    pub granted: bool,
    pub expired: bool,
    pub canceled: bool,
    pub cancel_count: u8,
    /// Transmit pacing relative to the port's base interval.
    pub interval_counter: u32,
}

impl UnicastGrantData {
    fn new(message_type: MessageType, log_min_interval: i8, log_max_interval: i8, requestable: bool) -> Self {
        UnicastGrantData {
            message_type,
            log_interval: log_min_interval,
            log_min_interval,
            log_max_interval,
            duration: 0,
            time_left: 0,
            requestable,
            requested: false,
            granted: false,
            expired: false,
            canceled: false,
            cancel_count: 0,
            interval_counter: 0,
        }
    }

    /// A GRANT arrived, or we issued one.
    pub fn grant(&mut self, log_interval: i8, duration: u32) {
        self.log_interval = log_interval;
        self.duration = duration;
        self.time_left = duration;
        self.requested = false;
        self.granted = true;
        self.expired = false;
        self.canceled = false;
        self.cancel_count = 0;
        self.interval_counter = 0;
    }

    /// A zero-duration GRANT: ask again later at a slower rate.
    pub fn deny(&mut self) {
        self.requested = false;
        self.granted = false;
        if self.log_interval < self.log_max_interval {
            self.log_interval += 1;
        }
    }

    /// Drop transmission rights immediately.
    pub fn expire(&mut self) {
        self.granted = false;
        self.expired = true;
        self.canceled = false;
        self.cancel_count = 0;
        self.time_left = 0;
    }

    /// Whether a message should go out on this tick of the base-interval timer.
    pub fn pace(&mut self, base_log_interval: i8) -> bool {
        let shift = (self.log_interval as i32 - base_log_interval as i32).clamp(0, 16);
        let period = 1u32 << shift;
        let due = self.interval_counter % period == 0;
        self.interval_counter = self.interval_counter.wrapping_add(1);
        due
    }

    fn needs_refresh(&self) -> bool {
        !self.granted || self.time_left <= GRANT_REFRESH_MARGIN || self.time_left < self.duration / 5
    }
}

#[derive(Debug, Clone)]
pub struct UnicastGrantRow {
    /// Unknown until the first message from a configured destination.
    pub port_identity: Option<PortIdentity>,
    pub address: Ipv4Addr,
    pub grants: [UnicastGrantData; 4],
}

impl UnicastGrantRow {
    pub fn grant(&self, message_type: MessageType) -> Option<&UnicastGrantData> {
        grant_index(message_type).map(|i| &self.grants[i])
    }

    pub fn grant_mut(&mut self, message_type: MessageType) -> Option<&mut UnicastGrantData> {
        match grant_index(message_type) {
            Some(i) => Some(&mut self.grants[i]),
            None => None,
        }
    }

    pub fn is_granted(&self, message_type: MessageType) -> bool {
        self.grant(message_type).map(|g| g.granted).unwrap_or(false)
    }

    fn target(&self) -> PortIdentity {
        self.port_identity.unwrap_or(PortIdentity::ALL_ONES)
    }
}

/// Interval bounds applied to every new row.
#[derive(Debug, Clone, Copy)]
pub struct GrantLimits {
    /// (log_min, log_max) per entry of `GRANT_MESSAGE_TYPES`.
    pub intervals: [(i8, i8); 4],
    pub delay_mechanism: DelayMechanism,
    pub port_mask: u16,
}

impl GrantLimits {
    pub fn from_config(engine: &EngineConfig, unicast: &UnicastConfig) -> Self {
        GrantLimits {
            intervals: [
                (engine.log_announce_interval, unicast.log_max_announce_interval),
                (engine.log_sync_interval, unicast.log_max_sync_interval),
                (engine.log_min_delay_req_interval, unicast.log_max_delay_req_interval),
                (engine.log_min_pdelay_req_interval, unicast.log_max_pdelay_req_interval),
            ],
            delay_mechanism: engine.delay_mechanism,
            port_mask: unicast.port_mask,
        }
    }

    fn new_grants(&self) -> [UnicastGrantData; 4] {
        let requestable = |t: MessageType| match t {
            MessageType::Announce | MessageType::Sync => true,
            MessageType::DelayResp => self.delay_mechanism == DelayMechanism::E2E,
            MessageType::PdelayResp => self.delay_mechanism == DelayMechanism::P2P,
            _ => false,
        };
        let make = |i: usize| {
            let t = GRANT_MESSAGE_TYPES[i];
            let (min, max) = self.intervals[i];
            UnicastGrantData::new(t, min, max, requestable(t))
        };
        [make(0), make(1), make(2), make(3)]
    }
}

/// One unit of signaling work produced by the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GrantRef {
    pub address: Ipv4Addr,
    pub target: PortIdentity,
    pub message_type: MessageType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantEvent {
    Expired(GrantRef),
    ResendCancel(GrantRef),
    CancelAbandoned(GrantRef),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GrantRequest {
    pub grant: GrantRef,
    pub log_interval: i8,
    pub duration: u32,
}

pub struct UnicastGrantTable {
    rows: Vec<Option<UnicastGrantRow>>,
    index: HashMap<(PortIdentity, Ipv4Addr), usize>,
    /// Seeded rows whose port identity is not known yet.
    pending: HashMap<Ipv4Addr, usize>,
    limits: GrantLimits,
}

impl UnicastGrantTable {
    pub fn new(capacity: usize, limits: GrantLimits) -> Self {
        UnicastGrantTable {
            rows: (0..capacity.max(1)).map(|_| None).collect(),
            index: HashMap::with_capacity(capacity),
            pending: HashMap::new(),
            limits,
        }
    }

    pub fn capacity(&self) -> usize {
        self.rows.len()
    }

    pub fn len(&self) -> usize {
        self.rows.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn masked(&self, identity: &PortIdentity) -> PortIdentity {
        PortIdentity::new(identity.clock_identity, identity.port_number & !self.limits.port_mask)
    }

    /// Seed one row per configured destination. Destinations past capacity are dropped.
    pub fn init_unicast_grant_table(&mut self, destinations: &[Ipv4Addr]) {
        self.rows.iter_mut().for_each(|r| *r = None);
        self.index.clear();
        self.pending.clear();

        for (slot, &address) in destinations.iter().take(self.rows.len()).enumerate() {
            self.rows[slot] = Some(UnicastGrantRow {
                port_identity: None,
                address,
                grants: self.limits.new_grants(),
            });
            self.pending.insert(address, slot);
        }
        if destinations.len() > self.rows.len() {
            warn!(
                "[Unicast] {} destinations configured, only the first {} are used",
                destinations.len(),
                self.rows.len()
            );
        }
    }

    /// Locate the row for a peer. A seeded row matching `address` learns the
    /// identity. With `update`, a missing peer gets a new row if a slot is free.
    pub fn find_unicast_grants(&mut self, identity: &PortIdentity, address: Ipv4Addr, update: bool) -> Option<usize> {
        let key = (self.masked(identity), address);
        if let Some(&slot) = self.index.get(&key) {
            return Some(slot);
        }

        if let Some(slot) = self.pending.remove(&address) {
            if let Some(row) = self.rows[slot].as_mut() {
                row.port_identity = Some(*identity);
                debug!("[Unicast] Destination {} identified as {}", address, identity);
            }
            self.index.insert(key, slot);
            return Some(slot);
        }

        if !update {
            return None;
        }

        let slot = self.rows.iter().position(|r| r.is_none())?;
        self.rows[slot] = Some(UnicastGrantRow {
            port_identity: Some(*identity),
            address,
            grants: self.limits.new_grants(),
        });
        self.index.insert(key, slot);
        Some(slot)
    }

    pub fn row(&self, slot: usize) -> Option<&UnicastGrantRow> {
        self.rows.get(slot).and_then(|r| r.as_ref())
    }

    pub fn row_mut(&mut self, slot: usize) -> Option<&mut UnicastGrantRow> {
        self.rows.get_mut(slot).and_then(|r| r.as_mut())
    }

    pub fn rows(&self) -> impl Iterator<Item = &UnicastGrantRow> {
        self.rows.iter().flatten()
    }

    pub fn rows_mut(&mut self) -> impl Iterator<Item = &mut UnicastGrantRow> {
        self.rows.iter_mut().flatten()
    }

    /// One-second tick: count down grants, expire at zero, and drive cancel retries.
    pub fn update_unicast_grant_table(&mut self) -> Vec<GrantEvent> {
        let mut events = Vec::new();

        for row in self.rows.iter_mut().flatten() {
            let target = row.target();
            let address = row.address;
            for grant in row.grants.iter_mut() {
                let r = GrantRef {
                    address,
                    target,
                    message_type: grant.message_type,
                };

                if !grant.granted {
                    continue;
                }
                grant.time_left = grant.time_left.saturating_sub(1);
                if grant.time_left == 0 {
                    info!("[Unicast] {:?} grant with {} expired", grant.message_type, address);
                    grant.expire();
                    events.push(GrantEvent::Expired(r));
                    continue;
                }

                if grant.canceled {
                    if grant.cancel_count >= GRANT_CANCEL_ACK_RETRIES {
                        warn!(
                            "[Unicast] No cancel acknowledgement from {} for {:?} after {} attempts",
                            address, grant.message_type, grant.cancel_count
                        );
                        grant.expire();
                        events.push(GrantEvent::CancelAbandoned(r));
                    } else {
                        grant.cancel_count += 1;
                        events.push(GrantEvent::ResendCancel(r));
                    }
                }
            }
        }

        events
    }

    /// Requests to (re)send. Announce is requested from every destination;
    /// Sync and the delay response only from the current parent.
    pub fn refresh_unicast_grants(&mut self, parent: Option<Ipv4Addr>, duration: u32) -> Vec<GrantRequest> {
        let mut requests = Vec::new();

        for row in self.rows.iter_mut().flatten() {
            let target = row.target();
            let is_parent = parent == Some(row.address);
            for grant in row.grants.iter_mut() {
                if !grant.requestable || grant.canceled {
                    continue;
                }
                if grant.message_type != MessageType::Announce && !is_parent {
                    continue;
                }
                if !grant.needs_refresh() {
                    continue;
                }
                grant.requested = true;
                requests.push(GrantRequest {
                    grant: GrantRef {
                        address: row.address,
                        target,
                        message_type: grant.message_type,
                    },
                    log_interval: grant.log_interval,
                    duration,
                });
            }
        }

        requests
    }

    /// Start cancelling a grant. Returns the CANCEL to send, if the grant was live.
    pub fn cancel_unicast_transmission(&mut self, slot: usize, message_type: MessageType) -> Option<GrantRef> {
        let row = self.rows.get_mut(slot)?.as_mut()?;
        let target = row.target();
        let address = row.address;
        let grant = row.grant_mut(message_type)?;
        if !grant.granted || grant.canceled {
            return None;
        }
        grant.canceled = true;
        grant.cancel_count = 1;
        Some(GrantRef {
            address,
            target,
            message_type,
        })
    }

    /// Expire every live grant at once and return the CANCELs to send.
    pub fn cancel_all_grants(&mut self) -> Vec<GrantRef> {
        let mut cancels = Vec::new();
        for row in self.rows.iter_mut().flatten() {
            let target = row.target();
            for grant in row.grants.iter_mut() {
                if grant.granted {
                    cancels.push(GrantRef {
                        address: row.address,
                        target,
                        message_type: grant.message_type,
                    });
                }
                grant.expire();
                grant.requested = false;
            }
        }
        cancels
    }
}
