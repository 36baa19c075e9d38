//! Bounded table of foreign master candidates learned from Announce messages.
//!
//! Records live in a fixed number of slots with a hash index from
//! (sender port identity, source address) to slot. The table never grows:
//! when every slot is taken a newcomer may only replace a disqualified or
//! stale record, otherwise it is rejected and the caller counts an overflow.

use std::collections::{HashMap, VecDeque};
use std::net::Ipv4Addr;
use std::time::Duration;

use crate::datasets::PortIdentity;
use crate::ptp::{AnnounceBody, Header};

/// Announce intervals over which qualifying messages are counted.
const FOREIGN_MASTER_TIME_WINDOW: u32 = 4;
/// Receipt times kept per record; more than any sane threshold needs.
const MAX_ANNOUNCE_MESSAGES: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ForeignKey {
    pub port_identity: PortIdentity,
    pub address: Ipv4Addr,
}

#[derive(Debug, Clone)]
pub struct ForeignMasterRecord {
    pub key: ForeignKey,
    pub header: Header,
    pub announce: AnnounceBody,
    pub disqualified: bool,
    /// Uptime of the most recent Announce.
    pub last_announce: Duration,
    announce_interval: Duration,
    receipts: VecDeque<Duration>,
}

impl ForeignMasterRecord {
    fn new(key: ForeignKey, header: Header, announce: AnnounceBody, now: Duration, interval: Duration) -> Self {
        let mut receipts = VecDeque::with_capacity(MAX_ANNOUNCE_MESSAGES);
        receipts.push_back(now);
        ForeignMasterRecord {
            key,
            header,
            announce,
            disqualified: false,
            last_announce: now,
            announce_interval: interval,
            receipts,
        }
    }

    fn register(&mut self, header: Header, announce: AnnounceBody, now: Duration, interval: Duration) {
        self.header = header;
        self.announce = announce;
        self.disqualified = false;
        self.last_announce = now;
        self.announce_interval = interval;
        if self.receipts.len() == MAX_ANNOUNCE_MESSAGES {
            self.receipts.pop_front();
        }
        self.receipts.push_back(now);
    }

    /// Announces received within the qualification window ending at `now`.
    pub fn qualification_count(&self, now: Duration) -> usize {
        let window = self.announce_interval * FOREIGN_MASTER_TIME_WINDOW;
        self.receipts
            .iter()
            .filter(|&&t| now.saturating_sub(t) <= window)
            .count()
    }

    pub fn is_stale(&self, now: Duration, receipt_timeout: u8) -> bool {
        now.saturating_sub(self.last_announce) > self.announce_interval * receipt_timeout as u32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForeignUpdate {
    Inserted,
    Updated,
    /// A stale or disqualified record was evicted to make room.
    Replaced(ForeignKey),
    /// Table full of live records; the Announce is dropped.
    Rejected,
}

pub struct ForeignMasterTable {
    slots: Vec<Option<ForeignMasterRecord>>,
    index: HashMap<ForeignKey, usize>,
    receipt_timeout: u8,
}

impl ForeignMasterTable {
    pub fn new(capacity: usize, receipt_timeout: u8) -> Self {
        ForeignMasterTable {
            slots: (0..capacity.max(1)).map(|_| None).collect(),
            index: HashMap::with_capacity(capacity),
            receipt_timeout,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(|s| *s = None);
        self.index.clear();
    }

    pub fn get(&self, key: &ForeignKey) -> Option<&ForeignMasterRecord> {
        self.index.get(key).and_then(|&i| self.slots[i].as_ref())
    }

    pub fn get_mut(&mut self, key: &ForeignKey) -> Option<&mut ForeignMasterRecord> {
        match self.index.get(key) {
            Some(&i) => self.slots[i].as_mut(),
            None => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &ForeignMasterRecord> {
        self.slots.iter().flatten()
    }

    pub fn update(
        &mut self,
        key: ForeignKey,
        header: Header,
        announce: AnnounceBody,
        now: Duration,
        interval: Duration,
    ) -> ForeignUpdate {
        if let Some(record) = self.get_mut(&key) {
            record.register(header, announce, now, interval);
            return ForeignUpdate::Updated;
        }

        if let Some(free) = self.slots.iter().position(|s| s.is_none()) {
            self.slots[free] = Some(ForeignMasterRecord::new(key, header, announce, now, interval));
            self.index.insert(key, free);
            return ForeignUpdate::Inserted;
        }

        // Oldest replaceable record, disqualified ones first
        let timeout = self.receipt_timeout;
        let victim = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|r| (i, r)))
            .filter(|(_, r)| r.disqualified || r.is_stale(now, timeout))
            .min_by_key(|(_, r)| (!r.disqualified, r.last_announce, r.key))
            .map(|(i, r)| (i, r.key));

        match victim {
            Some((slot, old_key)) => {
                self.index.remove(&old_key);
                self.slots[slot] = Some(ForeignMasterRecord::new(key, header, announce, now, interval));
                self.index.insert(key, slot);
                ForeignUpdate::Replaced(old_key)
            }
            None => ForeignUpdate::Rejected,
        }
    }

    pub fn remove(&mut self, key: &ForeignKey) -> Option<ForeignMasterRecord> {
        let slot = self.index.remove(key)?;
        self.slots[slot].take()
    }

    pub fn disqualify(&mut self, key: &ForeignKey) -> bool {
        match self.get_mut(key) {
            Some(record) => {
                record.disqualified = true;
                true
            }
            None => false,
        }
    }

    /// Drop records whose announce-receipt timeout has elapsed. Returns how many were removed.
    pub fn purge_stale(&mut self, now: Duration) -> usize {
        let timeout = self.receipt_timeout;
        let stale: Vec<ForeignKey> = self
            .iter()
            .filter(|r| r.is_stale(now, timeout))
            .map(|r| r.key)
            .collect();
        for key in &stale {
            self.remove(key);
        }
        stale.len()
    }

    /// Records usable by the BMC: qualified, not disqualified and not stale.
    pub fn eligible(&self, now: Duration, threshold: u16) -> Vec<&ForeignMasterRecord> {
        self.iter()
            .filter(|r| !r.disqualified)
            .filter(|r| !r.is_stale(now, self.receipt_timeout))
            .filter(|r| r.qualification_count(now) >= threshold as usize)
            .collect()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::datasets::{ClockIdentity, ClockQuality};
    use crate::ptp::Header;
    use crate::time::Timestamp;

    pub(crate) fn announce_from(id: u8, priority1: u8, clock_class: u8) -> (Header, AnnounceBody) {
        let identity = ClockIdentity([id; 8]);
        let header = Header {
            source_port_identity: PortIdentity::new(identity, 1),
            log_message_interval: 0,
            ..Default::default()
        };
        let announce = AnnounceBody {
            origin_timestamp: Timestamp::default(),
            current_utc_offset: 37,
            grandmaster_priority1: priority1,
            grandmaster_clock_quality: ClockQuality {
                clock_class,
                clock_accuracy: 0x21,
                offset_scaled_log_variance: 0x4e5d,
            },
            grandmaster_priority2: 128,
            grandmaster_identity: identity,
            steps_removed: 0,
            time_source: 0x20,
        };
        (header, announce)
    }

    fn key(id: u8) -> ForeignKey {
        ForeignKey {
            port_identity: PortIdentity::new(ClockIdentity([id; 8]), 1),
            address: Ipv4Addr::new(10, 0, 0, id),
        }
    }

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    fn add(table: &mut ForeignMasterTable, id: u8, now: Duration) -> ForeignUpdate {
        let (h, a) = announce_from(id, 128, 248);
        table.update(key(id), h, a, now, secs(1))
    }

    #[test]
    fn test_insert_and_update() {
        let mut table = ForeignMasterTable::new(2, 3);
        assert_eq!(add(&mut table, 1, secs(0)), ForeignUpdate::Inserted);
        assert_eq!(add(&mut table, 1, secs(1)), ForeignUpdate::Updated);
        assert_eq!(table.len(), 1);
        assert_eq!(table.get(&key(1)).unwrap().qualification_count(secs(1)), 2);
    }

    #[test]
    fn test_full_table_rejects_live_newcomer() {
        let mut table = ForeignMasterTable::new(2, 3);
        add(&mut table, 1, secs(0));
        add(&mut table, 2, secs(0));
        assert_eq!(add(&mut table, 3, secs(1)), ForeignUpdate::Rejected);
        assert!(table.get(&key(3)).is_none());
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_full_table_replaces_disqualified_then_stale() {
        let mut table = ForeignMasterTable::new(2, 3);
        add(&mut table, 1, secs(0));
        add(&mut table, 2, secs(1));

        table.disqualify(&key(2));
        assert_eq!(add(&mut table, 3, secs(2)), ForeignUpdate::Replaced(key(2)));

        // key(1) last heard at 0 s, stale after 3 x 1 s
        assert_eq!(add(&mut table, 4, secs(5)), ForeignUpdate::Replaced(key(1)));
        assert!(table.get(&key(4)).is_some());
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_qualification_window() {
        let mut table = ForeignMasterTable::new(4, 3);
        add(&mut table, 1, secs(0));
        assert!(table.eligible(secs(0), 2).is_empty());
        add(&mut table, 1, secs(1));
        assert_eq!(table.eligible(secs(1), 2).len(), 1);

        // Announces 10 s apart never accumulate inside a 4 s window
        add(&mut table, 2, secs(10));
        add(&mut table, 2, secs(20));
        assert!(table.eligible(secs(20), 2).iter().all(|r| r.key != key(2)));
    }

    #[test]
    fn test_purge_stale() {
        let mut table = ForeignMasterTable::new(4, 3);
        add(&mut table, 1, secs(0));
        add(&mut table, 2, secs(2));
        assert_eq!(table.purge_stale(secs(4)), 1);
        assert!(table.get(&key(1)).is_none());
        assert!(table.get(&key(2)).is_some());
    }
}
