//! Inbound datagram checks and per-message handlers.

use log::{debug, info, trace, warn};
use std::net::Ipv4Addr;
use std::time::Duration;

use super::{log_interval_secs, PtpPort};
use crate::clock::SystemClock;
use crate::datasets::{DelayMechanism, PortState};
use crate::foreign::{ForeignKey, ForeignUpdate};
use crate::ptp::{
    self, AnnounceBody, Body, DelayRespBody, Header, Message, MessageType, PdelayRespBody,
    PdelayRespFollowUpBody, WireError, UNICAST_MESSAGE_INTERVAL,
};
use crate::time::{TimeInternal, Timestamp};
use crate::timer::{PtpTimer, TimerService};
use crate::traits::{DriftStore, PtpNetwork, ReceivedPacket};

/// Announce steps_removed at or above this is ignored.
const MAX_STEPS_REMOVED: u16 = 255;

fn interval_duration(log_interval: i8) -> Duration {
    Duration::from_secs_f64(log_interval_secs(log_interval))
}

impl<C, N, D, T> PtpPort<C, N, D, T>
where
    C: SystemClock,
    N: PtpNetwork,
    D: DriftStore,
    T: TimerService,
{
    pub(super) fn handle_packet(&mut self, packet: ReceivedPacket) {
        let message = match ptp::decode(&packet.data) {
            Ok(m) => m,
            Err(WireError::UnsupportedVersion(version)) => {
                self.counters.version_mismatch_errors += 1;
                debug!("[PTP] Ignoring PTP version {} message from {}", version, packet.source);
                return;
            }
            Err(WireError::UnknownMessageType(kind)) => {
                self.counters.unknown_messages += 1;
                debug!("[PTP] Unknown message type 0x{:x} from {}", kind, packet.source);
                return;
            }
            Err(e) => {
                self.counters.message_format_errors += 1;
                debug!("[PTP] Malformed message from {}: {}", packet.source, e);
                return;
            }
        };

        if !self.accept_header(&message, packet.source) {
            return;
        }

        let receive_time = packet.timestamp - TimeInternal::from_nanos(self.config.clock.inbound_latency_ns);
        let source = packet.source;
        let Message { header, body } = message;

        match body {
            Body::Announce(announce) => self.handle_announce(header, announce, source),
            Body::Sync { origin_timestamp } => self.handle_sync(&header, origin_timestamp, source, receive_time),
            Body::FollowUp {
                precise_origin_timestamp,
            } => self.handle_follow_up(&header, precise_origin_timestamp),
            Body::DelayReq { .. } => self.handle_delay_req(&header, source, receive_time),
            Body::DelayResp(response) => self.handle_delay_resp(&header, &response, source),
            Body::PdelayReq { .. } => self.handle_pdelay_req(&header, source, receive_time),
            Body::PdelayResp(response) => self.handle_pdelay_resp(&header, &response, receive_time),
            Body::PdelayRespFollowUp(follow_up) => self.handle_pdelay_resp_follow_up(&header, &follow_up),
            Body::Signaling(signaling) => self.handle_signaling(&header, signaling, source),
            Body::Management(_) => {
                self.counters.management_messages_received += 1;
                self.counters.discarded_messages += 1;
                trace!("[PTP] Management message from {} discarded", source);
            }
        }
    }

    /// Checks every message passes before dispatch.
    fn accept_header(&mut self, message: &Message, source: Ipv4Addr) -> bool {
        let header = &message.header;

        if !self.config.ptpengine.any_domain && header.domain_number != self.ds.default_ds.domain_number {
            self.counters.domain_mismatch_errors += 1;
            trace!("[PTP] Domain {} message from {} ignored", header.domain_number, source);
            return false;
        }

        // multicast loopback
        if header.source_port_identity.clock_identity == self.ds.default_ds.clock_identity {
            return false;
        }

        let mismatch = match message.message_type() {
            MessageType::DelayReq | MessageType::DelayResp => {
                self.ds.port_ds.delay_mechanism == DelayMechanism::P2P
            }
            MessageType::PdelayReq | MessageType::PdelayResp | MessageType::PdelayRespFollowUp => {
                self.ds.port_ds.delay_mechanism == DelayMechanism::E2E
            }
            _ => false,
        };
        if mismatch {
            self.counters.delay_mechanism_mismatch_errors += 1;
            debug!(
                "[PTP] {:?} from {} does not match delay mechanism {:?}",
                message.message_type(),
                source,
                self.ds.port_ds.delay_mechanism
            );
            return false;
        }

        if matches!(
            self.state(),
            PortState::Initializing | PortState::Faulty | PortState::Disabled
        ) {
            self.counters.discarded_messages += 1;
            return false;
        }

        true
    }

    fn is_from_parent(&self, header: &Header) -> bool {
        self.state().is_slave_like() && header.source_port_identity == self.ds.parent_ds.parent_port_identity
    }

    // ========================================================================
    // ANNOUNCE
    // ========================================================================

    fn handle_announce(&mut self, header: Header, announce: AnnounceBody, source: Ipv4Addr) {
        self.counters.announce_messages_received += 1;

        if announce.steps_removed >= MAX_STEPS_REMOVED {
            self.counters.ignored_announces += 1;
            debug!("[PTP] Announce from {} with steps_removed {} ignored", source, announce.steps_removed);
            return;
        }
        if !self.unicast_allowed(&header, source, MessageType::Announce) {
            self.counters.ignored_announces += 1;
            debug!("[Unicast] Announce from {} without an Announce grant", source);
            return;
        }

        let key = ForeignKey {
            port_identity: header.source_port_identity,
            address: source,
        };
        let from_best = self.best_master == Some(key);

        let log_interval = if header.log_message_interval == UNICAST_MESSAGE_INTERVAL {
            self.granted_announce_interval(&key)
                .unwrap_or(self.ds.port_ds.log_announce_interval)
        } else {
            header.log_message_interval
        };

        match self.foreign.update(
            key,
            header.clone(),
            announce.clone(),
            self.uptime,
            interval_duration(log_interval),
        ) {
            ForeignUpdate::Inserted => {
                self.counters.foreign_added += 1;
                info!(
                    "[PTP] New foreign master {} at {} (p1 {}, class {})",
                    key.port_identity,
                    source,
                    announce.grandmaster_priority1,
                    announce.grandmaster_clock_quality.clock_class
                );
            }
            ForeignUpdate::Updated => {}
            ForeignUpdate::Replaced(old) => {
                self.counters.foreign_added += 1;
                self.counters.foreign_removed += 1;
                info!("[PTP] Foreign master {} replaced {}", key.port_identity, old.port_identity);
            }
            ForeignUpdate::Rejected => {
                self.counters.foreign_overflows += 1;
                warn!(
                    "[PTP] Foreign master table full ({} records), Announce from {} dropped",
                    self.foreign.capacity(),
                    source
                );
                return;
            }
        }

        if from_best && matches!(self.state(), PortState::Slave | PortState::Uncalibrated | PortState::Passive) {
            let timeout = self.ds.port_ds.announce_receipt_timeout as f64
                * log_interval_secs(self.ds.port_ds.log_announce_interval);
            self.timers.start(PtpTimer::AnnounceReceipt, timeout);
            self.announce_grace_used = 0;
        }

        self.record_update = true;
    }

    // ========================================================================
    // SYNC / FOLLOW_UP
    // ========================================================================

    fn handle_sync(&mut self, header: &Header, origin: Timestamp, source: Ipv4Addr, receive_time: TimeInternal) {
        self.counters.sync_messages_received += 1;

        if !self.is_from_parent(header) {
            trace!("[PTP] Sync from {} is not from our parent", source);
            return;
        }
        if !self.unicast_allowed(header, source, MessageType::Sync) {
            self.counters.discarded_messages += 1;
            return;
        }
        if !self.check_sync_sequence(header.sequence_id) {
            return;
        }

        let log_sync = header.log_message_interval;
        if log_sync != UNICAST_MESSAGE_INTERVAL && log_sync != self.ds.port_ds.log_sync_interval {
            info!(
                "[PTP] Master sync interval changed from {} to {}",
                self.ds.port_ds.log_sync_interval, log_sync
            );
            self.ds.port_ds.log_sync_interval = log_sync;
            self.servo.set_interval(log_sync);
        }
        let sync_receipt =
            self.ds.port_ds.announce_receipt_timeout as f64 * log_interval_secs(self.ds.port_ds.log_sync_interval);
        self.timers.start(PtpTimer::SyncReceipt, sync_receipt);

        if self.ds.port_ds.delay_mechanism == DelayMechanism::E2E && !self.timers.is_running(PtpTimer::DelayReqInterval) {
            self.arm_delay_req_timer();
        }

        self.sync.sequence_id = header.sequence_id;
        self.sync.receive_time = receive_time;
        let correction = TimeInternal::from_correction(header.correction_field);

        if header.flags.two_step {
            self.sync.waiting_for_follow_up = true;
            self.sync.correction = correction;
        } else {
            self.sync.waiting_for_follow_up = false;
            let t1 = TimeInternal::from_wire(&origin);
            if self.update_offset(t1, receive_time, correction) {
                self.update_clock();
            }
        }
    }

    /// Serial-number check: accept strictly newer sequence ids, gaps included.
    fn check_sync_sequence(&mut self, sequence_id: u16) -> bool {
        if !self.config.ptpengine.sync_sequence_checking {
            self.sync.last_sequence_id = Some(sequence_id);
            return true;
        }

        if let Some(last) = self.sync.last_sequence_id {
            if sequence_id.wrapping_sub(last) as i16 <= 0 {
                self.counters.sequence_mismatch_errors += 1;
                self.counters.consecutive_sequence_errors += 1;
                debug!("[PTP] Sync sequence {} after {} rejected", sequence_id, last);

                if self.counters.consecutive_sequence_errors > self.config.ptpengine.max_sequence_errors {
                    warn!(
                        "[PTP] {} consecutive Sync sequence errors, resetting to listening",
                        self.counters.consecutive_sequence_errors
                    );
                    self.counters.protocol_errors += 1;
                    self.counters.consecutive_sequence_errors = 0;
                    self.to_state(PortState::Listening);
                }
                return false;
            }
        }

        self.counters.consecutive_sequence_errors = 0;
        self.sync.last_sequence_id = Some(sequence_id);
        true
    }

    fn handle_follow_up(&mut self, header: &Header, precise_origin: Timestamp) {
        self.counters.follow_up_messages_received += 1;

        if !self.is_from_parent(header) {
            return;
        }
        if !self.sync.waiting_for_follow_up || header.sequence_id != self.sync.sequence_id {
            self.counters.discarded_messages += 1;
            trace!("[PTP] Unexpected Follow_Up {}", header.sequence_id);
            return;
        }
        self.sync.waiting_for_follow_up = false;

        let t1 = TimeInternal::from_wire(&precise_origin);
        let correction = self.sync.correction + TimeInternal::from_correction(header.correction_field);
        if self.update_offset(t1, self.sync.receive_time, correction) {
            self.update_clock();
        }
    }

    // ========================================================================
    // DELAY REQUEST / RESPONSE
    // ========================================================================

    fn handle_delay_req(&mut self, header: &Header, source: Ipv4Addr, receive_time: TimeInternal) {
        self.counters.delay_req_messages_received += 1;
        if self.state() != PortState::Master {
            return;
        }
        if header.flags.unicast && self.config.unicast.negotiation && !self.slave_granted(header, source, MessageType::DelayResp) {
            self.counters.discarded_messages += 1;
            debug!("[Unicast] Delay_Req from {} without a Delay_Resp grant", source);
            return;
        }
        self.issue_delay_resp(header, source, receive_time);
    }

    fn handle_delay_resp(&mut self, header: &Header, response: &DelayRespBody, source: Ipv4Addr) {
        self.counters.delay_resp_messages_received += 1;

        if !self.is_from_parent(header) || !self.unicast_allowed(header, source, MessageType::DelayResp) {
            return;
        }
        if response.requesting_port_identity != self.own_port_identity() {
            return;
        }
        if !self.delay.waiting_for_response || header.sequence_id != self.delay.sequence_id {
            self.counters.discarded_messages += 1;
            trace!("[PTP] Unexpected Delay_Resp {}", header.sequence_id);
            return;
        }
        self.delay.waiting_for_response = false;
        self.timers.stop(PtpTimer::DelayReceipt);

        let log_delay = header.log_message_interval;
        if log_delay != UNICAST_MESSAGE_INTERVAL && log_delay != self.ds.port_ds.log_min_delay_req_interval {
            info!(
                "[PTP] Master delay request interval changed from {} to {}",
                self.ds.port_ds.log_min_delay_req_interval, log_delay
            );
            self.ds.port_ds.log_min_delay_req_interval = log_delay;
        }

        let t4 = TimeInternal::from_wire(&response.receive_timestamp);
        let correction = TimeInternal::from_correction(header.correction_field);
        self.update_delay(self.delay.send_time, t4, correction);
    }

    // ========================================================================
    // PEER DELAY
    // ========================================================================

    fn handle_pdelay_req(&mut self, header: &Header, source: Ipv4Addr, receive_time: TimeInternal) {
        self.counters.pdelay_req_messages_received += 1;
        if header.flags.unicast && self.config.unicast.negotiation && !self.slave_granted(header, source, MessageType::PdelayResp) {
            self.counters.discarded_messages += 1;
            return;
        }
        self.issue_pdelay_resp(header, source, receive_time);
    }

    fn handle_pdelay_resp(&mut self, header: &Header, response: &PdelayRespBody, receive_time: TimeInternal) {
        self.counters.pdelay_resp_messages_received += 1;

        if response.requesting_port_identity != self.own_port_identity() {
            return;
        }
        if !self.pdelay.waiting_for_response || header.sequence_id != self.pdelay.sequence_id {
            self.counters.discarded_messages += 1;
            return;
        }

        self.pdelay.t4 = receive_time;
        self.pdelay.t2 = TimeInternal::from_wire(&response.request_receipt_timestamp);
        self.pdelay.correction = TimeInternal::from_correction(header.correction_field);

        if header.flags.two_step {
            self.pdelay.waiting_for_response = false;
            self.pdelay.waiting_for_follow_up = true;
        } else {
            self.update_peer_delay(None);
        }
    }

    fn handle_pdelay_resp_follow_up(&mut self, header: &Header, follow_up: &PdelayRespFollowUpBody) {
        self.counters.pdelay_resp_follow_up_messages_received += 1;

        if follow_up.requesting_port_identity != self.own_port_identity() {
            return;
        }
        if !self.pdelay.waiting_for_follow_up || header.sequence_id != self.pdelay.sequence_id {
            self.counters.discarded_messages += 1;
            return;
        }

        self.pdelay.correction = self.pdelay.correction + TimeInternal::from_correction(header.correction_field);
        let t3 = TimeInternal::from_wire(&follow_up.response_origin_timestamp);
        self.update_peer_delay(Some(t3));
    }
}
