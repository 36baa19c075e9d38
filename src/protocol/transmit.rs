//! Outgoing messages and destination selection.

use log::{debug, warn};
use rand::Rng;
use std::net::Ipv4Addr;

use super::{log_interval_secs, next_sequence, PtpPort};
use crate::clock::SystemClock;
use crate::config::IpMode;
use crate::datasets::PortIdentity;
use crate::ptp::{
    AnnounceBody, Body, DelayRespBody, Flags, Header, Message, MessageType, PdelayRespBody,
    PdelayRespFollowUpBody, SignalingBody, SignalingTlv, UNICAST_MESSAGE_INTERVAL,
};
use crate::time::{TimeInternal, Timestamp};
use crate::timer::{PtpTimer, TimerService};
use crate::traits::{Channel, Destination, DriftStore, PtpNetwork};

impl<C, N, D, T> PtpPort<C, N, D, T>
where
    C: SystemClock,
    N: PtpNetwork,
    D: DriftStore,
    T: TimerService,
{
    pub(super) fn message_header(&self, message_type: MessageType, sequence_id: u16, log_interval: i8) -> Header {
        let mut flags = Flags {
            two_step: self.ds.default_ds.two_step_flag
                && matches!(message_type, MessageType::Sync | MessageType::PdelayResp),
            ..Default::default()
        };
        if message_type == MessageType::Announce {
            let tp = &self.ds.time_properties_ds;
            flags.leap61 = tp.leap61;
            flags.leap59 = tp.leap59;
            flags.current_utc_offset_valid = tp.current_utc_offset_valid;
            flags.ptp_timescale = tp.ptp_timescale;
            flags.time_traceable = tp.time_traceable;
            flags.frequency_traceable = tp.frequency_traceable;
        }

        Header {
            domain_number: self.ds.default_ds.domain_number,
            flags,
            source_port_identity: self.own_port_identity(),
            sequence_id,
            log_message_interval: log_interval,
            ..Default::default()
        }
    }

    /// Encode and send. Returns the transmit time (kernel timestamp when the
    /// network provides one, local clock otherwise), or None if sending failed.
    pub(super) fn send_message(&mut self, mut message: Message, destination: Destination) -> Option<TimeInternal> {
        let message_type = message.message_type();
        message.header.flags.unicast = matches!(destination, Destination::Unicast(_));
        let channel = if message_type.is_event() {
            Channel::Event
        } else {
            Channel::General
        };

        match self.net.send(channel, &message.encode(), destination) {
            Ok(timestamp) => {
                self.count_sent(message_type);
                Some(timestamp.unwrap_or_else(|| self.clock.now()))
            }
            Err(e) => {
                self.counters.message_send_errors += 1;
                warn!("[Net] Failed to send {:?} to {:?}: {:#}", message_type, destination, e);
                None
            }
        }
    }

    fn count_sent(&mut self, message_type: MessageType) {
        let c = &mut self.counters;
        match message_type {
            MessageType::Announce => c.announce_messages_sent += 1,
            MessageType::Sync => c.sync_messages_sent += 1,
            MessageType::FollowUp => c.follow_up_messages_sent += 1,
            MessageType::DelayReq => c.delay_req_messages_sent += 1,
            MessageType::DelayResp => c.delay_resp_messages_sent += 1,
            MessageType::PdelayReq => c.pdelay_req_messages_sent += 1,
            MessageType::PdelayResp => c.pdelay_resp_messages_sent += 1,
            MessageType::PdelayRespFollowUp => c.pdelay_resp_follow_up_messages_sent += 1,
            MessageType::Signaling => c.signaling_messages_sent += 1,
            MessageType::Management => {}
        }
    }

    fn outbound_latency(&self) -> TimeInternal {
        TimeInternal::from_nanos(self.config.clock.outbound_latency_ns)
    }

    // ========================================================================
    // DESTINATIONS
    // ========================================================================

    /// Where a periodic master message goes this tick. With negotiation each
    /// granted slave is paced against the port's base interval.
    fn master_destinations(&mut self, message_type: MessageType, base_log_interval: i8) -> Vec<Destination> {
        match self.config.ptpengine.ip_mode {
            IpMode::Multicast | IpMode::Hybrid => vec![Destination::Multicast],
            IpMode::Unicast if self.config.unicast.negotiation => self
                .slaves
                .rows_mut()
                .filter_map(|row| {
                    let address = row.address;
                    let grant = row.grant_mut(message_type)?;
                    (grant.granted && !grant.canceled && grant.pace(base_log_interval)).then_some(Destination::Unicast(address))
                })
                .collect(),
            IpMode::Unicast => self
                .config
                .unicast
                .destinations
                .iter()
                .map(|&a| Destination::Unicast(a))
                .collect(),
        }
    }

    fn header_interval(&self, log_interval: i8, destination: Destination) -> i8 {
        match destination {
            Destination::Unicast(_) if self.config.unicast.negotiation => UNICAST_MESSAGE_INTERVAL,
            _ => log_interval,
        }
    }

    fn reply_destination(&self, requester: Ipv4Addr, request: &Header, multicast: Destination) -> Destination {
        if self.config.ptpengine.ip_mode == IpMode::Multicast && !request.flags.unicast {
            multicast
        } else {
            Destination::Unicast(requester)
        }
    }

    fn parent_destination(&self, multicast: Destination) -> Option<Destination> {
        match self.config.ptpengine.ip_mode {
            IpMode::Multicast => Some(multicast),
            IpMode::Unicast | IpMode::Hybrid => self
                .parent_address()
                .or_else(|| self.config.unicast.destinations.first().copied())
                .map(Destination::Unicast),
        }
    }

    // ========================================================================
    // MASTER
    // ========================================================================

    /// Two-step Sync: an approximate origin timestamp, then a Follow_Up with
    /// the transmit timestamp.
    pub(super) fn issue_sync(&mut self) {
        let base = self.ds.port_ds.log_sync_interval;
        let destinations = self.master_destinations(MessageType::Sync, base);
        if destinations.is_empty() {
            return;
        }
        let sequence_id = next_sequence(&mut self.sequences.sync);

        for destination in destinations {
            let log_interval = self.header_interval(base, destination);
            let sync = Message::new(
                self.message_header(MessageType::Sync, sequence_id, log_interval),
                Body::Sync {
                    origin_timestamp: self.clock.now().to_wire(),
                },
            );
            let Some(sent_at) = self.send_message(sync, destination) else {
                continue;
            };

            let precise = sent_at + self.outbound_latency();
            let follow_up = Message::new(
                self.message_header(MessageType::FollowUp, sequence_id, log_interval),
                Body::FollowUp {
                    precise_origin_timestamp: precise.to_wire(),
                },
            );
            self.send_message(follow_up, destination);
        }
    }

    pub(super) fn issue_announce(&mut self) {
        let base = self.ds.port_ds.log_announce_interval;
        let destinations = self.master_destinations(MessageType::Announce, base);
        if destinations.is_empty() {
            return;
        }
        let sequence_id = next_sequence(&mut self.sequences.announce);

        let parent = &self.ds.parent_ds;
        let body = AnnounceBody {
            origin_timestamp: self.clock.now().to_wire(),
            current_utc_offset: self.ds.time_properties_ds.current_utc_offset,
            grandmaster_priority1: parent.grandmaster_priority1,
            grandmaster_clock_quality: parent.grandmaster_clock_quality,
            grandmaster_priority2: parent.grandmaster_priority2,
            grandmaster_identity: parent.grandmaster_identity,
            steps_removed: self.ds.current_ds.steps_removed,
            time_source: self.ds.time_properties_ds.time_source,
        };

        for destination in destinations {
            let log_interval = self.header_interval(base, destination);
            let announce = Message::new(
                self.message_header(MessageType::Announce, sequence_id, log_interval),
                Body::Announce(body.clone()),
            );
            self.send_message(announce, destination);
        }
    }

    /// Answer a Delay_Req with its receive time (t4).
    pub(super) fn issue_delay_resp(&mut self, request: &Header, requester: Ipv4Addr, receive_time: TimeInternal) {
        let mut header = self.message_header(
            MessageType::DelayResp,
            request.sequence_id,
            self.ds.port_ds.log_min_delay_req_interval,
        );
        header.correction_field = request.correction_field;
        let destination = self.reply_destination(requester, request, Destination::Multicast);
        let response = Message::new(
            header,
            Body::DelayResp(DelayRespBody {
                receive_timestamp: receive_time.to_wire(),
                requesting_port_identity: request.source_port_identity,
            }),
        );
        self.send_message(response, destination);
    }

    // ========================================================================
    // SLAVE
    // ========================================================================

    pub(super) fn issue_delay_req(&mut self) {
        self.arm_delay_req_timer();
        let Some(destination) = self.parent_destination(Destination::Multicast) else {
            debug!("[PTP] No parent address for Delay_Req");
            return;
        };

        let sequence_id = next_sequence(&mut self.sequences.delay_req);
        let request = Message::new(
            self.message_header(MessageType::DelayReq, sequence_id, UNICAST_MESSAGE_INTERVAL),
            Body::DelayReq {
                origin_timestamp: self.clock.now().to_wire(),
            },
        );
        let Some(sent_at) = self.send_message(request, destination) else {
            return;
        };

        self.delay.waiting_for_response = true;
        self.delay.sequence_id = sequence_id;
        self.delay.send_time = sent_at + self.outbound_latency();

        if !self.timers.is_running(PtpTimer::DelayReceipt) {
            let timeout = 2.0 * log_interval_secs(self.ds.port_ds.log_min_delay_req_interval);
            self.timers.start(PtpTimer::DelayReceipt, timeout.max(1.0));
        }
    }

    /// Re-arm the Delay_Req timer at a random 0.5 to 1.5 times the minimum interval.
    pub(super) fn arm_delay_req_timer(&mut self) {
        let base = log_interval_secs(self.ds.port_ds.log_min_delay_req_interval);
        let factor: f64 = self.rng.random_range(0.5..1.5);
        self.timers.start(PtpTimer::DelayReqInterval, base * factor);
    }

    // ========================================================================
    // PEER DELAY
    // ========================================================================

    pub(super) fn issue_pdelay_req(&mut self) {
        let Some(destination) = self.parent_destination(Destination::PeerMulticast) else {
            return;
        };
        if self.pdelay.waiting_for_response || self.pdelay.waiting_for_follow_up {
            debug!("[PTP] No Pdelay_Resp for Pdelay_Req {}", self.pdelay.sequence_id);
        }

        let sequence_id = next_sequence(&mut self.sequences.pdelay_req);
        let request = Message::new(
            self.message_header(
                MessageType::PdelayReq,
                sequence_id,
                self.ds.port_ds.log_min_pdelay_req_interval,
            ),
            Body::PdelayReq {
                origin_timestamp: Timestamp::default(),
            },
        );
        let Some(sent_at) = self.send_message(request, destination) else {
            return;
        };

        self.pdelay.waiting_for_response = true;
        self.pdelay.waiting_for_follow_up = false;
        self.pdelay.sequence_id = sequence_id;
        self.pdelay.t1 = sent_at + self.outbound_latency();
    }

    /// Two-step Pdelay_Resp carrying t2, then a Follow_Up carrying t3.
    pub(super) fn issue_pdelay_resp(&mut self, request: &Header, requester: Ipv4Addr, receive_time: TimeInternal) {
        let destination = self.reply_destination(requester, request, Destination::PeerMulticast);
        let mut header = self.message_header(MessageType::PdelayResp, request.sequence_id, UNICAST_MESSAGE_INTERVAL);
        header.correction_field = 0;
        let response = Message::new(
            header,
            Body::PdelayResp(PdelayRespBody {
                request_receipt_timestamp: receive_time.to_wire(),
                requesting_port_identity: request.source_port_identity,
            }),
        );
        let Some(sent_at) = self.send_message(response, destination) else {
            return;
        };

        let mut header = self.message_header(
            MessageType::PdelayRespFollowUp,
            request.sequence_id,
            UNICAST_MESSAGE_INTERVAL,
        );
        header.correction_field = request.correction_field;
        let follow_up = Message::new(
            header,
            Body::PdelayRespFollowUp(PdelayRespFollowUpBody {
                response_origin_timestamp: (sent_at + self.outbound_latency()).to_wire(),
                requesting_port_identity: request.source_port_identity,
            }),
        );
        self.send_message(follow_up, destination);
    }

    // ========================================================================
    // SIGNALING
    // ========================================================================

    pub(super) fn issue_signaling(&mut self, address: Ipv4Addr, target: PortIdentity, tlvs: Vec<SignalingTlv>) {
        if tlvs.is_empty() {
            return;
        }
        let sequence_id = next_sequence(&mut self.sequences.signaling);
        let message = Message::new(
            self.message_header(MessageType::Signaling, sequence_id, UNICAST_MESSAGE_INTERVAL),
            Body::Signaling(SignalingBody {
                target_port_identity: target,
                tlvs,
            }),
        );
        self.send_message(message, Destination::Unicast(address));
    }
}
