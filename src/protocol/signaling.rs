//! Unicast negotiation: REQUEST / GRANT / CANCEL / ACK_CANCEL handling and
//! the periodic grant tick.

use log::{debug, info, warn};
use std::net::Ipv4Addr;

use super::PtpPort;
use crate::clock::SystemClock;
use crate::datasets::{PortIdentity, PortState};
use crate::foreign::ForeignKey;
use crate::ptp::{Header, MessageType, SignalingBody, SignalingTlv};
use crate::timer::TimerService;
use crate::traits::{DriftStore, PtpNetwork};
use crate::unicast::{GrantEvent, GrantRef, UnicastGrantTable, GRANT_MESSAGE_TYPES};

/// Group per-peer TLVs so each peer gets one signaling message.
fn group_by_peer(items: impl IntoIterator<Item = (Ipv4Addr, PortIdentity, SignalingTlv)>) -> Vec<(Ipv4Addr, PortIdentity, Vec<SignalingTlv>)> {
    let mut groups: Vec<(Ipv4Addr, PortIdentity, Vec<SignalingTlv>)> = Vec::new();
    for (address, target, tlv) in items {
        match groups.iter_mut().find(|(a, t, _)| *a == address && *t == target) {
            Some((_, _, tlvs)) => tlvs.push(tlv),
            None => groups.push((address, target, vec![tlv])),
        }
    }
    groups
}

fn cancel_tlv(r: &GrantRef) -> (Ipv4Addr, PortIdentity, SignalingTlv) {
    (
        r.address,
        r.target,
        SignalingTlv::CancelUnicast {
            message_type: r.message_type,
        },
    )
}

impl<C, N, D, T> PtpPort<C, N, D, T>
where
    C: SystemClock,
    N: PtpNetwork,
    D: DriftStore,
    T: TimerService,
{
    pub(super) fn handle_signaling(&mut self, header: &Header, body: SignalingBody, source: Ipv4Addr) {
        self.counters.signaling_messages_received += 1;

        let own = self.own_port_identity();
        let target = body.target_port_identity;
        let mask = self.config.unicast.port_mask;
        if target != PortIdentity::ALL_ONES && !target.matches(&own, mask) {
            debug!("[Unicast] Signaling from {} for {} is not for us", source, target);
            return;
        }

        let sender = header.source_port_identity;
        let mut replies = Vec::new();

        for tlv in body.tlvs {
            match tlv {
                SignalingTlv::RequestUnicast {
                    message_type,
                    log_interval,
                    duration,
                } => replies.push(self.handle_grant_request(&sender, source, message_type, log_interval, duration)),
                SignalingTlv::GrantUnicast {
                    message_type,
                    log_interval,
                    duration,
                    ..
                } => self.handle_grant(&sender, source, message_type, log_interval, duration),
                SignalingTlv::CancelUnicast { message_type } => {
                    replies.push(self.handle_cancel(&sender, source, message_type));
                }
                SignalingTlv::AckCancelUnicast { message_type } => self.handle_cancel_ack(&sender, source, message_type),
            }
        }

        self.issue_signaling(source, sender, replies);
    }

    /// Master side: decide on a REQUEST and produce the GRANT (zero duration denies).
    fn handle_grant_request(
        &mut self,
        requester: &PortIdentity,
        source: Ipv4Addr,
        message_type: MessageType,
        log_interval: i8,
        duration: u32,
    ) -> SignalingTlv {
        self.counters.unicast_grants_requested += 1;
        let deny = SignalingTlv::GrantUnicast {
            message_type,
            log_interval,
            duration: 0,
            renewal_invited: false,
        };

        if !GRANT_MESSAGE_TYPES.contains(&message_type) {
            self.counters.unicast_grants_denied += 1;
            return deny;
        }
        if self.state() != PortState::Master && !self.config.unicast.negotiation_listening {
            self.counters.unicast_grants_denied += 1;
            debug!("[Unicast] {:?} request from {} denied in state {}", message_type, source, self.state());
            return deny;
        }

        let Some(slot) = self.slaves.find_unicast_grants(requester, source, true) else {
            self.counters.unicast_grants_denied += 1;
            warn!("[Unicast] Grant table full, {:?} request from {} denied", message_type, source);
            return deny;
        };

        let max_duration = self.config.unicast.max_grant_duration;
        let Some(grant) = self.slaves.row_mut(slot).and_then(|r| r.grant_mut(message_type)) else {
            self.counters.unicast_grants_denied += 1;
            return deny;
        };
        if !grant.requestable || log_interval > grant.log_max_interval {
            self.counters.unicast_grants_denied += 1;
            debug!(
                "[Unicast] {:?} at log interval {} for {} denied (max {})",
                message_type, log_interval, source, grant.log_max_interval
            );
            return deny;
        }

        let granted_interval = log_interval.max(grant.log_min_interval);
        let granted_duration = duration.min(max_duration);
        grant.grant(granted_interval, granted_duration);
        self.counters.unicast_grants_granted += 1;
        info!(
            "[Unicast] Granted {:?} to {} at log interval {} for {} s",
            message_type, source, granted_interval, granted_duration
        );

        SignalingTlv::GrantUnicast {
            message_type,
            log_interval: granted_interval,
            duration: granted_duration,
            renewal_invited: true,
        }
    }

    /// Slave side: a master answered one of our requests.
    fn handle_grant(
        &mut self,
        granter: &PortIdentity,
        source: Ipv4Addr,
        message_type: MessageType,
        log_interval: i8,
        duration: u32,
    ) {
        let Some(slot) = self.destinations.find_unicast_grants(granter, source, false) else {
            debug!("[Unicast] Unsolicited grant from {}", source);
            return;
        };
        let Some(grant) = self.destinations.row_mut(slot).and_then(|r| r.grant_mut(message_type)) else {
            return;
        };

        if duration == 0 {
            grant.deny();
            self.counters.unicast_grants_denied += 1;
            warn!(
                "[Unicast] {} denied {:?}, next request at log interval {}",
                source, message_type, grant.log_interval
            );
            return;
        }

        grant.grant(log_interval, duration);
        self.counters.unicast_grants_granted += 1;
        info!(
            "[Unicast] {} granted {:?} at log interval {} for {} s",
            source, message_type, log_interval, duration
        );

        if self.parent_address() == Some(source) {
            match message_type {
                MessageType::Sync => {
                    self.ds.port_ds.log_sync_interval = log_interval;
                    self.servo.set_interval(log_interval);
                }
                MessageType::DelayResp => self.ds.port_ds.log_min_delay_req_interval = log_interval,
                MessageType::PdelayResp => self.ds.port_ds.log_min_pdelay_req_interval = log_interval,
                _ => {}
            }
        }
    }

    /// Either side: the peer stops a grant. Always acknowledged.
    fn handle_cancel(&mut self, sender: &PortIdentity, source: Ipv4Addr, message_type: MessageType) -> SignalingTlv {
        self.counters.unicast_grants_cancel_received += 1;
        self.counters.unicast_grants_cancel_ack_sent += 1;
        info!("[Unicast] {} cancelled {:?}", source, message_type);

        for table in [&mut self.destinations, &mut self.slaves] {
            if let Some(grant) = table
                .find_unicast_grants(sender, source, false)
                .and_then(|slot| table.row_mut(slot))
                .and_then(|row| row.grant_mut(message_type))
            {
                grant.expire();
                grant.requested = false;
            }
        }

        SignalingTlv::AckCancelUnicast { message_type }
    }

    fn handle_cancel_ack(&mut self, sender: &PortIdentity, source: Ipv4Addr, message_type: MessageType) {
        self.counters.unicast_grants_cancel_ack_received += 1;

        for table in [&mut self.destinations, &mut self.slaves] {
            if let Some(grant) = table
                .find_unicast_grants(sender, source, false)
                .and_then(|slot| table.row_mut(slot))
                .and_then(|row| row.grant_mut(message_type))
            {
                if grant.canceled {
                    debug!("[Unicast] {} acknowledged cancel of {:?}", source, message_type);
                    grant.expire();
                }
            }
        }
    }

    // ========================================================================
    // GRANT TICK
    // ========================================================================

    /// One-second tick of both grant tables, then slave-side refresh.
    pub(super) fn unicast_grant_tick(&mut self) {
        let mut cancels = Vec::new();
        for event in self
            .destinations
            .update_unicast_grant_table()
            .into_iter()
            .chain(self.slaves.update_unicast_grant_table())
        {
            match event {
                GrantEvent::ResendCancel(r) => cancels.push(r),
                GrantEvent::Expired(r) => debug!("[Unicast] {:?} grant with {} expired", r.message_type, r.address),
                GrantEvent::CancelAbandoned(_) => {}
            }
        }
        self.send_cancels(&cancels);

        if !self.config.unicast.negotiation || self.state() == PortState::Master {
            return;
        }

        let parent = self.parent_address();
        let duration = self.config.unicast.grant_duration;
        let requests = self.destinations.refresh_unicast_grants(parent, duration);
        self.counters.unicast_grants_requested += requests.len() as u32;

        let tlvs = requests.iter().map(|r| {
            (
                r.grant.address,
                r.grant.target,
                SignalingTlv::RequestUnicast {
                    message_type: r.grant.message_type,
                    log_interval: r.log_interval,
                    duration: r.duration,
                },
            )
        });
        for (address, target, tlvs) in group_by_peer(tlvs) {
            debug!("[Unicast] Requesting {} grant(s) from {}", tlvs.len(), address);
            self.issue_signaling(address, target, tlvs);
        }
    }

    fn send_cancels(&mut self, cancels: &[GrantRef]) {
        if cancels.is_empty() {
            return;
        }
        self.counters.unicast_grants_cancel_sent += cancels.len() as u32;
        for (address, target, tlvs) in group_by_peer(cancels.iter().map(cancel_tlv)) {
            self.issue_signaling(address, target, tlvs);
        }
    }

    fn cancel_in_table(table: &mut UnicastGrantTable, slot: usize, message_types: &[MessageType]) -> Vec<GrantRef> {
        message_types
            .iter()
            .filter_map(|&t| table.cancel_unicast_transmission(slot, t))
            .collect()
    }

    /// Stop the Sync and delay service we receive from the parent.
    pub(super) fn cancel_parent_grants(&mut self) {
        if !self.config.unicast.negotiation {
            return;
        }
        let Some(parent) = self.best_master else {
            return;
        };
        let Some(slot) = self
            .destinations
            .find_unicast_grants(&parent.port_identity, parent.address, false)
        else {
            return;
        };
        let cancels = Self::cancel_in_table(
            &mut self.destinations,
            slot,
            &[MessageType::Sync, MessageType::DelayResp, MessageType::PdelayResp],
        );
        self.send_cancels(&cancels);
    }

    /// Stop everything we grant to slaves; retried on the grant tick until acknowledged.
    pub(super) fn cancel_slave_grants(&mut self) {
        let cancels: Vec<GrantRef> = (0..self.slaves.capacity())
            .flat_map(|slot| Self::cancel_in_table(&mut self.slaves, slot, &GRANT_MESSAGE_TYPES))
            .collect();
        self.send_cancels(&cancels);
    }

    /// Shutdown path: cancel every live grant in both directions, without retries.
    pub(super) fn cancel_all_grants(&mut self) {
        let mut cancels = self.destinations.cancel_all_grants();
        cancels.extend(self.slaves.cancel_all_grants());
        if !cancels.is_empty() {
            info!("[Unicast] Cancelling {} grant(s)", cancels.len());
        }
        self.send_cancels(&cancels);
    }

    // ========================================================================
    // ACCESS CHECKS
    // ========================================================================

    /// Slave side: unicast Announce/Sync/Delay_Resp is only taken from masters
    /// that granted it, unless negotiation is off or `accept_any` is set.
    pub(super) fn unicast_allowed(&mut self, header: &Header, source: Ipv4Addr, message_type: MessageType) -> bool {
        if !header.flags.unicast || !self.config.unicast.negotiation || self.config.unicast.accept_any {
            return true;
        }
        self.destinations
            .find_unicast_grants(&header.source_port_identity, source, false)
            .and_then(|slot| self.destinations.row(slot))
            .map(|row| row.is_granted(message_type))
            .unwrap_or(false)
    }

    /// Master side: whether `header`'s sender holds a grant for `message_type`.
    pub(super) fn slave_granted(&mut self, header: &Header, source: Ipv4Addr, message_type: MessageType) -> bool {
        self.slaves
            .find_unicast_grants(&header.source_port_identity, source, false)
            .and_then(|slot| self.slaves.row(slot))
            .map(|row| row.is_granted(message_type))
            .unwrap_or(false)
    }

    pub(super) fn granted_announce_interval(&mut self, key: &ForeignKey) -> Option<i8> {
        if !self.config.unicast.negotiation {
            return None;
        }
        let slot = self
            .destinations
            .find_unicast_grants(&key.port_identity, key.address, false)?;
        self.destinations
            .row(slot)?
            .grant(MessageType::Announce)
            .filter(|g| g.granted)
            .map(|g| g.log_interval)
    }
}
