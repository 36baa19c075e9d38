//! Per-port event counters. Plain data: incrementing never fails or blocks.

use log::info;
use serde::Serialize;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PortCounters {
    // Protocol
    pub state_transitions: u32,
    pub best_master_changes: u32,
    pub announce_timeouts: u32,
    pub sync_timeouts: u32,
    pub delay_timeouts: u32,
    pub clock_update_timeouts: u32,
    pub listen_count: u32,
    pub reset_count: u32,
    pub foreign_added: u32,
    pub foreign_overflows: u32,
    pub foreign_removed: u32,
    pub offset_updates: u32,
    pub clock_steps: u32,
    pub panic_mode_entries: u32,

    // Messages
    pub announce_messages_received: u32,
    pub announce_messages_sent: u32,
    pub sync_messages_received: u32,
    pub sync_messages_sent: u32,
    pub follow_up_messages_received: u32,
    pub follow_up_messages_sent: u32,
    pub delay_req_messages_received: u32,
    pub delay_req_messages_sent: u32,
    pub delay_resp_messages_received: u32,
    pub delay_resp_messages_sent: u32,
    pub pdelay_req_messages_received: u32,
    pub pdelay_req_messages_sent: u32,
    pub pdelay_resp_messages_received: u32,
    pub pdelay_resp_messages_sent: u32,
    pub pdelay_resp_follow_up_messages_received: u32,
    pub pdelay_resp_follow_up_messages_sent: u32,
    pub signaling_messages_received: u32,
    pub signaling_messages_sent: u32,
    pub management_messages_received: u32,

    // Unicast negotiation
    pub unicast_grants_requested: u32,
    pub unicast_grants_granted: u32,
    pub unicast_grants_denied: u32,
    pub unicast_grants_cancel_sent: u32,
    pub unicast_grants_cancel_received: u32,
    pub unicast_grants_cancel_ack_sent: u32,
    pub unicast_grants_cancel_ack_received: u32,

    // Errors
    pub discarded_messages: u32,
    pub unknown_messages: u32,
    pub ignored_announces: u32,
    pub message_recv_errors: u32,
    pub message_send_errors: u32,
    pub message_format_errors: u32,
    pub protocol_errors: u32,
    pub version_mismatch_errors: u32,
    pub domain_mismatch_errors: u32,
    pub sequence_mismatch_errors: u32,
    pub consecutive_sequence_errors: u32,
    pub delay_mechanism_mismatch_errors: u32,
    pub outlier_rejections: u32,
    pub max_delay_drops: u32,
}

impl PortCounters {
    pub fn clear(&mut self) {
        *self = PortCounters::default();
    }

    /// Log every non-zero counter, one per line.
    pub fn dump(&self) {
        info!("[PTP] Port counters:");
        match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(map)) => {
                for (name, value) in map {
                    if value.as_u64().unwrap_or(0) != 0 {
                        info!("[PTP]   {:<42} {}", name, value);
                    }
                }
            }
            _ => info!("[PTP]   {:?}", self),
        }
    }
}
