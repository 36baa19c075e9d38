//! PTPv2 wire format: common header, message bodies and signaling TLVs.
//!
//! `decode` length-checks every field before reading it and returns a typed
//! `WireError` instead of panicking, so hostile or truncated datagrams only ever
//! cost a counter increment in the port.

use byteorder::{BigEndian, ByteOrder};
use std::net::Ipv4Addr;
use thiserror::Error;

use crate::datasets::{ClockIdentity, ClockQuality, PortIdentity};
use crate::time::Timestamp;

// ============================================================================
// CONSTANTS
// ============================================================================

pub const PTP_EVENT_PORT: u16 = 319;
pub const PTP_GENERAL_PORT: u16 = 320;
pub const PTP_PRIMARY_MULTICAST: Ipv4Addr = Ipv4Addr::new(224, 0, 1, 129);
pub const PTP_PDELAY_MULTICAST: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 107);

pub const PTP_VERSION: u8 = 2;
pub const HEADER_LENGTH: usize = 34;
const TIMESTAMP_LENGTH: usize = 10;
const PORT_IDENTITY_LENGTH: usize = 10;

pub const SYNC_LENGTH: usize = 44;
pub const FOLLOW_UP_LENGTH: usize = 44;
pub const DELAY_REQ_LENGTH: usize = 44;
pub const DELAY_RESP_LENGTH: usize = 54;
pub const PDELAY_REQ_LENGTH: usize = 54;
pub const PDELAY_RESP_LENGTH: usize = 54;
pub const PDELAY_RESP_FOLLOW_UP_LENGTH: usize = 54;
pub const ANNOUNCE_LENGTH: usize = 64;
const SIGNALING_MIN_LENGTH: usize = HEADER_LENGTH + PORT_IDENTITY_LENGTH;
const MANAGEMENT_MIN_LENGTH: usize = HEADER_LENGTH + PORT_IDENTITY_LENGTH + 4;

/// logMessageInterval value meaning "not applicable / negotiated".
pub const UNICAST_MESSAGE_INTERVAL: i8 = 0x7f;

pub const TLV_REQUEST_UNICAST_TRANSMISSION: u16 = 0x0004;
pub const TLV_GRANT_UNICAST_TRANSMISSION: u16 = 0x0005;
pub const TLV_CANCEL_UNICAST_TRANSMISSION: u16 = 0x0006;
pub const TLV_ACKNOWLEDGE_CANCEL_UNICAST_TRANSMISSION: u16 = 0x0007;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("buffer too short")]
    BufferTooShort,
    #[error("unsupported PTP version {0}")]
    UnsupportedVersion(u8),
    #[error("unknown message type 0x{0:x}")]
    UnknownMessageType(u8),
    #[error("malformed TLV")]
    BadTlv,
}

type Result<T> = std::result::Result<T, WireError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Sync = 0x0,
    DelayReq = 0x1,
    PdelayReq = 0x2,
    PdelayResp = 0x3,
    FollowUp = 0x8,
    DelayResp = 0x9,
    PdelayRespFollowUp = 0xa,
    Announce = 0xb,
    Signaling = 0xc,
    Management = 0xd,
}

impl MessageType {
    pub fn from_nibble(value: u8) -> Result<Self> {
        Ok(match value & 0x0f {
            0x0 => MessageType::Sync,
            0x1 => MessageType::DelayReq,
            0x2 => MessageType::PdelayReq,
            0x3 => MessageType::PdelayResp,
            0x8 => MessageType::FollowUp,
            0x9 => MessageType::DelayResp,
            0xa => MessageType::PdelayRespFollowUp,
            0xb => MessageType::Announce,
            0xc => MessageType::Signaling,
            0xd => MessageType::Management,
            other => return Err(WireError::UnknownMessageType(other)),
        })
    }

    /// Event messages are timestamped and travel on port 319.
    pub fn is_event(&self) -> bool {
        matches!(
            self,
            MessageType::Sync | MessageType::DelayReq | MessageType::PdelayReq | MessageType::PdelayResp
        )
    }

    fn control_field(&self) -> u8 {
        match self {
            MessageType::Sync => 0x00,
            MessageType::DelayReq => 0x01,
            MessageType::FollowUp => 0x02,
            MessageType::DelayResp => 0x03,
            MessageType::Management => 0x04,
            _ => 0x05,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Flags {
    pub alternate_master: bool,
    pub two_step: bool,
    pub unicast: bool,
    pub leap61: bool,
    pub leap59: bool,
    pub current_utc_offset_valid: bool,
    pub ptp_timescale: bool,
    pub time_traceable: bool,
    pub frequency_traceable: bool,
}

impl Flags {
    fn from_bytes(b0: u8, b1: u8) -> Self {
        Flags {
            alternate_master: b0 & 0x01 != 0,
            two_step: b0 & 0x02 != 0,
            unicast: b0 & 0x04 != 0,
            leap61: b1 & 0x01 != 0,
            leap59: b1 & 0x02 != 0,
            current_utc_offset_valid: b1 & 0x04 != 0,
            ptp_timescale: b1 & 0x08 != 0,
            time_traceable: b1 & 0x10 != 0,
            frequency_traceable: b1 & 0x20 != 0,
        }
    }

    fn to_bytes(self) -> [u8; 2] {
        let mut b = [0u8; 2];
        b[0] |= self.alternate_master as u8;
        b[0] |= (self.two_step as u8) << 1;
        b[0] |= (self.unicast as u8) << 2;
        b[1] |= self.leap61 as u8;
        b[1] |= (self.leap59 as u8) << 1;
        b[1] |= (self.current_utc_offset_valid as u8) << 2;
        b[1] |= (self.ptp_timescale as u8) << 3;
        b[1] |= (self.time_traceable as u8) << 4;
        b[1] |= (self.frequency_traceable as u8) << 5;
        b
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub transport_specific: u8,
    pub version: u8,
    pub message_length: u16,
    pub domain_number: u8,
    pub flags: Flags,
    /// Nanoseconds scaled by 2^16.
    pub correction_field: i64,
    pub source_port_identity: PortIdentity,
    pub sequence_id: u16,
    pub control_field: u8,
    pub log_message_interval: i8,
}

impl Default for Header {
    fn default() -> Self {
        Header {
            transport_specific: 0,
            version: PTP_VERSION,
            message_length: 0,
            domain_number: 0,
            flags: Flags::default(),
            correction_field: 0,
            source_port_identity: PortIdentity::default(),
            sequence_id: 0,
            control_field: 0,
            log_message_interval: UNICAST_MESSAGE_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnounceBody {
    pub origin_timestamp: Timestamp,
    pub current_utc_offset: i16,
    pub grandmaster_priority1: u8,
    pub grandmaster_clock_quality: ClockQuality,
    pub grandmaster_priority2: u8,
    pub grandmaster_identity: ClockIdentity,
    pub steps_removed: u16,
    pub time_source: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelayRespBody {
    pub receive_timestamp: Timestamp,
    pub requesting_port_identity: PortIdentity,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PdelayRespBody {
    pub request_receipt_timestamp: Timestamp,
    pub requesting_port_identity: PortIdentity,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PdelayRespFollowUpBody {
    pub response_origin_timestamp: Timestamp,
    pub requesting_port_identity: PortIdentity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingTlv {
    RequestUnicast {
        message_type: MessageType,
        log_interval: i8,
        duration: u32,
    },
    GrantUnicast {
        message_type: MessageType,
        log_interval: i8,
        duration: u32,
        renewal_invited: bool,
    },
    CancelUnicast {
        message_type: MessageType,
    },
    AckCancelUnicast {
        message_type: MessageType,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalingBody {
    pub target_port_identity: PortIdentity,
    pub tlvs: Vec<SignalingTlv>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagementBody {
    pub target_port_identity: PortIdentity,
    pub starting_boundary_hops: u8,
    pub boundary_hops: u8,
    pub action: u8,
    pub tlv: Vec<u8>,
}

/// Typed message body; the variant is the message type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    Announce(AnnounceBody),
    Sync { origin_timestamp: Timestamp },
    FollowUp { precise_origin_timestamp: Timestamp },
    DelayReq { origin_timestamp: Timestamp },
    DelayResp(DelayRespBody),
    PdelayReq { origin_timestamp: Timestamp },
    PdelayResp(PdelayRespBody),
    PdelayRespFollowUp(PdelayRespFollowUpBody),
    Signaling(SignalingBody),
    Management(ManagementBody),
}

impl Body {
    pub fn message_type(&self) -> MessageType {
        match self {
            Body::Announce(_) => MessageType::Announce,
            Body::Sync { .. } => MessageType::Sync,
            Body::FollowUp { .. } => MessageType::FollowUp,
            Body::DelayReq { .. } => MessageType::DelayReq,
            Body::DelayResp(_) => MessageType::DelayResp,
            Body::PdelayReq { .. } => MessageType::PdelayReq,
            Body::PdelayResp(_) => MessageType::PdelayResp,
            Body::PdelayRespFollowUp(_) => MessageType::PdelayRespFollowUp,
            Body::Signaling(_) => MessageType::Signaling,
            Body::Management(_) => MessageType::Management,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub header: Header,
    pub body: Body,
}

// ============================================================================
// READ / WRITE HELPERS
// ============================================================================

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8], pos: usize) -> Self {
        Reader { buf, pos }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(n).ok_or(WireError::BufferTooShort)?;
        let slice = self.buf.get(self.pos..end).ok_or(WireError::BufferTooShort)?;
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn i8(&mut self) -> Result<i8> {
        Ok(self.u8()? as i8)
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(BigEndian::read_u16(self.take(2)?))
    }

    fn i16(&mut self) -> Result<i16> {
        Ok(BigEndian::read_i16(self.take(2)?))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(BigEndian::read_u32(self.take(4)?))
    }

    fn timestamp(&mut self) -> Result<Timestamp> {
        let seconds = BigEndian::read_u48(self.take(6)?);
        let nanoseconds = self.u32()?;
        Ok(Timestamp { seconds, nanoseconds })
    }

    fn clock_identity(&mut self) -> Result<ClockIdentity> {
        let mut id = [0u8; 8];
        id.copy_from_slice(self.take(8)?);
        Ok(ClockIdentity(id))
    }

    fn port_identity(&mut self) -> Result<PortIdentity> {
        let clock_identity = self.clock_identity()?;
        let port_number = self.u16()?;
        Ok(PortIdentity { clock_identity, port_number })
    }

    fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }
}

#[derive(Default)]
struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn u16(&mut self, v: u16) {
        let mut b = [0u8; 2];
        BigEndian::write_u16(&mut b, v);
        self.buf.extend_from_slice(&b);
    }

    fn u32(&mut self, v: u32) {
        let mut b = [0u8; 4];
        BigEndian::write_u32(&mut b, v);
        self.buf.extend_from_slice(&b);
    }

    fn i64(&mut self, v: i64) {
        let mut b = [0u8; 8];
        BigEndian::write_i64(&mut b, v);
        self.buf.extend_from_slice(&b);
    }

    fn zeros(&mut self, n: usize) {
        self.buf.resize(self.buf.len() + n, 0);
    }

    fn timestamp(&mut self, ts: &Timestamp) {
        let mut b = [0u8; 6];
        BigEndian::write_u48(&mut b, ts.seconds & 0xffff_ffff_ffff);
        self.buf.extend_from_slice(&b);
        self.u32(ts.nanoseconds);
    }

    fn port_identity(&mut self, id: &PortIdentity) {
        self.buf.extend_from_slice(&id.clock_identity.0);
        self.u16(id.port_number);
    }
}

// ============================================================================
// DECODE
// ============================================================================

pub fn decode_header(buf: &[u8]) -> Result<(Header, MessageType)> {
    if buf.len() < HEADER_LENGTH {
        return Err(WireError::BufferTooShort);
    }

    let version = buf[1] & 0x0f;
    if version != PTP_VERSION {
        return Err(WireError::UnsupportedVersion(version));
    }

    let message_type = MessageType::from_nibble(buf[0])?;

    let mut r = Reader::new(buf, 2);
    let message_length = r.u16()?;
    let domain_number = r.u8()?;
    r.take(1)?;
    let flag_bytes = r.take(2)?;
    let flags = Flags::from_bytes(flag_bytes[0], flag_bytes[1]);
    let correction_field = BigEndian::read_i64(r.take(8)?);
    r.take(4)?;
    let source_port_identity = r.port_identity()?;
    let sequence_id = r.u16()?;
    let control_field = r.u8()?;
    let log_message_interval = r.i8()?;

    Ok((
        Header {
            transport_specific: buf[0] >> 4,
            version,
            message_length,
            domain_number,
            flags,
            correction_field,
            source_port_identity,
            sequence_id,
            control_field,
            log_message_interval,
        },
        message_type,
    ))
}

pub fn decode(buf: &[u8]) -> Result<Message> {
    let (header, message_type) = decode_header(buf)?;

    // messageLength bounds the body; trailing padding (e.g. Ethernet minimum) is ignored
    let declared = header.message_length as usize;
    if declared < HEADER_LENGTH || declared > buf.len() {
        return Err(WireError::BufferTooShort);
    }
    let buf = &buf[..declared];
    let mut r = Reader::new(buf, HEADER_LENGTH);

    let body = match message_type {
        MessageType::Sync => Body::Sync { origin_timestamp: r.timestamp()? },
        MessageType::DelayReq => Body::DelayReq { origin_timestamp: r.timestamp()? },
        MessageType::FollowUp => Body::FollowUp { precise_origin_timestamp: r.timestamp()? },
        MessageType::DelayResp => Body::DelayResp(DelayRespBody {
            receive_timestamp: r.timestamp()?,
            requesting_port_identity: r.port_identity()?,
        }),
        MessageType::PdelayReq => {
            let origin_timestamp = r.timestamp()?;
            r.take(10)?;
            Body::PdelayReq { origin_timestamp }
        }
        MessageType::PdelayResp => Body::PdelayResp(PdelayRespBody {
            request_receipt_timestamp: r.timestamp()?,
            requesting_port_identity: r.port_identity()?,
        }),
        MessageType::PdelayRespFollowUp => Body::PdelayRespFollowUp(PdelayRespFollowUpBody {
            response_origin_timestamp: r.timestamp()?,
            requesting_port_identity: r.port_identity()?,
        }),
        MessageType::Announce => {
            let origin_timestamp = r.timestamp()?;
            let current_utc_offset = r.i16()?;
            r.take(1)?;
            let grandmaster_priority1 = r.u8()?;
            let grandmaster_clock_quality = ClockQuality {
                clock_class: r.u8()?,
                clock_accuracy: r.u8()?,
                offset_scaled_log_variance: r.u16()?,
            };
            let grandmaster_priority2 = r.u8()?;
            let grandmaster_identity = r.clock_identity()?;
            let steps_removed = r.u16()?;
            let time_source = r.u8()?;
            Body::Announce(AnnounceBody {
                origin_timestamp,
                current_utc_offset,
                grandmaster_priority1,
                grandmaster_clock_quality,
                grandmaster_priority2,
                grandmaster_identity,
                steps_removed,
                time_source,
            })
        }
        MessageType::Signaling => {
            if buf.len() < SIGNALING_MIN_LENGTH {
                return Err(WireError::BufferTooShort);
            }
            let target_port_identity = r.port_identity()?;
            let tlvs = decode_signaling_tlvs(&mut r)?;
            Body::Signaling(SignalingBody { target_port_identity, tlvs })
        }
        MessageType::Management => {
            if buf.len() < MANAGEMENT_MIN_LENGTH {
                return Err(WireError::BufferTooShort);
            }
            let target_port_identity = r.port_identity()?;
            let starting_boundary_hops = r.u8()?;
            let boundary_hops = r.u8()?;
            let action = r.u8()? & 0x0f;
            r.take(1)?;
            let tlv = r.take(r.remaining())?.to_vec();
            Body::Management(ManagementBody {
                target_port_identity,
                starting_boundary_hops,
                boundary_hops,
                action,
                tlv,
            })
        }
    };

    Ok(Message { header, body })
}

fn decode_signaling_tlvs(r: &mut Reader<'_>) -> Result<Vec<SignalingTlv>> {
    let mut tlvs = Vec::new();

    while r.remaining() >= 4 {
        let tlv_type = r.u16()?;
        let length = r.u16()? as usize;
        let value = r.take(length).map_err(|_| WireError::BadTlv)?;
        let mut v = Reader::new(value, 0);

        let tlv = match tlv_type {
            TLV_REQUEST_UNICAST_TRANSMISSION => {
                let message_type = MessageType::from_nibble(v.u8().map_err(|_| WireError::BadTlv)? >> 4)?;
                let log_interval = v.i8().map_err(|_| WireError::BadTlv)?;
                let duration = v.u32().map_err(|_| WireError::BadTlv)?;
                SignalingTlv::RequestUnicast { message_type, log_interval, duration }
            }
            TLV_GRANT_UNICAST_TRANSMISSION => {
                let message_type = MessageType::from_nibble(v.u8().map_err(|_| WireError::BadTlv)? >> 4)?;
                let log_interval = v.i8().map_err(|_| WireError::BadTlv)?;
                let duration = v.u32().map_err(|_| WireError::BadTlv)?;
                v.take(1).map_err(|_| WireError::BadTlv)?;
                let renewal_invited = v.u8().map_err(|_| WireError::BadTlv)? & 0x01 != 0;
                SignalingTlv::GrantUnicast { message_type, log_interval, duration, renewal_invited }
            }
            TLV_CANCEL_UNICAST_TRANSMISSION => {
                let message_type = MessageType::from_nibble(v.u8().map_err(|_| WireError::BadTlv)? >> 4)?;
                SignalingTlv::CancelUnicast { message_type }
            }
            TLV_ACKNOWLEDGE_CANCEL_UNICAST_TRANSMISSION => {
                let message_type = MessageType::from_nibble(v.u8().map_err(|_| WireError::BadTlv)? >> 4)?;
                SignalingTlv::AckCancelUnicast { message_type }
            }
            // Unknown TLVs are skipped
            _ => continue,
        };
        tlvs.push(tlv);
    }

    Ok(tlvs)
}

// ============================================================================
// ENCODE
// ============================================================================

impl Message {
    pub fn new(header: Header, body: Body) -> Self {
        Message { header, body }
    }

    pub fn message_type(&self) -> MessageType {
        self.body.message_type()
    }

    pub fn encode(&self) -> Vec<u8> {
        let message_type = self.message_type();
        let mut w = Writer::default();

        w.u8((self.header.transport_specific << 4) | message_type as u8);
        w.u8(PTP_VERSION);
        w.u16(0); // length, patched below
        w.u8(self.header.domain_number);
        w.u8(0);
        let flags = self.header.flags.to_bytes();
        w.u8(flags[0]);
        w.u8(flags[1]);
        w.i64(self.header.correction_field);
        w.zeros(4);
        w.port_identity(&self.header.source_port_identity);
        w.u16(self.header.sequence_id);
        w.u8(message_type.control_field());
        w.u8(self.header.log_message_interval as u8);

        match &self.body {
            Body::Sync { origin_timestamp } | Body::DelayReq { origin_timestamp } => {
                w.timestamp(origin_timestamp);
            }
            Body::FollowUp { precise_origin_timestamp } => w.timestamp(precise_origin_timestamp),
            Body::DelayResp(b) => {
                w.timestamp(&b.receive_timestamp);
                w.port_identity(&b.requesting_port_identity);
            }
            Body::PdelayReq { origin_timestamp } => {
                w.timestamp(origin_timestamp);
                w.zeros(10);
            }
            Body::PdelayResp(b) => {
                w.timestamp(&b.request_receipt_timestamp);
                w.port_identity(&b.requesting_port_identity);
            }
            Body::PdelayRespFollowUp(b) => {
                w.timestamp(&b.response_origin_timestamp);
                w.port_identity(&b.requesting_port_identity);
            }
            Body::Announce(a) => {
                w.timestamp(&a.origin_timestamp);
                w.u16(a.current_utc_offset as u16);
                w.u8(0);
                w.u8(a.grandmaster_priority1);
                w.u8(a.grandmaster_clock_quality.clock_class);
                w.u8(a.grandmaster_clock_quality.clock_accuracy);
                w.u16(a.grandmaster_clock_quality.offset_scaled_log_variance);
                w.u8(a.grandmaster_priority2);
                w.buf.extend_from_slice(&a.grandmaster_identity.0);
                w.u16(a.steps_removed);
                w.u8(a.time_source);
            }
            Body::Signaling(s) => {
                w.port_identity(&s.target_port_identity);
                for tlv in &s.tlvs {
                    encode_signaling_tlv(&mut w, tlv);
                }
            }
            Body::Management(m) => {
                w.port_identity(&m.target_port_identity);
                w.u8(m.starting_boundary_hops);
                w.u8(m.boundary_hops);
                w.u8(m.action & 0x0f);
                w.u8(0);
                w.buf.extend_from_slice(&m.tlv);
            }
        }

        let len = w.buf.len() as u16;
        BigEndian::write_u16(&mut w.buf[2..4], len);
        w.buf
    }
}

fn encode_signaling_tlv(w: &mut Writer, tlv: &SignalingTlv) {
    match *tlv {
        SignalingTlv::RequestUnicast { message_type, log_interval, duration } => {
            w.u16(TLV_REQUEST_UNICAST_TRANSMISSION);
            w.u16(6);
            w.u8((message_type as u8) << 4);
            w.u8(log_interval as u8);
            w.u32(duration);
        }
        SignalingTlv::GrantUnicast { message_type, log_interval, duration, renewal_invited } => {
            w.u16(TLV_GRANT_UNICAST_TRANSMISSION);
            w.u16(8);
            w.u8((message_type as u8) << 4);
            w.u8(log_interval as u8);
            w.u32(duration);
            w.u8(0);
            w.u8(renewal_invited as u8);
        }
        SignalingTlv::CancelUnicast { message_type } => {
            w.u16(TLV_CANCEL_UNICAST_TRANSMISSION);
            w.u16(2);
            w.u8((message_type as u8) << 4);
            w.u8(0);
        }
        SignalingTlv::AckCancelUnicast { message_type } => {
            w.u16(TLV_ACKNOWLEDGE_CANCEL_UNICAST_TRANSMISSION);
            w.u16(2);
            w.u8((message_type as u8) << 4);
            w.u8(0);
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
