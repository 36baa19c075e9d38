use anyhow::Result;
use std::net::Ipv4Addr;
use std::time::Duration;

use crate::time::TimeInternal;

/// UDP port a datagram travels on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// 319: Sync, Delay_Req, Pdelay_Req, Pdelay_Resp
    Event,
    /// 320: everything else
    General,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    Multicast,
    /// 224.0.0.107, link-local peer delay group.
    PeerMulticast,
    Unicast(Ipv4Addr),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedPacket {
    pub data: Vec<u8>,
    /// Kernel receive timestamp.
    pub timestamp: TimeInternal,
    pub source: Ipv4Addr,
    pub channel: Channel,
}

#[cfg_attr(test, mockall::automock)]
pub trait PtpNetwork {
    /// Next pending datagram from either socket, or Ok(None) when both are drained.
    fn recv_packet(&mut self) -> Result<Option<ReceivedPacket>>;

    /// Send a datagram. Event messages return their transmit timestamp when one is available.
    fn send(&mut self, channel: Channel, data: &[u8], destination: Destination) -> Result<Option<TimeInternal>>;

    /// Block until a datagram is readable or `timeout` passes. Returns true if data is ready.
    fn wait(&mut self, _timeout: Duration) -> Result<bool> {
        Ok(true)
    }

    /// Reset the network state (e.g. rejoin groups, clear buffers). Default impl does nothing.
    fn reset(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Persistent home of the observed oscillator drift (ppb).
#[cfg_attr(test, mockall::automock)]
pub trait DriftStore {
    fn load(&mut self) -> Result<Option<f64>>;
    fn save(&mut self, drift_ppb: f64) -> Result<()>;
}
