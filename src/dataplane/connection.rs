//! Flow identity and per-flow packet queues

use super::compare::{ProtocolState, Side, Verdict};
use super::packet::{EngineId, Packet};
use crate::protocol::icmp::IcmpPacket;
use crate::protocol::tcp::TcpHeader;
use crate::protocol::udp::UdpHeader;
use crate::protocol::TransportProtocol;
use crate::{Error, Result};
use std::collections::VecDeque;
use std::fmt;
use std::net::Ipv4Addr;
use std::time::Instant;

/// Connection key (5-tuple).
///
/// Hashing and equality go field by field, so there is no padding to leak
/// into either. Source and destination are not normalised: the reverse
/// direction of a flow is a different key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    pub src_addr: Ipv4Addr,
    pub dst_addr: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: TransportProtocol,
}

impl ConnectionKey {
    pub fn new(
        src_addr: Ipv4Addr,
        dst_addr: Ipv4Addr,
        src_port: u16,
        dst_port: u16,
        protocol: TransportProtocol,
    ) -> Self {
        Self {
            src_addr,
            dst_addr,
            src_port,
            dst_port,
            protocol,
        }
    }

    /// Derive the key from a captured record.
    ///
    /// ICMP flows use the echo identifier as source port and 0 as
    /// destination port.
    pub fn from_packet(packet: &Packet) -> Result<Self> {
        let protocol = TransportProtocol::from_u8(packet.ip_protocol()).ok_or_else(|| {
            Error::Unsupported(format!("IP protocol {}", packet.ip_protocol()))
        })?;

        let (src_port, dst_port) = match protocol {
            TransportProtocol::Tcp => {
                let tcp = TcpHeader::parse(packet.transport())?;
                (tcp.src_port(), tcp.dst_port())
            }
            TransportProtocol::Udp => {
                let udp = UdpHeader::parse(packet.transport())?;
                (udp.src_port(), udp.dst_port())
            }
            TransportProtocol::Icmp => {
                let icmp = IcmpPacket::parse(packet.transport())?;
                (icmp.identifier(), 0)
            }
        };

        Ok(Self::new(
            packet.src_addr(),
            packet.dst_addr(),
            src_port,
            dst_port,
            protocol,
        ))
    }

    /// The key of the opposite direction
    pub fn reverse(&self) -> Self {
        Self {
            src_addr: self.dst_addr,
            dst_addr: self.src_addr,
            src_port: self.dst_port,
            dst_port: self.src_port,
            protocol: self.protocol,
        }
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}:{} -> {}:{}",
            self.protocol, self.src_addr, self.src_port, self.dst_addr, self.dst_port
        )
    }
}

/// Where a connection stands in the comparison state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComparisonState {
    Idle,
    Comparing,
    /// Head pair differed; held until a checkpoint flush
    Diverged,
}

/// Records taken out of a connection by a checkpoint flush
#[derive(Debug, Default)]
pub struct FlushedRecords {
    /// Primary-side records to release downstream, oldest first
    pub released: Vec<Packet>,
    /// Secondary-side records dropped
    pub discarded: usize,
}

/// One tracked flow: the primary and secondary output queues plus the
/// protocol state used to compare them.
#[derive(Debug)]
pub struct Connection {
    primary: VecDeque<Packet>,
    secondary: VecDeque<Packet>,
    processing: bool,
    detached: bool,
    state: ComparisonState,
    protocol_state: ProtocolState,
    last_seen: Instant,
}

impl Connection {
    pub fn new(protocol: TransportProtocol) -> Self {
        Self {
            primary: VecDeque::new(),
            secondary: VecDeque::new(),
            processing: false,
            detached: false,
            state: ComparisonState::Idle,
            protocol_state: ProtocolState::for_protocol(protocol),
            last_seen: Instant::now(),
        }
    }

    pub fn protocol(&self) -> TransportProtocol {
        self.protocol_state.protocol()
    }

    pub fn state(&self) -> ComparisonState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: ComparisonState) {
        self.state = state;
    }

    pub fn protocol_state(&self) -> &ProtocolState {
        &self.protocol_state
    }

    pub fn push_primary(&mut self, packet: Packet) {
        self.last_seen = Instant::now();
        self.primary.push_back(packet);
    }

    pub fn push_secondary(&mut self, packet: Packet) {
        self.last_seen = Instant::now();
        self.secondary.push_back(packet);
    }

    pub fn primary_len(&self) -> usize {
        self.primary.len()
    }

    pub fn secondary_len(&self) -> usize {
        self.secondary.len()
    }

    pub(crate) fn pop_primary(&mut self) -> Option<Packet> {
        self.primary.pop_front()
    }

    pub(crate) fn pop_secondary(&mut self) -> Option<Packet> {
        self.secondary.pop_front()
    }

    /// Both heads present
    pub fn has_pair(&self) -> bool {
        !self.primary.is_empty() && !self.secondary.is_empty()
    }

    /// Compare the two queue heads with this flow's protocol handler
    pub(crate) fn compare_heads(&mut self) -> Option<Verdict> {
        let primary = self.primary.front()?;
        let secondary = self.secondary.front()?;
        Some(self.protocol_state.compare(primary, secondary))
    }

    /// A lone primary head that repeats already-matched data
    pub(crate) fn primary_head_is_retransmit(&self) -> bool {
        self.primary
            .front()
            .is_some_and(|p| self.protocol_state.is_retransmit(Side::Primary, p))
    }

    fn has_work(&self) -> bool {
        self.has_pair() || self.primary_head_is_retransmit()
    }

    /// Claim the connection for the comparison task.
    ///
    /// Returns true when the caller must enqueue it; false if it is already
    /// scheduled, diverged, or has nothing to compare.
    pub fn try_schedule(&mut self) -> bool {
        if self.processing || self.state == ComparisonState::Diverged || !self.has_work() {
            return false;
        }
        self.processing = true;
        true
    }

    pub fn is_processing(&self) -> bool {
        self.processing
    }

    pub(crate) fn finish_processing(&mut self) {
        self.processing = false;
    }

    /// Remove `engine`'s oldest primary records until at most `limit` remain.
    /// The records are returned for release in queue order.
    pub(crate) fn shed_primary(&mut self, engine: EngineId, limit: usize) -> Vec<Packet> {
        let mut shed = Vec::new();
        let mut i = 0;
        while self.primary.len() > limit && i < self.primary.len() {
            if self.primary[i].engine() != engine {
                i += 1;
                continue;
            }
            if let Some(packet) = self.primary.remove(i) {
                shed.push(packet);
            }
        }
        shed
    }

    /// Drop the oldest secondary record, used to bound the secondary's local queue
    pub fn drop_oldest_secondary(&mut self) -> Option<Packet> {
        self.secondary.pop_front()
    }

    /// No queued records, no comparison in flight, not diverged
    pub fn is_idle(&self) -> bool {
        self.state == ComparisonState::Idle
            && !self.processing
            && self.primary.is_empty()
            && self.secondary.is_empty()
    }

    /// Protocol close matched and nothing left to compare
    pub fn is_closed(&self) -> bool {
        self.protocol_state.is_closed() && self.is_idle()
    }

    pub fn last_seen(&self) -> Instant {
        self.last_seen
    }

    /// Set once the registry has dropped this connection; late writers must
    /// look the key up again.
    pub fn is_detached(&self) -> bool {
        self.detached
    }

    /// Detach from the registry and release every queued record.
    /// Returns how many records were dropped.
    pub(crate) fn detach(&mut self) -> usize {
        self.detached = true;
        let released = self.primary.len() + self.secondary.len();
        self.primary.clear();
        self.secondary.clear();
        released
    }

    /// Take the records captured by `engine` for a checkpoint: its primary
    /// records are returned for release, its secondary records are dropped.
    /// Comparison state goes back to Idle with fresh sequence bases.
    pub fn flush_owned(&mut self, engine: EngineId) -> FlushedRecords {
        let mut flushed = FlushedRecords::default();

        let (mine, others): (VecDeque<Packet>, VecDeque<Packet>) = self
            .primary
            .drain(..)
            .partition(|p| p.engine() == engine);
        flushed.released.extend(mine);
        self.primary = others;

        let before = self.secondary.len();
        self.secondary.retain(|p| p.engine() != engine);
        flushed.discarded = before - self.secondary.len();

        self.state = ComparisonState::Idle;
        self.processing = false;
        self.protocol_state.reset_after_checkpoint();
        flushed
    }
}
