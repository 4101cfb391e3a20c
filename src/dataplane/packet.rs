//! Captured packet records
//!
//! A [`Packet`] owns one captured Ethernet frame together with the offsets
//! of its IPv4 and transport headers. Records are immutable once captured
//! and are consumed exactly once: forwarded downstream or discarded.

use crate::protocol::ethernet::Frame;
use crate::protocol::ipv4::Ipv4Header;
use crate::protocol::EtherType;
use crate::{Error, Result};
use std::fmt;
use std::net::Ipv4Addr;

/// Identity of the engine instance that captured a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EngineId(pub u32);

impl fmt::Display for EngineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "engine#{}", self.0)
    }
}

/// Opaque identity of the endpoint that handed a frame to the pipeline.
///
/// The hosting pipeline uses it to re-inject a released frame along the
/// path it came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SenderId(pub u64);

impl SenderId {
    /// Frames that arrived over the mirror transport rather than from a local endpoint
    pub const MIRROR: SenderId = SenderId(u64::MAX);
}

/// Which way a frame travels relative to the protected guest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// From the network toward the guest
    Ingress,
    /// Produced by the guest, heading to the network
    Egress,
}

/// One captured frame
#[derive(Clone)]
pub struct Packet {
    data: Vec<u8>,
    network_offset: usize,
    transport_offset: usize,
    transport_end: usize,
    ip_protocol: u8,
    src_addr: Ipv4Addr,
    dst_addr: Ipv4Addr,
    engine: EngineId,
    sender: SenderId,
    direction: Direction,
}

impl Packet {
    /// Take ownership of a captured frame and locate its headers.
    ///
    /// Fails with [`Error::Unsupported`] for non-IPv4 frames and trailing
    /// IPv4 fragments, with [`Error::Parse`] for truncated headers and with
    /// [`Error::InvalidPacket`] when the datagram is cut short.
    pub fn capture(
        data: Vec<u8>,
        engine: EngineId,
        sender: SenderId,
        direction: Direction,
    ) -> Result<Self> {
        let frame = Frame::parse(&data)?;
        let ethertype = frame.ethertype();
        if ethertype != EtherType::Ipv4 as u16 {
            return Err(Error::Unsupported(format!("ethertype {:#06x}", ethertype)));
        }
        let network_offset = frame.payload_offset();

        let ip = Ipv4Header::parse(&data[network_offset..])?;
        let captured = data.len() - network_offset;
        if ip.total_length() as usize > captured {
            return Err(Error::InvalidPacket(format!(
                "IPv4 total length {} exceeds {} captured bytes",
                ip.total_length(),
                captured
            )));
        }
        if ip.is_trailing_fragment() {
            return Err(Error::Unsupported("trailing IPv4 fragment".into()));
        }
        let transport_offset = network_offset + ip.header_len();
        let transport_end = transport_offset + ip.payload().len();
        let ip_protocol = ip.protocol();
        let src_addr = ip.src_addr();
        let dst_addr = ip.dst_addr();

        Ok(Self {
            data,
            network_offset,
            transport_offset,
            transport_end,
            ip_protocol,
            src_addr,
            dst_addr,
            engine,
            sender,
            direction,
        })
    }

    /// The full captured frame
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// IPv4 header bytes
    pub fn network_header(&self) -> &[u8] {
        &self.data[self.network_offset..self.transport_offset]
    }

    /// Transport header plus payload, without link-layer padding
    pub fn transport(&self) -> &[u8] {
        &self.data[self.transport_offset..self.transport_end]
    }

    pub fn ip_protocol(&self) -> u8 {
        self.ip_protocol
    }

    pub fn src_addr(&self) -> Ipv4Addr {
        self.src_addr
    }

    pub fn dst_addr(&self) -> Ipv4Addr {
        self.dst_addr
    }

    pub fn engine(&self) -> EngineId {
        self.engine
    }

    pub fn sender(&self) -> SenderId {
        self.sender
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("size", &self.data.len())
            .field("proto", &self.ip_protocol)
            .field("src", &self.src_addr)
            .field("dst", &self.dst_addr)
            .field("engine", &self.engine)
            .field("direction", &self.direction)
            .finish()
    }
}
