//! TCP protocol - RFC 793
//!
//! Header parsing for flow keys and stream comparison.

use crate::{Error, Result};
use std::net::Ipv4Addr;

/// Minimum TCP header size (without options)
pub const MIN_HEADER_SIZE: usize = 20;

/// TCP protocol number for pseudo-header
pub const PROTOCOL_NUMBER: u8 = 6;

/// TCP flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpFlags {
    pub fin: bool,
    pub syn: bool,
    pub rst: bool,
    pub psh: bool,
    pub ack: bool,
    pub urg: bool,
}

impl TcpFlags {
    pub const FIN: u8 = 0x01;
    pub const SYN: u8 = 0x02;
    pub const RST: u8 = 0x04;
    pub const PSH: u8 = 0x08;
    pub const ACK: u8 = 0x10;
    pub const URG: u8 = 0x20;

    /// Parse flags from the 13th byte of TCP header
    pub fn from_byte(byte: u8) -> Self {
        Self {
            fin: (byte & Self::FIN) != 0,
            syn: (byte & Self::SYN) != 0,
            rst: (byte & Self::RST) != 0,
            psh: (byte & Self::PSH) != 0,
            ack: (byte & Self::ACK) != 0,
            urg: (byte & Self::URG) != 0,
        }
    }

    /// SYN and FIN each occupy one sequence number
    pub fn sequence_len(&self) -> u32 {
        self.syn as u32 + self.fin as u32
    }

    /// Connection teardown seen (FIN or RST)
    pub fn is_closing(&self) -> bool {
        self.fin || self.rst
    }
}

/// Parsed TCP header (zero-copy reference)
#[derive(Debug)]
pub struct TcpHeader<'a> {
    buffer: &'a [u8],
    header_len: usize,
}

impl<'a> TcpHeader<'a> {
    /// Parse TCP header from buffer
    pub fn parse(buffer: &'a [u8]) -> Result<Self> {
        if buffer.len() < MIN_HEADER_SIZE {
            return Err(Error::Parse("TCP header too short".into()));
        }

        let header_len = ((buffer[12] >> 4) as usize) * 4;

        if header_len < MIN_HEADER_SIZE {
            return Err(Error::Parse("TCP data offset too small".into()));
        }

        if buffer.len() < header_len {
            return Err(Error::Parse("TCP header truncated".into()));
        }

        Ok(Self { buffer, header_len })
    }

    /// Source port (offset 0-1)
    pub fn src_port(&self) -> u16 {
        u16::from_be_bytes([self.buffer[0], self.buffer[1]])
    }

    /// Destination port (offset 2-3)
    pub fn dst_port(&self) -> u16 {
        u16::from_be_bytes([self.buffer[2], self.buffer[3]])
    }

    /// Sequence number (offset 4-7)
    pub fn seq_num(&self) -> u32 {
        u32::from_be_bytes([
            self.buffer[4],
            self.buffer[5],
            self.buffer[6],
            self.buffer[7],
        ])
    }

    /// Acknowledgment number (offset 8-11)
    pub fn ack_num(&self) -> u32 {
        u32::from_be_bytes([
            self.buffer[8],
            self.buffer[9],
            self.buffer[10],
            self.buffer[11],
        ])
    }

    pub fn flags(&self) -> TcpFlags {
        TcpFlags::from_byte(self.buffer[13])
    }

    pub fn window(&self) -> u16 {
        u16::from_be_bytes([self.buffer[14], self.buffer[15]])
    }

    pub fn header_len(&self) -> usize {
        self.header_len
    }

    pub fn payload(&self) -> &[u8] {
        &self.buffer[self.header_len..]
    }

    /// Sequence space consumed by this segment (payload plus SYN/FIN)
    pub fn segment_len(&self) -> u32 {
        self.payload().len() as u32 + self.flags().sequence_len()
    }
}

/// Calculate TCP checksum with pseudo-header (RFC 793)
pub fn tcp_checksum(src_ip: Ipv4Addr, dst_ip: Ipv4Addr, tcp_segment: &[u8]) -> u16 {
    let mut sum: u32 = 0;

    let src = src_ip.octets();
    let dst = dst_ip.octets();

    sum += u16::from_be_bytes([src[0], src[1]]) as u32;
    sum += u16::from_be_bytes([src[2], src[3]]) as u32;
    sum += u16::from_be_bytes([dst[0], dst[1]]) as u32;
    sum += u16::from_be_bytes([dst[2], dst[3]]) as u32;
    sum += PROTOCOL_NUMBER as u32;
    sum += tcp_segment.len() as u32;

    for chunk in tcp_segment.chunks(2) {
        let word = if chunk.len() == 2 {
            u16::from_be_bytes([chunk[0], chunk[1]])
        } else {
            u16::from_be_bytes([chunk[0], 0])
        };
        sum = sum.wrapping_add(word as u32);
    }

    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    !(sum as u16)
}

/// Fields needed to build a TCP segment
#[derive(Debug, Clone, Copy)]
pub struct SegmentSpec {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: u8,
    pub window: u16,
}

/// Build a TCP segment (no options) with a valid checksum
pub fn build_segment(
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
    spec: SegmentSpec,
    payload: &[u8],
) -> Vec<u8> {
    let mut seg = Vec::with_capacity(MIN_HEADER_SIZE + payload.len());
    seg.extend_from_slice(&spec.src_port.to_be_bytes());
    seg.extend_from_slice(&spec.dst_port.to_be_bytes());
    seg.extend_from_slice(&spec.seq.to_be_bytes());
    seg.extend_from_slice(&spec.ack.to_be_bytes());
    seg.push(0x50);
    seg.push(spec.flags);
    seg.extend_from_slice(&spec.window.to_be_bytes());
    seg.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]);
    seg.extend_from_slice(payload);

    let sum = tcp_checksum(src_ip, dst_ip, &seg);
    seg[16..18].copy_from_slice(&sum.to_be_bytes());
    seg
}
