//! ICMP protocol - RFC 792

use crate::{Error, Result};

/// ICMP header size (type, code, checksum, rest-of-header)
pub const HEADER_SIZE: usize = 8;

pub const ECHO_REPLY: u8 = 0;
pub const ECHO_REQUEST: u8 = 8;

/// Parsed ICMP message (zero-copy reference)
#[derive(Debug)]
pub struct IcmpPacket<'a> {
    buffer: &'a [u8],
}

impl<'a> IcmpPacket<'a> {
    pub fn parse(buffer: &'a [u8]) -> Result<Self> {
        if buffer.len() < HEADER_SIZE {
            return Err(Error::Parse("ICMP message too short".into()));
        }
        Ok(Self { buffer })
    }

    pub fn icmp_type(&self) -> u8 {
        self.buffer[0]
    }

    pub fn code(&self) -> u8 {
        self.buffer[1]
    }

    pub fn is_echo(&self) -> bool {
        matches!(self.icmp_type(), ECHO_REPLY | ECHO_REQUEST)
    }

    /// Echo identifier; 0 for messages that have none
    pub fn identifier(&self) -> u16 {
        if self.is_echo() {
            u16::from_be_bytes([self.buffer[4], self.buffer[5]])
        } else {
            0
        }
    }

    pub fn sequence(&self) -> u16 {
        u16::from_be_bytes([self.buffer[6], self.buffer[7]])
    }

    pub fn payload(&self) -> &[u8] {
        &self.buffer[HEADER_SIZE..]
    }
}

/// Calculate ICMP checksum over the whole message
pub fn icmp_checksum(data: &[u8]) -> u16 {
    super::ipv4::checksum(data)
}

/// Build an echo request or reply with a valid checksum
pub fn build_echo(icmp_type: u8, identifier: u16, sequence: u16, payload: &[u8]) -> Vec<u8> {
    let mut msg = Vec::with_capacity(HEADER_SIZE + payload.len());
    msg.push(icmp_type);
    msg.push(0);
    msg.extend_from_slice(&[0x00, 0x00]);
    msg.extend_from_slice(&identifier.to_be_bytes());
    msg.extend_from_slice(&sequence.to_be_bytes());
    msg.extend_from_slice(payload);

    let sum = icmp_checksum(&msg);
    msg[2..4].copy_from_slice(&sum.to_be_bytes());
    msg
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_echo_identifier() {
        let msg = build_echo(ECHO_REQUEST, 0xBEEF, 3, b"ping");
        let icmp = IcmpPacket::parse(&msg).unwrap();
        assert!(icmp.is_echo());
        assert_eq!(icmp.identifier(), 0xBEEF);
        assert_eq!(icmp.sequence(), 3);
        assert_eq!(icmp.payload(), b"ping");
        assert_eq!(icmp_checksum(&msg), 0);
    }

    #[test]
    fn test_non_echo_has_no_identifier() {
        let mut msg = build_echo(ECHO_REQUEST, 0xBEEF, 3, &[]);
        msg[0] = 3; // destination unreachable
        let icmp = IcmpPacket::parse(&msg).unwrap();
        assert_eq!(icmp.identifier(), 0);
    }
}
