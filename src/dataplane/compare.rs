//! Checkpoint decision engine
//!
//! Pairs the heads of a connection's primary and secondary queues and
//! decides, per pair, whether the two instances produced the same output.
//!
//! Comparison rules by protocol:
//! - UDP and ICMP are stateless: the transport segments must be identical.
//!   IP identification, TTL and header checksum are not guest-deterministic
//!   and are left out.
//! - TCP sequence numbers are compared relative to a base learned per side
//!   from the first compared pair, so the two guests may pick different
//!   initial sequence numbers. A data-bearing segment that ends at or below
//!   the matched high-water mark is a retransmission and is released or
//!   discarded without a partner. A matched close keeps the bases until
//!   the connection is expired, so late retransmits of the FIN are still
//!   recognised.

use super::connection::{ComparisonState, Connection};
use super::packet::Packet;
use crate::protocol::tcp::TcpHeader;
use crate::protocol::TransportProtocol;
use std::fmt;

/// Which queue a record sits on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Primary,
    Secondary,
}

/// Why a pair did not match
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mismatch {
    Length { primary: usize, secondary: usize },
    Payload { offset: usize },
    Sequence { primary: u32, secondary: u32 },
    Acknowledgment { primary: u32, secondary: u32 },
    Flags { primary: u8, secondary: u8 },
    Malformed(String),
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mismatch::Length { primary, secondary } => {
                write!(f, "length {} != {}", primary, secondary)
            }
            Mismatch::Payload { offset } => write!(f, "payload differs at byte {}", offset),
            Mismatch::Sequence { primary, secondary } => {
                write!(f, "relative seq {} != {}", primary, secondary)
            }
            Mismatch::Acknowledgment { primary, secondary } => {
                write!(f, "ack {} != {}", primary, secondary)
            }
            Mismatch::Flags { primary, secondary } => {
                write!(f, "flags {:#04x} != {:#04x}", primary, secondary)
            }
            Mismatch::Malformed(msg) => write!(f, "malformed segment: {}", msg),
        }
    }
}

/// Result of comparing one head pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Matched,
    /// Primary head repeats matched data; release it alone
    RetransmitPrimary,
    /// Secondary head repeats matched data; drop it alone
    RetransmitSecondary,
    Diverged(Mismatch),
}

/// TCP sequence tracking for one flow direction
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamState {
    primary_base: Option<u32>,
    secondary_base: Option<u32>,
    /// Relative sequence number just past the last matched segment
    matched_through: u32,
    closing: bool,
}

impl StreamState {
    fn base(&self, side: Side) -> Option<u32> {
        match side {
            Side::Primary => self.primary_base,
            Side::Secondary => self.secondary_base,
        }
    }

    fn is_retransmit(&self, side: Side, tcp: &TcpHeader<'_>) -> bool {
        let Some(base) = self.base(side) else {
            return false;
        };
        let len = tcp.segment_len();
        if len == 0 {
            return false;
        }
        let end = tcp.seq_num().wrapping_sub(base).wrapping_add(len);
        // serial-number comparison: end <= matched_through
        (end.wrapping_sub(self.matched_through) as i32) <= 0
    }

    fn compare(&mut self, primary: &Packet, secondary: &Packet) -> Verdict {
        let (p, s) = match (
            TcpHeader::parse(primary.transport()),
            TcpHeader::parse(secondary.transport()),
        ) {
            (Ok(p), Ok(s)) => (p, s),
            (Err(e), _) | (_, Err(e)) => return Verdict::Diverged(Mismatch::Malformed(e.to_string())),
        };

        // the 5-tuple was reused for a new connection after a matched close
        if self.closing && p.flags().syn && s.flags().syn {
            *self = StreamState::default();
        }

        if self.is_retransmit(Side::Primary, &p) {
            return Verdict::RetransmitPrimary;
        }
        if self.is_retransmit(Side::Secondary, &s) {
            return Verdict::RetransmitSecondary;
        }

        let primary_base = *self.primary_base.get_or_insert(p.seq_num());
        let secondary_base = *self.secondary_base.get_or_insert(s.seq_num());

        let rel_p = p.seq_num().wrapping_sub(primary_base);
        let rel_s = s.seq_num().wrapping_sub(secondary_base);
        if rel_p != rel_s {
            return Verdict::Diverged(Mismatch::Sequence {
                primary: rel_p,
                secondary: rel_s,
            });
        }

        let (pf, sf) = (primary.transport()[13], secondary.transport()[13]);
        if pf != sf {
            return Verdict::Diverged(Mismatch::Flags {
                primary: pf,
                secondary: sf,
            });
        }

        if p.flags().ack && p.ack_num() != s.ack_num() {
            return Verdict::Diverged(Mismatch::Acknowledgment {
                primary: p.ack_num(),
                secondary: s.ack_num(),
            });
        }

        if let Some(mismatch) = compare_bytes(p.payload(), s.payload()) {
            return Verdict::Diverged(mismatch);
        }

        let end = rel_p.wrapping_add(p.segment_len());
        if (end.wrapping_sub(self.matched_through) as i32) > 0 {
            self.matched_through = end;
        }
        if p.flags().is_closing() {
            self.closing = true;
        }
        Verdict::Matched
    }
}

/// Per-connection comparison state, tagged by transport protocol
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolState {
    /// Whole-segment equality (UDP, ICMP)
    Stateless(TransportProtocol),
    /// Sequence-aware comparison (TCP)
    Stream(StreamState),
}

impl ProtocolState {
    pub fn for_protocol(protocol: TransportProtocol) -> Self {
        match protocol {
            TransportProtocol::Tcp => ProtocolState::Stream(StreamState::default()),
            other => ProtocolState::Stateless(other),
        }
    }

    pub fn protocol(&self) -> TransportProtocol {
        match self {
            ProtocolState::Stateless(proto) => *proto,
            ProtocolState::Stream(_) => TransportProtocol::Tcp,
        }
    }

    pub fn compare(&mut self, primary: &Packet, secondary: &Packet) -> Verdict {
        match self {
            ProtocolState::Stateless(_) => {
                match compare_bytes(primary.transport(), secondary.transport()) {
                    Some(mismatch) => Verdict::Diverged(mismatch),
                    None => Verdict::Matched,
                }
            }
            ProtocolState::Stream(stream) => stream.compare(primary, secondary),
        }
    }

    pub fn is_retransmit(&self, side: Side, packet: &Packet) -> bool {
        match self {
            ProtocolState::Stateless(_) => false,
            ProtocolState::Stream(stream) => TcpHeader::parse(packet.transport())
                .map(|tcp| stream.is_retransmit(side, &tcp))
                .unwrap_or(false),
        }
    }

    /// A FIN or RST has been matched
    pub fn is_closed(&self) -> bool {
        matches!(self, ProtocolState::Stream(stream) if stream.closing)
    }

    /// After a checkpoint both guests share state again, so sequence
    /// offsets are relearned from the next pair.
    pub fn reset_after_checkpoint(&mut self) {
        if let ProtocolState::Stream(stream) = self {
            stream.primary_base = None;
            stream.secondary_base = None;
            stream.matched_through = 0;
        }
    }
}

fn compare_bytes(primary: &[u8], secondary: &[u8]) -> Option<Mismatch> {
    if primary.len() != secondary.len() {
        return Some(Mismatch::Length {
            primary: primary.len(),
            secondary: secondary.len(),
        });
    }
    primary
        .iter()
        .zip(secondary)
        .position(|(a, b)| a != b)
        .map(|offset| Mismatch::Payload { offset })
}

/// What one drain pass over a connection produced
#[derive(Debug, Default)]
pub struct DrainOutcome {
    /// Primary records to forward downstream, in queue order
    pub released: Vec<Packet>,
    /// Secondary records dropped after matching
    pub discarded: usize,
    pub matched: usize,
    pub retransmits: usize,
    pub divergence: Option<Mismatch>,
}

/// Compare head pairs strictly FIFO until a queue runs dry or a pair
/// diverges. A diverged connection keeps its head pair and is not drained
/// again until a checkpoint flush resets it.
pub fn drain(conn: &mut Connection) -> DrainOutcome {
    let mut out = DrainOutcome::default();

    while conn.state() != ComparisonState::Diverged {
        conn.set_state(ComparisonState::Comparing);

        let verdict = match conn.compare_heads() {
            Some(verdict) => verdict,
            None if conn.primary_head_is_retransmit() => Verdict::RetransmitPrimary,
            None => {
                conn.set_state(ComparisonState::Idle);
                break;
            }
        };

        match verdict {
            Verdict::Matched => {
                if let (Some(primary), Some(_)) = (conn.pop_primary(), conn.pop_secondary()) {
                    out.released.push(primary);
                    out.discarded += 1;
                    out.matched += 1;
                }
                conn.set_state(ComparisonState::Idle);
            }
            Verdict::RetransmitPrimary => {
                if let Some(primary) = conn.pop_primary() {
                    out.released.push(primary);
                    out.retransmits += 1;
                }
                conn.set_state(ComparisonState::Idle);
            }
            Verdict::RetransmitSecondary => {
                if conn.pop_secondary().is_some() {
                    out.discarded += 1;
                    out.retransmits += 1;
                }
                conn.set_state(ComparisonState::Idle);
            }
            Verdict::Diverged(mismatch) => {
                conn.set_state(ComparisonState::Diverged);
                out.divergence = Some(mismatch);
            }
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataplane::packet::fixtures::*;
    use crate::protocol::tcp::{SegmentSpec, TcpFlags};

    fn seg(seq: u32, ack: u32, flags: u8) -> SegmentSpec {
        SegmentSpec {
            src_port: 40000,
            dst_port: 80,
            seq,
            ack,
            flags,
            window: 64240,
        }
    }

    fn udp(payload: &[u8]) -> Packet {
        packet(udp_frame(5000, 53, payload))
    }

    fn tcp(seq: u32, ack: u32, flags: u8, payload: &[u8]) -> Packet {
        packet(tcp_frame(seg(seq, ack, flags), payload, seq as u16))
    }

    #[test]
    fn test_udp_match_and_pop() {
        let mut conn = Connection::new(TransportProtocol::Udp);
        conn.push_primary(udp(b"hello"));
        conn.push_secondary(udp(b"hello"));

        let out = drain(&mut conn);
        assert_eq!(out.matched, 1);
        assert_eq!(out.released.len(), 1);
        assert_eq!(out.discarded, 1);
        assert!(out.divergence.is_none());
        assert!(conn.is_idle());
    }

    #[test]
    fn test_udp_payload_divergence() {
        let mut conn = Connection::new(TransportProtocol::Udp);
        conn.push_primary(udp(b"hello"));
        conn.push_secondary(udp(b"hellO"));

        let out = drain(&mut conn);
        assert_eq!(out.matched, 0);
        assert!(out.released.is_empty());
        assert_eq!(out.divergence, Some(Mismatch::Payload { offset: 12 }));
        assert_eq!(conn.state(), ComparisonState::Diverged);
        // head pair is held
        assert_eq!(conn.primary_len(), 1);
        assert_eq!(conn.secondary_len(), 1);

        // further drains leave it alone
        let again = drain(&mut conn);
        assert!(again.divergence.is_none());
        assert_eq!(conn.primary_len(), 1);
    }

    #[test]
    fn test_fifo_pairing_order() {
        let mut conn = Connection::new(TransportProtocol::Udp);
        conn.push_primary(udp(b"p1"));
        conn.push_secondary(udp(b"p1"));
        conn.push_primary(udp(b"p2"));
        conn.push_primary(udp(b"p3"));
        conn.push_secondary(udp(b"p2"));
        conn.push_secondary(udp(b"p3"));

        let out = drain(&mut conn);
        let order: Vec<&[u8]> = out.released.iter().map(|p| &p.transport()[8..]).collect();
        assert_eq!(order, vec![b"p1".as_slice(), b"p2".as_slice(), b"p3".as_slice()]);
        assert!(conn.is_idle());
    }

    #[test]
    fn test_unpaired_tail_waits() {
        let mut conn = Connection::new(TransportProtocol::Udp);
        conn.push_primary(udp(b"a"));
        conn.push_primary(udp(b"b"));
        conn.push_secondary(udp(b"a"));

        let out = drain(&mut conn);
        assert_eq!(out.matched, 1);
        assert_eq!(conn.primary_len(), 1);
        assert_eq!(conn.state(), ComparisonState::Idle);
        assert!(!conn.is_idle());
    }

    #[test]
    fn test_tcp_different_isn_matches() {
        let mut conn = Connection::new(TransportProtocol::Tcp);
        conn.push_primary(tcp(1000, 0, TcpFlags::SYN, &[]));
        conn.push_secondary(tcp(777_000, 0, TcpFlags::SYN, &[]));
        conn.push_primary(tcp(1001, 5001, TcpFlags::ACK | TcpFlags::PSH, b"GET /"));
        conn.push_secondary(tcp(777_001, 5001, TcpFlags::ACK | TcpFlags::PSH, b"GET /"));

        let out = drain(&mut conn);
        assert_eq!(out.matched, 2);
        assert!(out.divergence.is_none());
        assert!(conn.is_idle());
    }

    #[test]
    fn test_tcp_payload_divergence() {
        let mut conn = Connection::new(TransportProtocol::Tcp);
        conn.push_primary(tcp(1000, 0, TcpFlags::SYN, &[]));
        conn.push_secondary(tcp(2000, 0, TcpFlags::SYN, &[]));
        conn.push_primary(tcp(1001, 9, TcpFlags::ACK, b"abc"));
        conn.push_secondary(tcp(2001, 9, TcpFlags::ACK, b"abd"));

        let out = drain(&mut conn);
        assert_eq!(out.matched, 1);
        assert_eq!(out.divergence, Some(Mismatch::Payload { offset: 2 }));
    }

    #[test]
    fn test_tcp_sequence_divergence() {
        let mut conn = Connection::new(TransportProtocol::Tcp);
        conn.push_primary(tcp(1000, 0, TcpFlags::SYN, &[]));
        conn.push_secondary(tcp(2000, 0, TcpFlags::SYN, &[]));
        conn.push_primary(tcp(1001, 9, TcpFlags::ACK, b"abc"));
        conn.push_secondary(tcp(2004, 9, TcpFlags::ACK, b"abc"));

        let out = drain(&mut conn);
        assert_eq!(
            out.divergence,
            Some(Mismatch::Sequence {
                primary: 1,
                secondary: 4
            })
        );
    }

    #[test]
    fn test_tcp_primary_retransmit_released_alone() {
        let mut conn = Connection::new(TransportProtocol::Tcp);
        conn.push_primary(tcp(1000, 0, TcpFlags::SYN, &[]));
        conn.push_secondary(tcp(2000, 0, TcpFlags::SYN, &[]));
        conn.push_primary(tcp(1001, 9, TcpFlags::ACK, b"data"));
        conn.push_secondary(tcp(2001, 9, TcpFlags::ACK, b"data"));
        drain(&mut conn);

        // primary resends the same data, secondary has nothing to pair with it
        conn.push_primary(tcp(1001, 9, TcpFlags::ACK, b"data"));
        assert!(conn.try_schedule());
        let out = drain(&mut conn);
        assert_eq!(out.retransmits, 1);
        assert_eq!(out.released.len(), 1);
        assert!(out.divergence.is_none());
        assert_eq!(conn.primary_len(), 0);
    }

    #[test]
    fn test_tcp_secondary_retransmit_discarded() {
        let mut conn = Connection::new(TransportProtocol::Tcp);
        conn.push_primary(tcp(1000, 0, TcpFlags::SYN, &[]));
        conn.push_secondary(tcp(2000, 0, TcpFlags::SYN, &[]));
        drain(&mut conn);

        conn.push_secondary(tcp(2000, 0, TcpFlags::SYN, &[]));
        conn.push_secondary(tcp(2001, 9, TcpFlags::ACK, b"x"));
        conn.push_primary(tcp(1001, 9, TcpFlags::ACK, b"x"));

        let out = drain(&mut conn);
        assert_eq!(out.retransmits, 1);
        assert_eq!(out.matched, 1);
        assert!(conn.is_idle());
    }

    #[test]
    fn test_tcp_fin_marks_closed() {
        let mut conn = Connection::new(TransportProtocol::Tcp);
        conn.push_primary(tcp(1000, 0, TcpFlags::SYN, &[]));
        conn.push_secondary(tcp(2000, 0, TcpFlags::SYN, &[]));
        drain(&mut conn);
        assert!(!conn.is_closed());

        conn.push_primary(tcp(1001, 9, TcpFlags::FIN | TcpFlags::ACK, &[]));
        conn.push_secondary(tcp(2001, 9, TcpFlags::FIN | TcpFlags::ACK, &[]));
        drain(&mut conn);
        assert!(conn.is_closed());
    }

    #[test]
    fn test_fin_retransmit_after_close_released_alone() {
        let mut conn = Connection::new(TransportProtocol::Tcp);
        conn.push_primary(tcp(1000, 0, TcpFlags::SYN, &[]));
        conn.push_secondary(tcp(2000, 0, TcpFlags::SYN, &[]));
        conn.push_primary(tcp(1001, 9, TcpFlags::FIN | TcpFlags::ACK, &[]));
        conn.push_secondary(tcp(2001, 9, TcpFlags::FIN | TcpFlags::ACK, &[]));
        drain(&mut conn);
        assert!(conn.is_closed());

        // the peer's ACK was lost; only the primary guest resends its FIN
        conn.push_primary(tcp(1001, 9, TcpFlags::FIN | TcpFlags::ACK, &[]));
        assert!(conn.try_schedule());
        let out = drain(&mut conn);
        assert_eq!(out.retransmits, 1);
        assert_eq!(out.released.len(), 1);
        conn.finish_processing();
        assert!(conn.is_idle());
    }

    #[test]
    fn test_syn_after_close_starts_new_stream() {
        let mut conn = Connection::new(TransportProtocol::Tcp);
        conn.push_primary(tcp(1000, 0, TcpFlags::SYN, &[]));
        conn.push_secondary(tcp(2000, 0, TcpFlags::SYN, &[]));
        conn.push_primary(tcp(1001, 9, TcpFlags::RST, &[]));
        conn.push_secondary(tcp(2001, 9, TcpFlags::RST, &[]));
        drain(&mut conn);
        assert!(conn.is_closed());

        conn.push_primary(tcp(50_000, 0, TcpFlags::SYN, &[]));
        conn.push_secondary(tcp(90_000, 0, TcpFlags::SYN, &[]));
        let out = drain(&mut conn);
        assert_eq!(out.matched, 1);
        assert!(out.divergence.is_none());
        assert!(!conn.is_closed());
    }

    #[test]
    fn test_reset_after_checkpoint_relearns_bases() {
        let mut state = ProtocolState::for_protocol(TransportProtocol::Tcp);
        assert_eq!(
            state.compare(&tcp(10, 0, TcpFlags::SYN, &[]), &tcp(20, 0, TcpFlags::SYN, &[])),
            Verdict::Matched
        );
        state.reset_after_checkpoint();
        // both guests now share the primary's sequence space
        assert_eq!(
            state.compare(
                &tcp(11, 5, TcpFlags::ACK, b"z"),
                &tcp(11, 5, TcpFlags::ACK, b"z")
            ),
            Verdict::Matched
        );
    }
}
