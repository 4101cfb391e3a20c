//! Network protocol parsing
//!
//! Zero-copy header views used to derive flow keys and compare the
//! primary and secondary copies of a packet, plus small builders for
//! constructing frames.

pub mod ethernet;
pub mod icmp;
pub mod ipv4;
pub mod tcp;
pub mod types;
pub mod udp;

pub use types::*;
