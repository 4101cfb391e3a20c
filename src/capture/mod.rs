//! Packet capture backends
//!
//! The daemon hosts its own packet pipeline: each protected interface is a
//! bridge between a guest-facing and an uplink-facing capture socket, with
//! the mirror engine spliced in between.

mod af_packet;
mod bridge;

pub use af_packet::AfPacketSocket;
pub use bridge::{Bridge, ChannelSink, Outbound, GUEST_PORT, UPLINK_PORT};

use crate::Result;
use std::future::Future;

/// Information about a received packet
#[derive(Debug, Clone)]
pub struct RxInfo {
    /// Number of bytes received
    pub len: usize,
    /// VLAN ID if the kernel stripped it
    pub vlan_id: Option<u16>,
}

/// Packet capture backend trait
///
/// All backends must implement this trait to be bridged through an engine.
pub trait Capture: Send + Sync {
    /// Receive a packet into the provided buffer
    fn recv(&mut self, buf: &mut [u8]) -> impl Future<Output = Result<RxInfo>> + Send;

    /// Send a packet
    fn send(&mut self, buf: &[u8]) -> impl Future<Output = Result<usize>> + Send;
}
