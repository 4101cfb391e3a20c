//! Guest/uplink bridge
//!
//! Frames read from the guest side enter the engine as Egress, frames read
//! from the uplink as Ingress. Whatever the engine hands on comes back
//! through a [`ChannelSink`] and is written out by direction: Egress to the
//! uplink, Ingress to the guest.

use super::Capture;
use crate::dataplane::{Direction, Engine, PacketSink, SenderId};
use crate::Result;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Sender id for frames read from the guest side
pub const GUEST_PORT: SenderId = SenderId(1);
/// Sender id for frames read from the uplink side
pub const UPLINK_PORT: SenderId = SenderId(2);

const RECV_BUFFER_SIZE: usize = 65536;

/// A frame the engine handed on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub frame: Vec<u8>,
    pub direction: Direction,
}

/// [`PacketSink`] that queues frames for the bridge's transmit side
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl PacketSink for ChannelSink {
    fn pass_to_next(&self, frame: &[u8], _sender: SenderId, direction: Direction) {
        // closed once the bridge has exited
        let _ = self.tx.send(Outbound {
            frame: frame.to_vec(),
            direction,
        });
    }
}

/// One protected interface: two capture sockets and the engine between them
pub struct Bridge<G, U> {
    engine: Engine,
    guest: G,
    uplink: U,
    outbound: mpsc::UnboundedReceiver<Outbound>,
}

impl<G: Capture, U: Capture> Bridge<G, U> {
    pub fn new(
        engine: Engine,
        guest: G,
        uplink: U,
        outbound: mpsc::UnboundedReceiver<Outbound>,
    ) -> Self {
        Self {
            engine,
            guest,
            uplink,
            outbound,
        }
    }

    /// Pump frames until `shutdown` flips to true or its sender is dropped
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut guest_buf = vec![0u8; RECV_BUFFER_SIZE];
        let mut uplink_buf = vec![0u8; RECV_BUFFER_SIZE];
        info!(name = self.engine.name(), "bridge running");

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                result = self.guest.recv(&mut guest_buf) => match result {
                    Ok(rx) => {
                        self.engine.deliver(&guest_buf[..rx.len], GUEST_PORT, Direction::Egress);
                    }
                    Err(e) => warn!(name = self.engine.name(), error = %e, "guest receive failed"),
                },
                result = self.uplink.recv(&mut uplink_buf) => match result {
                    Ok(rx) => {
                        self.engine.deliver(&uplink_buf[..rx.len], UPLINK_PORT, Direction::Ingress);
                    }
                    Err(e) => warn!(name = self.engine.name(), error = %e, "uplink receive failed"),
                },
                Some(out) = self.outbound.recv() => self.transmit(out).await,
            }
        }

        // hand on whatever the engine released while stopping
        while let Ok(out) = self.outbound.try_recv() {
            self.transmit(out).await;
        }
        info!(name = self.engine.name(), "bridge stopped");
        Ok(())
    }

    async fn transmit(&mut self, out: Outbound) {
        let result = match out.direction {
            Direction::Egress => self.uplink.send(&out.frame).await,
            Direction::Ingress => self.guest.send(&out.frame).await,
        };
        match result {
            Ok(_) => debug!(len = out.frame.len(), direction = ?out.direction, "frame sent"),
            Err(e) => warn!(direction = ?out.direction, error = %e, "send failed"),
        }
    }
}
