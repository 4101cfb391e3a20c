//! Primary/secondary pair on loopback
//!
//! Each side gets its own `MirrorGroup`, as it would on two hosts, with one
//! engine named "net0" whose output is recorded instead of transmitted.

use shadowlink::config::Role;
use shadowlink::dataplane::{
    Direction, Engine, EngineSettings, MirrorGroup, PacketSink, ProxyEvent, SenderId,
};
use shadowlink::protocol::ethernet::FrameBuilder;
use shadowlink::protocol::tcp::{self, SegmentSpec};
use shadowlink::protocol::{ipv4, udp, EtherType, MacAddr};
use std::net::{Ipv4Addr, TcpListener};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

pub const GUEST: Ipv4Addr = Ipv4Addr::new(192, 168, 0, 10);
pub const REMOTE: Ipv4Addr = Ipv4Addr::new(10, 1, 1, 1);

const WAIT: Duration = Duration::from_secs(5);

/// Sink that keeps everything handed on
#[derive(Default)]
pub struct Collector {
    frames: Mutex<Vec<(Vec<u8>, SenderId, Direction)>>,
}

impl PacketSink for Collector {
    fn pass_to_next(&self, frame: &[u8], sender: SenderId, direction: Direction) {
        self.frames
            .lock()
            .unwrap()
            .push((frame.to_vec(), sender, direction));
    }
}

impl Collector {
    pub fn frames(&self) -> Vec<(Vec<u8>, SenderId, Direction)> {
        self.frames.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.frames.lock().unwrap().len()
    }

    /// Poll until at least `n` frames were handed on
    pub async fn wait_for(&self, n: usize) {
        wait_until(|| self.count() >= n).await;
    }
}

pub async fn wait_until(mut done: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !done() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub async fn next_event(events: &mut mpsc::UnboundedReceiver<ProxyEvent>) -> ProxyEvent {
    tokio::time::timeout(WAIT, events.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

/// Grab a port nobody is listening on
fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

pub struct Side {
    pub group: MirrorGroup,
    pub engine: Engine,
    pub sink: Arc<Collector>,
    pub events: mpsc::UnboundedReceiver<ProxyEvent>,
}

impl Side {
    fn new(role: Role, addr: String) -> Self {
        let mut group = MirrorGroup::default();
        let sink = Arc::new(Collector::default());
        let engine = group.add_engine("net0", EngineSettings::new(role, addr), sink.clone());
        let events = group.take_events().unwrap();
        Self {
            group,
            engine,
            sink,
            events,
        }
    }

    /// Frame leaving the guest
    pub fn guest_output(&self, frame: &[u8]) {
        assert_eq!(self.engine.deliver(frame, SenderId(1), Direction::Egress), frame.len());
    }

    /// Frame arriving from the network
    pub fn network_input(&self, frame: &[u8]) {
        assert_eq!(self.engine.deliver(frame, SenderId(2), Direction::Ingress), frame.len());
    }
}

pub struct Pair {
    pub primary: Side,
    pub secondary: Side,
}

impl Pair {
    pub fn new() -> Self {
        let port = free_port();
        Self {
            primary: Side::new(Role::Primary, format!("127.0.0.1:{}", port)),
            secondary: Side::new(Role::Secondary, format!("127.0.0.1:{}", port)),
        }
    }

    /// Secondary listens, primary connects
    pub async fn start(&self) {
        let (secondary, primary) = tokio::join!(
            self.secondary.group.start_all(Role::Secondary),
            self.primary.group.start_all(Role::Primary),
        );
        secondary.unwrap();
        primary.unwrap();
    }

    pub async fn started() -> Self {
        let pair = Self::new();
        pair.start().await;
        pair
    }
}

fn ethernet(ip_packet: &[u8]) -> Vec<u8> {
    FrameBuilder::new()
        .dst_mac(MacAddr([0x02, 0, 0, 0, 0, 0x02]))
        .src_mac(MacAddr([0x02, 0, 0, 0, 0, 0x01]))
        .ethertype(EtherType::Ipv4 as u16)
        .payload(ip_packet)
        .build()
}

pub fn udp_frame(src_port: u16, dst_port: u16, payload: &[u8]) -> Vec<u8> {
    let dgram = udp::build_datagram(src_port, dst_port, payload);
    ethernet(&ipv4::build_packet(GUEST, REMOTE, udp::PROTOCOL_NUMBER, 1, &dgram))
}

/// Same flow seen from the network side
pub fn udp_reply(src_port: u16, dst_port: u16, payload: &[u8]) -> Vec<u8> {
    let dgram = udp::build_datagram(src_port, dst_port, payload);
    ethernet(&ipv4::build_packet(REMOTE, GUEST, udp::PROTOCOL_NUMBER, 1, &dgram))
}

pub fn tcp_frame(spec: SegmentSpec, payload: &[u8], ip_id: u16) -> Vec<u8> {
    let seg = tcp::build_segment(GUEST, REMOTE, spec, payload);
    ethernet(&ipv4::build_packet(GUEST, REMOTE, tcp::PROTOCOL_NUMBER, ip_id, &seg))
}
