//! Per-role packet classification
//!
//! Decides, for every frame of a Running engine, whether it is held for
//! comparison, mirrored to the peer, or handed on unchanged. Anything that
//! cannot be tracked fails open.

use super::connection::ConnectionKey;
use super::engine::EngineCore;
use super::lock;
use super::packet::{Direction, Packet, SenderId};
use crate::config::Role;
use crate::Error;
use tracing::{debug, warn};

/// What the engine does with a classified record
#[derive(Debug)]
pub(crate) enum Disposition {
    /// Not tracked; hand the frame on
    PassThrough(Packet),
    /// Sent to the peer and handed on
    MirroredThrough(Packet),
    /// Held in a connection queue
    Buffered,
    /// Held in a connection queue and sent to the peer
    BufferedAndMirrored,
}

/// Role-specific behaviour of an engine
pub(crate) trait RoleClassifier: Send + Sync {
    fn role(&self) -> Role;

    /// Classify a frame from the local pipeline
    fn classify(&self, core: &EngineCore, packet: Packet) -> Disposition;

    /// Handle a frame received over the mirror transport
    fn on_mirror_frame(&self, core: &EngineCore, frame: Vec<u8>);

    /// Release this engine's held primary records downstream and drop its
    /// secondary records. Returns `(released, discarded)`.
    fn flush(&self, core: &EngineCore) -> (usize, usize) {
        let mut released = 0;
        let mut discarded = 0;
        for (_, conn) in core.registry.snapshot() {
            let mut conn = lock(&conn);
            let flushed = conn.flush_owned(core.id);
            released += flushed.released.len();
            discarded += flushed.discarded;
            core.release(flushed.released);
        }
        (released, discarded)
    }
}

pub(crate) fn for_role(role: Role) -> Box<dyn RoleClassifier> {
    match role {
        Role::Primary => Box::new(PrimaryClassifier),
        Role::Secondary => Box::new(SecondaryClassifier),
    }
}

fn fail_open(core: &EngineCore, key: ConnectionKey, error: Error, record: Option<Packet>) -> Option<Packet> {
    if matches!(error, Error::CapacityExceeded { .. }) {
        core.metrics.capacity_exceeded.inc();
    }
    warn!(engine = %core.id, %key, %error, "flow not tracked, failing open");
    record
}

/// Primary side: holds guest output until the secondary's copy matches,
/// mirrors network input to the secondary.
#[derive(Debug, Default)]
pub(crate) struct PrimaryClassifier;

impl PrimaryClassifier {
    fn hold_output(&self, core: &EngineCore, packet: Packet) -> Disposition {
        let key = match ConnectionKey::from_packet(&packet) {
            Ok(key) => key,
            Err(e) => {
                debug!(engine = %core.id, error = %e, "untracked output");
                return Disposition::PassThrough(packet);
            }
        };

        let limit = core.settings.max_queue_depth;
        let mut record = Some(packet);
        let pushed = core.registry.with_connection(key, |conn| {
            if let Some(packet) = record.take() {
                conn.push_primary(packet);
            }
            // over the limit the oldest records go out unpaired, in order
            // with anything comparison releases for this flow
            let shed = conn.shed_primary(core.id, limit);
            let shed_count = shed.len();
            if shed_count > 0 {
                core.metrics.overflow_released.add(shed_count as u64);
                core.release(shed);
            }
            (shed_count, conn.try_schedule())
        });

        match pushed {
            Ok((shed, schedule)) => {
                if schedule {
                    core.schedule(key);
                }
                if shed > 0 {
                    warn!(engine = %core.id, %key, shed, limit, "primary queue over limit, released unpaired");
                    core.request_checkpoint();
                }
                Disposition::Buffered
            }
            Err(e) => match fail_open(core, key, e, record) {
                Some(packet) => Disposition::PassThrough(packet),
                None => Disposition::Buffered,
            },
        }
    }
}

impl RoleClassifier for PrimaryClassifier {
    fn role(&self) -> Role {
        Role::Primary
    }

    fn classify(&self, core: &EngineCore, packet: Packet) -> Disposition {
        match packet.direction() {
            Direction::Ingress => {
                core.send_mirror(packet.data());
                Disposition::MirroredThrough(packet)
            }
            Direction::Egress => self.hold_output(core, packet),
        }
    }

    /// Frames from the secondary are its guest's output: comparison copies
    /// only, so anything unusable is dropped.
    fn on_mirror_frame(&self, core: &EngineCore, frame: Vec<u8>) {
        let packet = match Packet::capture(frame, core.id, SenderId::MIRROR, Direction::Egress) {
            Ok(packet) => packet,
            Err(e) => {
                core.metrics.mirror_dropped.inc();
                debug!(engine = %core.id, error = %e, "unusable secondary copy dropped");
                return;
            }
        };
        let key = match ConnectionKey::from_packet(&packet) {
            Ok(key) => key,
            Err(e) => {
                core.metrics.mirror_dropped.inc();
                debug!(engine = %core.id, error = %e, "untracked secondary copy dropped");
                return;
            }
        };

        let pushed = core.registry.with_connection(key, |conn| {
            conn.push_secondary(packet);
            conn.try_schedule()
        });
        match pushed {
            Ok(true) => core.schedule(key),
            Ok(false) => {}
            Err(e) => {
                core.metrics.mirror_dropped.inc();
                fail_open(core, key, e, None);
            }
        }
    }
}

/// Secondary side: reports guest output to the primary, injects the
/// primary's network input toward the local guest.
#[derive(Debug, Default)]
pub(crate) struct SecondaryClassifier;

impl RoleClassifier for SecondaryClassifier {
    fn role(&self) -> Role {
        Role::Secondary
    }

    fn classify(&self, core: &EngineCore, packet: Packet) -> Disposition {
        if packet.direction() == Direction::Ingress {
            return Disposition::PassThrough(packet);
        }

        let key = match ConnectionKey::from_packet(&packet) {
            Ok(key) => key,
            Err(e) => {
                debug!(engine = %core.id, error = %e, "untracked output");
                return Disposition::PassThrough(packet);
            }
        };

        core.send_mirror(packet.data());
        // a stalled link fails the engine open on the way
        if !core.is_running() {
            return Disposition::PassThrough(packet);
        }

        let mut record = Some(packet);
        let pushed = core.registry.with_connection(key, |conn| {
            if let Some(packet) = record.take() {
                conn.push_secondary(packet);
            }
            if conn.secondary_len() > core.settings.max_queue_depth {
                conn.drop_oldest_secondary().is_some()
            } else {
                false
            }
        });

        match pushed {
            Ok(dropped) => {
                if dropped {
                    debug!(engine = %core.id, %key, "secondary queue full, oldest record dropped");
                }
                Disposition::BufferedAndMirrored
            }
            Err(e) => match fail_open(core, key, e, record) {
                Some(packet) => Disposition::MirroredThrough(packet),
                None => Disposition::BufferedAndMirrored,
            },
        }
    }

    /// Frames from the primary are network input: deliver them to the
    /// local guest unchanged.
    fn on_mirror_frame(&self, core: &EngineCore, frame: Vec<u8>) {
        core.metrics.injected.inc();
        core.pass_to_next(&frame, SenderId::MIRROR, Direction::Ingress);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataplane::engine::testing::*;
    use crate::dataplane::engine::{EngineSettings, ProxyEvent};
    use crate::dataplane::packet::fixtures::*;
    use crate::mirror::FrameHandler;
    use crate::protocol::TransportProtocol;

    fn udp_key(src_port: u16) -> ConnectionKey {
        ConnectionKey::new(GUEST, REMOTE, src_port, 53, TransportProtocol::Udp)
    }

    #[test]
    fn test_for_role() {
        assert_eq!(for_role(Role::Primary).role(), Role::Primary);
        assert_eq!(for_role(Role::Secondary).role(), Role::Secondary);
    }

    #[test]
    fn test_primary_holds_output_until_paired() {
        let fx = engine(Role::Primary, 16);
        force_running(&fx.engine);
        let frame = udp_frame(4000, 53, b"query");

        fx.engine.deliver(&frame, SenderId(5), Direction::Egress);
        assert_eq!(fx.sink.count(), 0);
        let conn = fx.registry.get(&udp_key(4000)).unwrap();
        assert_eq!(lock(&conn).primary_len(), 1);
        assert!(!lock(&conn).is_processing());

        // the secondary's copy arrives over the mirror
        core(&fx.engine).on_frame(frame.clone());
        assert!(lock(&conn).is_processing());

        core(&fx.engine).compare_connection(udp_key(4000));
        let released = fx.sink.frames.lock().unwrap().clone();
        assert_eq!(released, vec![(frame, SenderId(5), Direction::Egress)]);
        assert!(lock(&conn).is_idle());
    }

    #[test]
    fn test_primary_reports_divergence() {
        let mut fx = engine(Role::Primary, 16);
        force_running(&fx.engine);

        fx.engine
            .deliver(&udp_frame(4000, 53, b"alpha"), SenderId(5), Direction::Egress);
        core(&fx.engine).on_frame(udp_frame(4000, 53, b"alphA"));
        core(&fx.engine).compare_connection(udp_key(4000));

        assert_eq!(fx.sink.count(), 0);
        assert!(fx.gate.is_pending());
        match fx.events.try_recv().unwrap() {
            ProxyEvent::Divergence { key, .. } => assert_eq!(key, udp_key(4000)),
            other => panic!("unexpected event {:?}", other),
        }
        assert!(!fx.registry.is_quiescent());
    }

    #[test]
    fn test_primary_capacity_fails_open() {
        let fx = engine(Role::Primary, 1);
        force_running(&fx.engine);

        fx.engine
            .deliver(&udp_frame(1, 53, b"a"), SenderId(1), Direction::Egress);
        fx.engine
            .deliver(&udp_frame(2, 53, b"b"), SenderId(1), Direction::Egress);

        assert_eq!(fx.registry.len(), 1);
        assert_eq!(fx.sink.count(), 1);
        assert!(fx.registry.get(&udp_key(2)).is_none());
    }

    #[test]
    fn test_primary_ingress_passes_through() {
        let fx = engine(Role::Primary, 16);
        force_running(&fx.engine);

        let frame = udp_frame(53, 4000, b"answer");
        fx.engine.deliver(&frame, SenderId(2), Direction::Ingress);
        assert_eq!(fx.sink.count(), 1);
        assert_eq!(fx.registry.len(), 0);
    }

    #[test]
    fn test_primary_queue_limit_requests_checkpoint() {
        let mut fx = engine(Role::Primary, 16);
        force_running(&fx.engine);
        let limit = fx.engine.settings().max_queue_depth;

        for _ in 0..=limit {
            fx.engine
                .deliver(&udp_frame(9, 53, b"burst"), SenderId(1), Direction::Egress);
        }
        assert!(fx.gate.is_pending());
        assert!(matches!(
            fx.events.try_recv().unwrap(),
            ProxyEvent::CheckpointRequested { .. }
        ));
    }

    #[test]
    fn test_primary_queue_stays_bounded_without_copies() {
        let mut fx = engine_with(EngineSettings {
            max_queue_depth: 8,
            ..EngineSettings::new(Role::Primary, "127.0.0.1:1")
        });
        force_running(&fx.engine);

        let frames: Vec<Vec<u8>> = (0..500u16)
            .map(|i| udp_frame(9, 53, &i.to_be_bytes()))
            .collect();
        for frame in &frames {
            fx.engine.deliver(frame, SenderId(1), Direction::Egress);
        }

        let conn = fx.registry.get(&udp_key(9)).unwrap();
        assert_eq!(lock(&conn).primary_len(), 8);
        // the oldest went out, in capture order
        let sent: Vec<Vec<u8>> = fx.sink.frames.lock().unwrap().iter().map(|f| f.0.clone()).collect();
        assert_eq!(sent, frames[..492].to_vec());
        assert!(fx.gate.is_pending());
        assert!(matches!(
            fx.events.try_recv().unwrap(),
            ProxyEvent::CheckpointRequested { .. }
        ));
    }

    #[test]
    fn test_primary_drops_unusable_copies() {
        let fx = engine(Role::Primary, 16);
        force_running(&fx.engine);

        core(&fx.engine).on_frame(vec![0u8; 10]);
        assert_eq!(fx.registry.len(), 0);
        assert_eq!(fx.sink.count(), 0);
    }

    #[test]
    fn test_secondary_buffers_output_and_injects_input() {
        let fx = engine(Role::Secondary, 16);
        force_running(&fx.engine);

        fx.engine
            .deliver(&udp_frame(4000, 53, b"query"), SenderId(5), Direction::Egress);
        assert_eq!(fx.sink.count(), 0);
        let conn = fx.registry.get(&udp_key(4000)).unwrap();
        assert_eq!(lock(&conn).secondary_len(), 1);

        let input = udp_frame(53, 4000, b"answer");
        core(&fx.engine).on_frame(input.clone());
        let injected = fx.sink.frames.lock().unwrap().clone();
        assert_eq!(injected, vec![(input, SenderId::MIRROR, Direction::Ingress)]);
    }

    #[test]
    fn test_secondary_queue_drops_oldest() {
        let fx = engine(Role::Secondary, 16);
        force_running(&fx.engine);
        let limit = fx.engine.settings().max_queue_depth;

        for _ in 0..limit + 3 {
            fx.engine
                .deliver(&udp_frame(8, 53, b"chatty"), SenderId(1), Direction::Egress);
        }
        let conn = fx.registry.get(&udp_key(8)).unwrap();
        assert_eq!(lock(&conn).secondary_len(), limit);
    }

    #[test]
    fn test_flush_releases_primary_and_discards_copies() {
        let fx = engine(Role::Primary, 16);
        force_running(&fx.engine);

        fx.engine
            .deliver(&udp_frame(1, 53, b"one"), SenderId(1), Direction::Egress);
        fx.engine
            .deliver(&udp_frame(2, 53, b"two"), SenderId(1), Direction::Egress);
        core(&fx.engine).on_frame(udp_frame(3, 53, b"three"));

        assert_eq!(fx.engine.flush(), (2, 1));
        assert_eq!(fx.sink.count(), 2);
        assert!(fx.registry.is_quiescent());
    }
}
