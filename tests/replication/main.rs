//! Replication tests: a primary and a secondary engine mirroring over
//! loopback TCP.
//!
//! Run with: cargo test --test replication

mod pair;

use pair::{next_event, tcp_frame, udp_frame, udp_reply, wait_until, Pair, GUEST, REMOTE};
use shadowlink::dataplane::{
    CheckpointOutcome, ConnectionKey, Direction, LifecycleStatus, Mismatch, ProxyEvent, SenderId,
};
use shadowlink::protocol::tcp::{SegmentSpec, TcpFlags};
use shadowlink::protocol::TransportProtocol;

fn syn(seq: u32) -> SegmentSpec {
    SegmentSpec {
        src_port: 40000,
        dst_port: 80,
        seq,
        ack: 0,
        flags: TcpFlags::SYN,
        window: 65535,
    }
}

/// A SYN leaving the primary guest is held until the secondary's SYN
/// arrives, then released; the secondary's copy never leaves its host.
#[tokio::test]
async fn test_tcp_syn_released_after_match() {
    let pair = Pair::started().await;

    let primary_syn = tcp_frame(syn(1000), b"", 7);
    pair.primary.guest_output(&primary_syn);
    assert_eq!(pair.primary.sink.count(), 0);

    // different ISN and IP id, same connection
    pair.secondary.guest_output(&tcp_frame(syn(88_000), b"", 9));

    pair.primary.sink.wait_for(1).await;
    let frames = pair.primary.sink.frames();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].0, primary_syn);
    assert_eq!(frames[0].1, SenderId(1));
    assert_eq!(frames[0].2, Direction::Egress);

    assert_eq!(pair.secondary.sink.count(), 0);
    assert_eq!(pair.primary.group.metrics().matched.get(), 1);

    // both queues drained and the connection back to Idle
    let group = &pair.primary.group;
    wait_until(|| group.checkpoint_safe()).await;
    let key = ConnectionKey::new(GUEST, REMOTE, 40000, 80, TransportProtocol::Tcp);
    let conn = group.registry().get(&key).unwrap();
    let conn = conn.lock().unwrap();
    assert!(conn.is_idle());
    assert_eq!(conn.primary_len() + conn.secondary_len(), 0);
}

/// After both sides closed, a FIN the primary guest sends again still has
/// the matched stream to be checked against and is released on its own.
#[tokio::test]
async fn test_fin_retransmit_after_close_released() {
    let pair = Pair::started().await;

    let mut fin = syn(1000);
    fin.flags = TcpFlags::FIN | TcpFlags::ACK;
    fin.ack = 77;

    pair.primary.guest_output(&tcp_frame(syn(1000), b"", 1));
    pair.primary.guest_output(&tcp_frame(SegmentSpec { seq: 1001, ..fin }, b"", 2));
    pair.secondary.guest_output(&tcp_frame(syn(5000), b"", 3));
    pair.secondary.guest_output(&tcp_frame(SegmentSpec { seq: 5001, ..fin }, b"", 4));
    pair.primary.sink.wait_for(2).await;

    let again = tcp_frame(SegmentSpec { seq: 1001, ..fin }, b"", 5);
    pair.primary.guest_output(&again);
    pair.primary.sink.wait_for(3).await;

    assert_eq!(pair.primary.sink.frames()[2].0, again);
    assert_eq!(pair.primary.group.metrics().retransmits.get(), 1);
    let group = &pair.primary.group;
    wait_until(|| group.checkpoint_safe()).await;
}

#[tokio::test]
async fn test_data_segments_match_in_order() {
    let pair = Pair::started().await;

    let mut data = syn(1000);
    data.flags = TcpFlags::ACK | TcpFlags::PSH;
    data.ack = 500;

    let first = tcp_frame(SegmentSpec { seq: 1000, ..data }, b"GET / HTTP/1.1\r\n", 1);
    let second = tcp_frame(SegmentSpec { seq: 1016, ..data }, b"\r\n", 2);
    pair.primary.guest_output(&first);
    pair.primary.guest_output(&second);

    pair.secondary
        .guest_output(&tcp_frame(SegmentSpec { seq: 7000, ..data }, b"GET / HTTP/1.1\r\n", 3));
    pair.secondary
        .guest_output(&tcp_frame(SegmentSpec { seq: 7016, ..data }, b"\r\n", 4));

    pair.primary.sink.wait_for(2).await;
    let released: Vec<Vec<u8>> = pair.primary.sink.frames().into_iter().map(|f| f.0).collect();
    assert_eq!(released, vec![first, second]);
}

/// Before start there is no peer, so nothing may be held.
#[tokio::test]
async fn test_fail_open_before_start() {
    let pair = Pair::new();
    assert_eq!(pair.primary.engine.status(), LifecycleStatus::Inactive);

    let frame = udp_frame(5000, 53, b"query");
    pair.primary.guest_output(&frame);
    pair.secondary.guest_output(&frame);

    assert_eq!(pair.primary.sink.frames()[0].0, frame);
    assert_eq!(pair.secondary.sink.frames()[0].0, frame);
    assert_eq!(pair.primary.group.registry().len(), 0);
}

#[tokio::test]
async fn test_divergence_reported_and_held() {
    let mut pair = Pair::started().await;

    let primary_out = udp_frame(5000, 53, b"aaaa");
    pair.primary.guest_output(&primary_out);
    pair.secondary.guest_output(&udp_frame(5000, 53, b"aaab"));

    match next_event(&mut pair.primary.events).await {
        ProxyEvent::Divergence { name, mismatch, .. } => {
            assert_eq!(name, "net0");
            // 8 byte UDP header, then the fourth payload byte
            assert_eq!(mismatch, Mismatch::Payload { offset: 11 });
        }
        other => panic!("unexpected event {:?}", other),
    }

    assert_eq!(pair.primary.sink.count(), 0);
    assert!(pair.primary.group.query_checkpoint_pending());
    assert_eq!(pair.primary.group.try_checkpoint(), CheckpointOutcome::Deferred);

    // the controller decides to resynchronize anyway
    assert!(matches!(
        pair.primary.group.force_checkpoint(),
        CheckpointOutcome::Completed { released: 1, .. }
    ));
    assert_eq!(pair.primary.sink.frames()[0].0, primary_out);
    assert!(!pair.primary.group.query_checkpoint_pending());
    assert_eq!(pair.primary.group.metrics().diverged.get(), 1);
}

#[tokio::test]
async fn test_checkpoint_waits_for_outstanding_comparison() {
    let pair = Pair::started().await;
    let group = &pair.primary.group;

    pair.primary.guest_output(&udp_frame(6000, 123, b"ntp"));
    group.notify_checkpoint_requested();
    assert!(!group.checkpoint_safe());
    assert_eq!(group.try_checkpoint(), CheckpointOutcome::Deferred);
    assert!(group.query_checkpoint_pending());

    pair.secondary.guest_output(&udp_frame(6000, 123, b"ntp"));
    pair.primary.sink.wait_for(1).await;
    wait_until(|| group.checkpoint_safe()).await;

    assert_eq!(
        group.try_checkpoint(),
        CheckpointOutcome::Completed {
            released: 0,
            discarded: 0
        }
    );
    assert!(!group.query_checkpoint_pending());
}

/// Network input reaches the primary guest directly and the secondary
/// guest through the mirror.
#[tokio::test]
async fn test_network_input_injected_on_secondary() {
    let pair = Pair::started().await;

    let reply = udp_reply(53, 5000, b"answer");
    pair.primary.network_input(&reply);

    let primary_frames = pair.primary.sink.frames();
    assert_eq!(primary_frames.len(), 1);
    assert_eq!(primary_frames[0], (reply.clone(), SenderId(2), Direction::Ingress));

    pair.secondary.sink.wait_for(1).await;
    assert_eq!(
        pair.secondary.sink.frames()[0],
        (reply, SenderId::MIRROR, Direction::Ingress)
    );
    assert_eq!(pair.secondary.group.metrics().injected.get(), 1);
}

/// The secondary's own network input is not what its guest should see.
#[tokio::test]
async fn test_secondary_network_input_passes_through() {
    let pair = Pair::started().await;

    let reply = udp_reply(53, 5000, b"local");
    pair.secondary.network_input(&reply);
    assert_eq!(pair.secondary.sink.frames()[0].0, reply);
}

#[tokio::test]
async fn test_transport_loss_fails_open() {
    let mut pair = Pair::started().await;

    let held = udp_frame(7000, 514, b"log line");
    pair.primary.guest_output(&held);
    assert_eq!(pair.primary.sink.count(), 0);

    pair.secondary.engine.stop().await;

    match next_event(&mut pair.primary.events).await {
        ProxyEvent::TransportLost { name, .. } => assert_eq!(name, "net0"),
        other => panic!("unexpected event {:?}", other),
    }
    assert_eq!(pair.primary.engine.status(), LifecycleStatus::Stopped);
    assert_eq!(pair.primary.sink.frames()[0].0, held);

    let after = udp_frame(7000, 514, b"next line");
    pair.primary.guest_output(&after);
    assert_eq!(pair.primary.sink.frames()[1].0, after);
    assert_eq!(pair.primary.group.metrics().transport_errors.get(), 1);
}

#[tokio::test]
async fn test_stopped_engine_cannot_restart() {
    let pair = Pair::started().await;

    pair.primary.group.stop_all(shadowlink::config::Role::Primary).await;
    assert_eq!(pair.primary.engine.status(), LifecycleStatus::Stopped);
    assert!(pair.primary.engine.start().await.is_err());

    let frame = udp_frame(8000, 9, b"discard");
    pair.primary.guest_output(&frame);
    assert_eq!(pair.primary.sink.frames()[0].0, frame);
}
