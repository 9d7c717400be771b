//! Exercises the per-connection engine end to end against the concrete
//! scenarios: reordered delivery, fragmentation, retransmission, coalescing
//! and stale-connection closure. Each test wires two [`Connection`]s
//! directly, bypassing [`ConnectionManager`] and real sockets entirely, so
//! timing can be driven with fabricated [`Instant`]s instead of real sleeps.

use std::{sync::Arc, time::{Duration, Instant}};

use daybreak_proto::connection::{Connection, ConnectionEvent};
use daybreak_proto::ConnectionManagerOptions;

fn opts(mutate: impl FnOnce(&mut ConnectionManagerOptions)) -> Arc<ConnectionManagerOptions> {
    let mut o = ConnectionManagerOptions {
        crc_length: 0,
        hold_size: 1,
        hold_length_ms: 0,
        ..ConnectionManagerOptions::default()
    };
    mutate(&mut o);
    Arc::new(o)
}

fn linked_pair(options: Arc<ConnectionManagerOptions>, now: Instant) -> (Connection, Connection) {
    let mut a = Connection::accept(0xC0DE, 0xFEED, Arc::clone(&options), now);
    let mut b = Connection::accept(0xC0DE, 0xFEED, options, now);
    a.drain_ready_to_send();
    b.drain_ready_to_send();
    (a, b)
}

#[test]
fn reordered_delivery_is_resequenced_before_handoff() {
    let now = Instant::now();
    let options = opts(|_| {});
    let (mut sender, mut receiver) = linked_pair(options, now);

    let payloads: Vec<&[u8]> = vec![b"zero", b"one", b"two", b"three"];
    for p in &payloads {
        sender.queue_packet(p, 0, true);
    }
    let (wire, _) = sender.tick(now, Duration::from_millis(1));
    assert_eq!(wire.len(), 4, "each queued packet should be its own datagram with hold_size=1");

    // Deliver 0, 2, 3, 1 — out of order.
    let mut delivered = Vec::new();
    for idx in [0usize, 2, 3, 1] {
        let (_acks, events) = receiver.on_datagram(&wire[idx], now);
        for event in events {
            if let ConnectionEvent::PacketRecv(bytes) = event {
                delivered.push(bytes);
            }
        }
    }

    assert_eq!(delivered.len(), 4);
    assert_eq!(&delivered[0][..], b"zero");
    assert_eq!(&delivered[1][..], b"one");
    assert_eq!(&delivered[2][..], b"two");
    assert_eq!(&delivered[3][..], b"three");
}

#[test]
fn reordered_delivery_emits_expected_ack_sequence() {
    let now = Instant::now();
    let options = opts(|_| {});
    let (mut sender, mut receiver) = linked_pair(options, now);

    for p in [b"zero".as_slice(), b"one", b"two", b"three"] {
        sender.queue_packet(p, 0, true);
    }
    let (wire, _) = sender.tick(now, Duration::from_millis(1));

    // `on_datagram` only queues the ack into the coalesce buffer; with
    // hold_size=1 a freshly queued single item isn't flushed by that same
    // push (see `coalesce::tests::hold_size_forces_flush`), so a tick (with
    // this test's hold_length_ms=0) is needed to actually see it on the
    // wire, matching how `ConnectionManager` drives a real connection.
    let mut deliver = |datagram: &bytes::Bytes| {
        let (mut acks, _) = receiver.on_datagram(datagram, now);
        let (flushed, _) = receiver.tick(now, Duration::from_millis(1));
        acks.extend(flushed);
        acks
    };

    // seq 0 (Current) -> Ack(0)
    let acks = deliver(&wire[0]);
    assert_eq!(acks.len(), 1);
    assert_eq!(acks[0][1], 0x15); // Ack0

    // seq 2 (Future) -> OutOfOrderAck(2)
    let acks = deliver(&wire[2]);
    assert_eq!(acks.len(), 1);
    assert_eq!(acks[0][1], 0x11); // OutOfOrderAck0

    // seq 3 (Future) -> OutOfOrderAck(3)
    let acks = deliver(&wire[3]);
    assert_eq!(acks.len(), 1);
    assert_eq!(acks[0][1], 0x11);

    // seq 1 (Current) fills the gap -> cumulative Ack(3)
    let acks = deliver(&wire[1]);
    assert_eq!(acks.len(), 1);
    assert_eq!(acks[0][1], 0x15);
}

#[test]
fn large_payload_fragments_and_reassembles_exactly() {
    let now = Instant::now();
    let options = opts(|o| {
        o.crc_length = 2;
        o.max_packet_size = 512;
    });
    let max_packet_size = options.max_packet_size;
    let (mut sender, mut receiver) = linked_pair(options, now);

    let payload: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
    sender.queue_packet(&payload, 1, true);
    let (wire, _) = sender.tick(now, Duration::from_millis(1));
    assert!(
        wire.len() > 1,
        "a 5000-byte payload over a 512-byte max_packet_size must fragment"
    );
    for datagram in &wire {
        assert!(datagram.len() as u32 <= max_packet_size);
    }

    let mut delivered = Vec::new();
    for datagram in &wire {
        let (_acks, events) = receiver.on_datagram(datagram, now);
        for event in events {
            if let ConnectionEvent::PacketRecv(bytes) = event {
                delivered.push(bytes);
            }
        }
    }

    assert_eq!(delivered.len(), 1, "fragments reassemble into exactly one payload");
    assert_eq!(delivered[0].len(), payload.len());
    assert_eq!(&delivered[0][..], payload.as_slice());
}

#[test]
fn lost_packet_is_retransmitted_once_delay_elapses_then_acked() {
    let now = Instant::now();
    let options = opts(|o| {
        o.resend_delay_ms = 50;
        o.resend_delay_min = 50;
        o.resend_delay_factor = 0.0;
    });
    let (mut sender, mut receiver) = linked_pair(options, now);

    sender.queue_packet(b"important", 0, true);
    let (wire, _) = sender.tick(now, Duration::from_millis(1));
    assert_eq!(wire.len(), 1);
    // Simulate total loss of the first send: the receiver never sees it, so
    // nothing is acked and the datagram stays in `sent_packets`.

    // Before the resend delay elapses, a tick produces nothing new to send.
    let soon = now + Duration::from_millis(10);
    let (wire_too_soon, _) = sender.tick(soon, Duration::from_millis(1));
    assert!(wire_too_soon.is_empty());

    // After the delay, the tick's resend scan re-emits the same datagram.
    let later = now + Duration::from_millis(60);
    let (resent, _) = sender.tick(later, Duration::from_millis(1));
    assert_eq!(resent.len(), 1);
    assert_eq!(resent[0], wire[0]);
    assert_eq!(sender.get_stats().resent_full, 1);

    // Now deliver the resent copy; the receiver acks it and the sender's
    // retransmit bookkeeping clears on the next tick. `on_datagram` only
    // queues the ack into the coalesce buffer (see
    // `coalesce::tests::hold_size_forces_flush`), so a tick is needed to
    // actually see it on the wire.
    let (_, events) = receiver.on_datagram(&resent[0], later);
    let (acks, _) = receiver.tick(later, Duration::from_millis(1));
    assert_eq!(acks.len(), 1);
    assert_eq!(acks[0][1], 0x15); // Ack0
    assert!(events
        .iter()
        .any(|e| matches!(e, ConnectionEvent::PacketRecv(b) if &b[..] == b"important")));

    let (_, _) = sender.on_datagram(&acks[0], later);
    let quiet = later + Duration::from_millis(200);
    let (nothing_more, _) = sender.tick(quiet, Duration::from_millis(1));
    assert!(nothing_more.is_empty(), "acked packet must not be resent again");
}

#[test]
fn stale_connected_peer_closes_after_grace_period() {
    let now = Instant::now();
    let options = opts(|o| {
        o.stale_connection_ms = 50;
        o.connection_close_time = 50;
    });
    let mut conn = Connection::accept(1, 0, options, now);
    conn.drain_ready_to_send();

    let t1 = now + Duration::from_millis(60);
    let (_, events) = conn.tick(t1, Duration::from_millis(1));
    assert!(events.iter().any(|e| matches!(
        e,
        ConnectionEvent::StatusChanged {
            from: daybreak_proto::ConnectionStatus::Connected,
            to: daybreak_proto::ConnectionStatus::Disconnecting,
        }
    )));

    let t2 = t1 + Duration::from_millis(60);
    let (_, events) = conn.tick(t2, Duration::from_millis(1));
    assert!(events.iter().any(|e| matches!(
        e,
        ConnectionEvent::StatusChanged {
            from: daybreak_proto::ConnectionStatus::Disconnecting,
            to: daybreak_proto::ConnectionStatus::Disconnected,
        }
    )));
    assert_eq!(conn.status(), daybreak_proto::ConnectionStatus::Disconnected);
}
