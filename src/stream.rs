//! Per-stream reliable delivery state.
//!
//! Each connection owns [`opcode::STREAM_COUNT`](crate::opcode::STREAM_COUNT)
//! independent instances of [`ReliableStream`]: one per `Packet`/`Fragment`
//! opcode family. Out-of-order arrivals are buffered by sequence number;
//! in-order delivery only ever hands the caller the next expected sequence.

use std::{collections::BTreeMap, time::{Duration, Instant}};

use bytes::Bytes;

use crate::seq::{compare, Order, Seq};

/// A reliable datagram buffered while still waiting on its turn for
/// in-order hand-off, or while still waiting on an ack before retransmit.
#[derive(Debug, Clone)]
pub struct SentPacket {
    /// Fully encoded datagram bytes, ready to resend verbatim.
    pub datagram: Bytes,
    /// Whether this is one piece of a larger fragmented message (affects
    /// which resent-packet counter in [`crate::stats::Stats`] increments).
    pub is_fragment: bool,
    /// When this datagram was first placed on the wire.
    pub first_sent: Instant,
    /// When this datagram was last (re)sent.
    pub last_sent: Instant,
    /// How many times this datagram has been resent (0 until the first
    /// resend).
    pub times_resent: u32,
    /// Current per-packet resend delay; doubles on each resend up to
    /// `resend_delay_max`.
    pub resend_delay_ms: u32,
}

/// Send- and receive-side bookkeeping for one reliable stream.
#[derive(Debug)]
pub struct ReliableStream {
    /// Next sequence number this side will assign to an outbound packet.
    next_send: Seq,
    /// Datagrams sent but not yet cumulatively acked, keyed by sequence.
    in_flight: BTreeMap<u16, SentPacket>,
    /// Highest cumulative ack received from the peer so far.
    peer_ack: Seq,
    /// Individually out-of-order-acked sequences not yet covered by
    /// `peer_ack`.
    peer_out_of_order_acks: BTreeMap<u16, ()>,
    /// How many packets have been acked since the last resend scan, used to
    /// skip a resend pass entirely when nothing new has come in.
    acked_since_last_resend: u32,

    /// Next sequence number expected from the peer, in order.
    next_recv: Seq,
    /// Datagrams received ahead of `next_recv`, buffered until their turn.
    reorder_buffer: BTreeMap<u16, Bytes>,
    /// Highest sequence actually delivered to the application so far.
    last_delivered: Option<Seq>,
}

impl Default for ReliableStream {
    fn default() -> Self {
        Self {
            next_send: Seq::ZERO,
            in_flight: BTreeMap::new(),
            peer_ack: Seq(u16::MAX),
            peer_out_of_order_acks: BTreeMap::new(),
            acked_since_last_resend: 0,
            next_recv: Seq::ZERO,
            reorder_buffer: BTreeMap::new(),
            last_delivered: None,
        }
    }
}

impl ReliableStream {
    /// Creates an empty stream with both sequence counters at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The sequence number [`Self::send`] will assign next, without
    /// consuming it. Lets callers build a frame's header before handing
    /// the frame to `send` for bookkeeping.
    #[must_use]
    pub fn peek_next_send(&self) -> Seq {
        self.next_send
    }

    /// Assigns the next send sequence number and records the outbound
    /// datagram so it can be resent until acked. `resend_delay_ms` is the
    /// initial per-packet delay, computed by the caller from the
    /// connection's rolling ping estimate and configured factor/bounds.
    pub fn send(
        &mut self,
        datagram: Bytes,
        is_fragment: bool,
        now: Instant,
        resend_delay_ms: u32,
    ) -> Seq {
        let seq = self.next_send;
        self.next_send += Seq(1);
        self.in_flight.insert(
            seq.0,
            SentPacket {
                datagram,
                is_fragment,
                first_sent: now,
                last_sent: now,
                times_resent: 0,
                resend_delay_ms,
            },
        );
        seq
    }

    /// Number of datagrams sent but not yet acked.
    #[must_use]
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// `first_sent` of the oldest still-unacked datagram, used to decide
    /// whether the stream has exceeded `resend_timeout` entirely.
    #[must_use]
    pub fn oldest_first_sent(&self) -> Option<Instant> {
        self.in_flight.values().map(|p| p.first_sent).min()
    }

    /// Whether a resend scan is worth running at all: either something has
    /// been acked since the last scan, or at least one entry's delay has
    /// elapsed. Lets the caller skip idle streams cheaply.
    #[must_use]
    pub fn resend_scan_needed(&self, now: Instant) -> bool {
        self.acked_since_last_resend > 0
            || self
                .in_flight
                .values()
                .any(|p| elapsed_ms(p.last_sent, now) >= p.resend_delay_ms)
    }

    /// Applies a cumulative `Ack[stream]`: every sequence up to and
    /// including `through` is considered delivered and dropped from
    /// `in_flight`. Returns one round-trip sample per removed entry
    /// (`now - last_sent`) for ping estimation.
    pub fn apply_ack(&mut self, through: Seq, now: Instant) -> Vec<Duration> {
        if !matches!(compare(self.peer_ack, through), Order::Future) {
            return Vec::new();
        }
        self.peer_ack = through;
        let cutoff = through.0;
        let drained: Vec<u16> = self
            .in_flight
            .keys()
            .copied()
            .filter(|&seq| is_covered(seq, cutoff))
            .collect();
        let mut samples = Vec::with_capacity(drained.len());
        for seq in drained {
            if let Some(sent) = self.in_flight.remove(&seq) {
                samples.push(now.saturating_duration_since(sent.last_sent));
                self.acked_since_last_resend += 1;
            }
        }
        self.peer_out_of_order_acks
            .retain(|&seq, ()| !is_covered(seq, cutoff));
        samples
    }

    /// Applies an `OutOfOrderAck[stream]`: exactly one sequence is
    /// delivered, independent of the cumulative ack frontier. Returns a
    /// round-trip sample if that sequence was still in flight.
    pub fn apply_out_of_order_ack(&mut self, seq: Seq, now: Instant) -> Option<Duration> {
        let sample = self.in_flight.remove(&seq.0).map(|sent| {
            self.acked_since_last_resend += 1;
            now.saturating_duration_since(sent.last_sent)
        });
        self.peer_out_of_order_acks.insert(seq.0, ());
        sample
    }

    /// Runs one resend scan, bounded by a packet count and byte budget
    /// shared across all streams on the connection
    /// (`MAX_CLIENT_RECV_PACKETS_PER_WINDOW`/`MAX_CLIENT_RECV_BYTES_PER_WINDOW`).
    /// Returns the datagrams to re-emit, and decrements the two budgets in
    /// place. Each resent entry's delay doubles, capped at
    /// `resend_delay_max_ms`.
    pub fn due_for_resend(
        &mut self,
        now: Instant,
        resend_delay_max_ms: u32,
        budget_packets: &mut u32,
        budget_bytes: &mut u32,
    ) -> Vec<(Seq, Bytes, bool)> {
        self.acked_since_last_resend = 0;
        let mut out = Vec::new();
        for (&seq, sent) in &mut self.in_flight {
            if *budget_packets == 0 || *budget_bytes == 0 {
                break;
            }
            if elapsed_ms(sent.last_sent, now) < sent.resend_delay_ms {
                continue;
            }
            out.push((Seq(seq), sent.datagram.clone(), sent.is_fragment));
            sent.last_sent = now;
            sent.times_resent += 1;
            sent.resend_delay_ms = sent.resend_delay_ms.saturating_mul(2).min(resend_delay_max_ms);
            *budget_packets = budget_packets.saturating_sub(1);
            *budget_bytes = budget_bytes.saturating_sub(sent.datagram.len() as u32);
        }
        out
    }

    /// Records an inbound datagram at `seq`, classifying it against the
    /// next-expected sequence and buffering it for in-order delivery if
    /// it's ahead. Returns `true` if this is a fresh arrival (not a
    /// duplicate), which callers use to decide whether to emit an ack.
    pub fn receive(&mut self, seq: Seq, data: Bytes) -> bool {
        match compare(self.next_recv, seq) {
            Order::Past => false,
            Order::Current | Order::Future => {
                if self.reorder_buffer.contains_key(&seq.0) {
                    return false;
                }
                self.reorder_buffer.insert(seq.0, data);
                true
            }
        }
    }

    /// Drains every contiguous in-order datagram now available, advancing
    /// `next_recv` as it goes.
    pub fn drain_in_order(&mut self) -> Vec<Bytes> {
        let mut out = Vec::new();
        while let Some(data) = self.reorder_buffer.remove(&self.next_recv.0) {
            out.push(data);
            self.last_delivered = Some(self.next_recv);
            self.next_recv += Seq(1);
        }
        out
    }

    /// Next sequence expected in order; a cumulative ack for a `Current`
    /// receipt reports this value (: "advance `sequence_in`, ...
    /// emit cumulative `Ack` for `sequence_in`").
    #[must_use]
    pub fn next_recv(&self) -> Seq {
        self.next_recv
    }

    /// One less than [`Self::next_recv`]: what a `Past` receipt acks.
    #[must_use]
    pub fn last_in_order(&self) -> Seq {
        self.next_recv - Seq(1)
    }

    /// Highest sequence delivered to the application so far, if any.
    #[must_use]
    pub fn last_delivered(&self) -> Option<Seq> {
        self.last_delivered
    }
}

fn elapsed_ms(since: Instant, now: Instant) -> u32 {
    now.saturating_duration_since(since).as_millis().min(u64::from(u32::MAX)) as u32
}

/// Whether `seq` lies in the closed wrapping range up to `cutoff`, treating
/// `cutoff` as the most-recently-advanced boundary. Used to decide which
/// `in_flight` entries a cumulative ack actually covers without assuming
/// sequences are stored in non-wrapped numeric order forever.
fn is_covered(seq: u16, cutoff: u16) -> bool {
    matches!(compare(Seq(cutoff), Seq(seq)), Order::Current | Order::Past)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_assigns_increasing_sequences() {
        let mut stream = ReliableStream::new();
        let now = Instant::now();
        let a = stream.send(Bytes::from_static(b"a"), false, now, 100);
        let b = stream.send(Bytes::from_static(b"b"), false, now, 100);
        assert_eq!(a, Seq(0));
        assert_eq!(b, Seq(1));
        assert_eq!(stream.in_flight_count(), 2);
    }

    #[test]
    fn cumulative_ack_drains_in_flight_and_samples_ping() {
        let mut stream = ReliableStream::new();
        let now = Instant::now();
        stream.send(Bytes::from_static(b"a"), false, now, 100);
        stream.send(Bytes::from_static(b"b"), false, now, 100);
        stream.send(Bytes::from_static(b"c"), false, now, 100);
        let later = now + Duration::from_millis(50);
        let samples = stream.apply_ack(Seq(1), later);
        assert_eq!(stream.in_flight_count(), 1);
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0], Duration::from_millis(50));
    }

    #[test]
    fn out_of_order_ack_removes_single_entry() {
        let mut stream = ReliableStream::new();
        let now = Instant::now();
        stream.send(Bytes::from_static(b"a"), false, now, 100);
        stream.send(Bytes::from_static(b"b"), false, now, 100);
        let sample = stream.apply_out_of_order_ack(Seq(1), now);
        assert_eq!(stream.in_flight_count(), 1);
        assert!(sample.is_some());
    }

    #[test]
    fn receive_buffers_out_of_order_and_drains_when_filled() {
        let mut stream = ReliableStream::new();
        assert!(stream.receive(Seq(1), Bytes::from_static(b"b")));
        assert!(stream.drain_in_order().is_empty());
        assert!(stream.receive(Seq(0), Bytes::from_static(b"a")));
        let drained = stream.drain_in_order();
        assert_eq!(drained, vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")]);
        assert_eq!(stream.next_recv(), Seq(2));
    }

    #[test]
    fn duplicate_receive_is_rejected() {
        let mut stream = ReliableStream::new();
        assert!(stream.receive(Seq(0), Bytes::from_static(b"a")));
        stream.drain_in_order();
        assert!(!stream.receive(Seq(0), Bytes::from_static(b"a")));
    }

    #[test]
    fn resend_scan_respects_per_packet_delay_and_doubles() {
        let mut stream = ReliableStream::new();
        let now = Instant::now();
        stream.send(Bytes::from_static(b"a"), false, now, 100);
        let mut packets = 300;
        let mut bytes = 140 * 1024;
        let due = stream.due_for_resend(now, 1000, &mut packets, &mut bytes);
        assert!(due.is_empty());

        let later = now + Duration::from_millis(150);
        let due = stream.due_for_resend(later, 1000, &mut packets, &mut bytes);
        assert_eq!(due.len(), 1);
        assert_eq!(packets, 299);
    }

    #[test]
    fn resend_scan_respects_packet_budget() {
        let mut stream = ReliableStream::new();
        let now = Instant::now();
        stream.send(Bytes::from_static(b"a"), false, now, 10);
        stream.send(Bytes::from_static(b"b"), false, now, 10);
        let later = now + Duration::from_millis(20);
        let mut packets = 1;
        let mut bytes = 1024;
        let due = stream.due_for_resend(later, 1000, &mut packets, &mut bytes);
        assert_eq!(due.len(), 1);
        assert_eq!(packets, 0);
    }
}
