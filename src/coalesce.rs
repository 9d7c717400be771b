//! Packet coalescing: small outbound datagrams are batched
//! into a single `Combined` frame instead of each getting its own UDP
//! send, up to the negotiated packet size and a hold-count cap.

use bytes::Bytes;

use crate::frame::{build_combined, MAX_COMBINED_ITEM_LEN};

/// Buffers small outbound datagrams for one connection until either a
/// force-flush condition is hit or [`CoalesceBuffer::flush`] is called on
/// the connection's tick.
#[derive(Debug, Default)]
pub struct CoalesceBuffer {
    pending: Vec<Bytes>,
    pending_bytes: usize,
}

impl CoalesceBuffer {
    /// Creates an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a datagram to be combined. Returns `true` if queuing this
    /// item means the buffer must be flushed before any more can be
    /// accepted — its three force-flush conditions:
    ///
    /// 1. the datagram alone is larger than [`MAX_COMBINED_ITEM_LEN`] (can
    ///    never be combined, since its length can't fit in the one-byte
    ///    prefix, so anything already queued must go out first and this one
    ///    is sent standalone by the caller instead of being queued),
    /// 2. adding it would overrun `max_packet_size` once header, CRC and
    ///    existing contents are accounted for,
    /// 3. the hold count (`hold_size`) would be exceeded.
    pub fn push(&mut self, datagram: Bytes, max_packet_size: usize, hold_size: usize) -> PushResult {
        if datagram.len() > MAX_COMBINED_ITEM_LEN {
            return PushResult::TooLargeToCombine(datagram);
        }

        // header (2) + crc reserve (4, worst case) + one length byte per
        // existing item + this item's length byte + contents.
        let projected = 2 + 4
            + self.pending.iter().map(|p| p.len() + 1).sum::<usize>()
            + datagram.len()
            + 1;
        if projected > max_packet_size || self.pending.len() + 1 > hold_size {
            let flushed = self.take();
            self.pending.push(datagram.clone());
            self.pending_bytes = datagram.len();
            return PushResult::FlushedThenQueued(flushed, datagram);
        }

        self.pending_bytes += datagram.len();
        self.pending.push(datagram);
        PushResult::Queued
    }

    /// Whether anything is waiting to be flushed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Number of bytes currently queued (sub-packet bodies only).
    #[must_use]
    pub fn pending_bytes(&self) -> usize {
        self.pending_bytes
    }

    /// Takes everything queued and builds the `Combined` datagram(s) for
    /// it, clearing the buffer. A single item left alone is returned
    /// unwrapped rather than wastefully combined with nothing.
    #[must_use]
    pub fn take(&mut self) -> Vec<Bytes> {
        if self.pending.is_empty() {
            return Vec::new();
        }
        if self.pending.len() == 1 {
            self.pending_bytes = 0;
            return vec![self.pending.pop().expect("checked len == 1")];
        }
        let items: Vec<&[u8]> = self.pending.iter().map(|b| &b[..]).collect();
        let combined = build_combined(items).expect("all items checked against MAX_COMBINED_ITEM_LEN");
        self.pending.clear();
        self.pending_bytes = 0;
        vec![combined]
    }
}

/// Outcome of [`CoalesceBuffer::push`].
#[derive(Debug)]
pub enum PushResult {
    /// Queued without needing a flush.
    Queued,
    /// Datagram was larger than [`MAX_COMBINED_ITEM_LEN`] and must be sent
    /// on its own; nothing was queued.
    TooLargeToCombine(Bytes),
    /// The buffer was flushed to make room, and the new datagram is now
    /// the sole entry in a fresh buffer.
    FlushedThenQueued(Vec<Bytes>, Bytes),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_items_combine() {
        let mut buf = CoalesceBuffer::new();
        assert!(matches!(
            buf.push(Bytes::from_static(b"one"), 512, 10),
            PushResult::Queued
        ));
        assert!(matches!(
            buf.push(Bytes::from_static(b"two"), 512, 10),
            PushResult::Queued
        ));
        let flushed = buf.take();
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0][0], 0x00);
        assert_eq!(flushed[0][1], 0x03); // Combined opcode
    }

    #[test]
    fn single_item_flushes_unwrapped() {
        let mut buf = CoalesceBuffer::new();
        buf.push(Bytes::from_static(b"solo"), 512, 10);
        let flushed = buf.take();
        assert_eq!(flushed, vec![Bytes::from_static(b"solo")]);
    }

    #[test]
    fn oversized_item_is_never_queued() {
        let mut buf = CoalesceBuffer::new();
        let huge = Bytes::from(vec![0u8; MAX_COMBINED_ITEM_LEN + 1]);
        match buf.push(huge.clone(), 1500, 10) {
            PushResult::TooLargeToCombine(item) => assert_eq!(item, huge),
            other => panic!("expected TooLargeToCombine, got {other:?}"),
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn mid_range_item_too_large_to_combine_does_not_panic() {
        // Regression test: 256..=512 bytes used to slip past the (wrong)
        // COMBINED_CAP-based check, get queued, and then panic in `take`
        // when `build_combined` rejected it for not fitting a one-byte
        // length prefix.
        let mut buf = CoalesceBuffer::new();
        let mid = Bytes::from(vec![0u8; 300]);
        match buf.push(mid.clone(), 1500, 10) {
            PushResult::TooLargeToCombine(item) => assert_eq!(item, mid),
            other => panic!("expected TooLargeToCombine, got {other:?}"),
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn hold_size_forces_flush() {
        let mut buf = CoalesceBuffer::new();
        buf.push(Bytes::from_static(b"a"), 1500, 1);
        match buf.push(Bytes::from_static(b"b"), 1500, 1) {
            PushResult::FlushedThenQueued(flushed, queued) => {
                assert_eq!(flushed, vec![Bytes::from_static(b"a")]);
                assert_eq!(queued, Bytes::from_static(b"b"));
            }
            other => panic!("expected FlushedThenQueued, got {other:?}"),
        }
    }

    #[test]
    fn max_packet_size_forces_flush() {
        let mut buf = CoalesceBuffer::new();
        buf.push(Bytes::from(vec![0u8; 100]), 120, 10);
        match buf.push(Bytes::from(vec![0u8; 100]), 120, 10) {
            PushResult::FlushedThenQueued(flushed, _) => assert_eq!(flushed.len(), 1),
            other => panic!("expected FlushedThenQueued, got {other:?}"),
        }
    }
}
