//! Splitting an outbound message into `Fragment[stream]` datagrams and
//! reassembling them on receipt.
//!
//! The wire scheme here carries the total reassembled size on the *first*
//! fragment only, rather than flagging the *last* fragment. Reassembly is
//! therefore driven by a byte-range write into a pre-sized buffer rather
//! than a fragment-count countdown.

use bytes::Bytes;

use crate::error::ReassembleError;

/// Splits `payload` into a sequence of fragment bodies, each at most
/// `max_fragment_size` bytes (the header's `total_size` field is carried
/// out-of-band by the caller on the first fragment; these are plain data
/// slices).
#[must_use]
pub fn split(payload: &[u8], max_fragment_size: usize) -> Vec<Bytes> {
    debug_assert!(max_fragment_size > 0);
    if payload.is_empty() {
        return vec![Bytes::new()];
    }
    payload
        .chunks(max_fragment_size)
        .map(Bytes::copy_from_slice)
        .collect()
}

/// Splits `payload` the way the original sender does: the first fragment
/// carries the `total_size` prefix and so has `first_max` bytes of room for
/// its body, every later fragment carries only the plain reliable header
/// and so can hold the larger `rest_max` bytes.
#[must_use]
pub fn split_first_fragment_smaller(payload: &[u8], first_max: usize, rest_max: usize) -> Vec<Bytes> {
    debug_assert!(first_max > 0 && rest_max > 0);
    if payload.is_empty() {
        return vec![Bytes::new()];
    }
    let mut pieces = Vec::new();
    let first_len = first_max.min(payload.len());
    pieces.push(Bytes::copy_from_slice(&payload[..first_len]));
    let mut used = first_len;
    while used < payload.len() {
        let take = (payload.len() - used).min(rest_max);
        pieces.push(Bytes::copy_from_slice(&payload[used..used + take]));
        used += take;
    }
    pieces
}

/// Reassembles fragments for a single in-flight message on one stream.
///
/// Fragments may arrive out of order (within the stream's own reliable
/// delivery, which already enforces in-order hand-off — but
/// a resend can still redeliver a fragment already written, which is
/// tolerated as a no-op overlap rather than an error as long as the bytes
/// agree on length).
#[derive(Debug)]
pub struct Reassembler {
    total_size: usize,
    buf: Vec<u8>,
    written: Vec<bool>,
    received_bytes: usize,
}

impl Reassembler {
    /// Starts reassembling a message declared to be `total_size` bytes.
    #[must_use]
    pub fn new(total_size: usize) -> Self {
        Self {
            total_size,
            buf: vec![0u8; total_size],
            written: vec![false; total_size],
            received_bytes: 0,
        }
    }

    /// Declared total size of the message being reassembled.
    #[must_use]
    pub fn total_size(&self) -> usize {
        self.total_size
    }

    /// Bytes written so far. Fragments on a stream are delivered in
    /// sequence order by the reliable layer, so this doubles as the byte
    /// offset at which the next fragment's body belongs.
    #[must_use]
    pub fn received_bytes(&self) -> usize {
        self.received_bytes
    }

    /// Writes one fragment's bytes at `offset`. Returns `Ok(true)` once the
    /// message is fully assembled.
    pub fn write(&mut self, offset: usize, data: &[u8]) -> Result<bool, ReassembleError> {
        let end = offset + data.len();
        if end > self.total_size {
            return Err(ReassembleError::Overflow {
                start: offset,
                end,
                total: self.total_size,
            });
        }
        for (i, &byte) in data.iter().enumerate() {
            let idx = offset + i;
            if self.written[idx] {
                if self.buf[idx] != byte {
                    return Err(ReassembleError::Overlap {
                        start: offset,
                        end,
                    });
                }
                continue;
            }
            self.buf[idx] = byte;
            self.written[idx] = true;
            self.received_bytes += 1;
        }
        Ok(self.received_bytes == self.total_size)
    }

    /// Consumes the reassembler, returning the completed message. Callers
    /// must only call this once `write` has returned `Ok(true)`.
    #[must_use]
    pub fn finish(self) -> Bytes {
        debug_assert_eq!(self.received_bytes, self.total_size);
        Bytes::from(self.buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_then_reassemble_in_order() {
        let payload = b"the quick brown fox jumps over the lazy dog";
        let pieces = split(payload, 10);
        assert!(pieces.len() > 1);

        let mut reassembler = Reassembler::new(payload.len());
        let mut offset = 0;
        let mut done = false;
        for piece in &pieces {
            done = reassembler.write(offset, piece).unwrap();
            offset += piece.len();
        }
        assert!(done);
        assert_eq!(&reassembler.finish()[..], payload.as_slice());
    }

    #[test]
    fn reassemble_out_of_order() {
        let payload = b"0123456789abcdef";
        let pieces = split(payload, 4);
        let mut reassembler = Reassembler::new(payload.len());
        // write fragment 2, then 0, then 3, then 1
        reassembler.write(8, &pieces[2]).unwrap();
        reassembler.write(0, &pieces[0]).unwrap();
        let done = reassembler.write(12, &pieces[3]).unwrap();
        assert!(!done);
        let done = reassembler.write(4, &pieces[1]).unwrap();
        assert!(done);
        assert_eq!(&reassembler.finish()[..], payload.as_slice());
    }

    #[test]
    fn duplicate_fragment_is_tolerated() {
        let payload = b"abcdefgh";
        let mut reassembler = Reassembler::new(payload.len());
        reassembler.write(0, &payload[..4]).unwrap();
        // redelivered resend of the same fragment
        let done = reassembler.write(0, &payload[..4]).unwrap();
        assert!(!done);
        let done = reassembler.write(4, &payload[4..]).unwrap();
        assert!(done);
    }

    #[test]
    fn overflow_is_rejected() {
        let mut reassembler = Reassembler::new(4);
        let err = reassembler.write(2, b"abcd").unwrap_err();
        assert!(matches!(
            err,
            ReassembleError::Overflow {
                start: 2,
                end: 6,
                total: 4
            }
        ));
    }

    #[test]
    fn conflicting_overlap_is_rejected() {
        let mut reassembler = Reassembler::new(4);
        reassembler.write(0, b"ab").unwrap();
        let err = reassembler.write(0, b"xy").unwrap_err();
        assert!(matches!(err, ReassembleError::Overlap { start: 0, end: 2 }));
    }

    #[test]
    fn empty_payload_splits_to_single_empty_fragment() {
        let pieces = split(b"", 10);
        assert_eq!(pieces.len(), 1);
        assert!(pieces[0].is_empty());
    }

    #[test]
    fn first_fragment_smaller_then_reassembles() {
        let payload: Vec<u8> = (0..25u32).map(|i| i as u8).collect();
        let pieces = split_first_fragment_smaller(&payload, 5, 9);
        // first fragment at the reduced cap, remaining ones at the larger cap
        assert_eq!(pieces[0].len(), 5);
        assert!(pieces[1..].iter().all(|p| p.len() <= 9));

        let mut reassembler = Reassembler::new(payload.len());
        let mut offset = 0;
        let mut done = false;
        for piece in &pieces {
            done = reassembler.write(offset, piece).unwrap();
            offset += piece.len();
        }
        assert!(done);
        assert_eq!(&reassembler.finish()[..], payload.as_slice());
    }

    #[test]
    fn first_fragment_smaller_single_piece_when_it_fits() {
        let payload = b"short";
        let pieces = split_first_fragment_smaller(payload, 10, 20);
        assert_eq!(pieces.len(), 1);
        assert_eq!(&pieces[0][..], payload);
    }
}
