//! Error taxonomy for the framing, decoding and reassembly paths.
//!
//! None of these are ever returned to the caller of
//! [`crate::connection::Connection::queue_packet`] — they are reported via
//! the manager's error callback and reflected in [`crate::stats::Stats`].

use thiserror::Error;

/// A datagram did not have the shape its opcode requires.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FramingError {
    /// The datagram was shorter than the header its first byte(s) imply.
    #[error("datagram too short: got {len} bytes, need at least {need}")]
    TooShort {
        /// Number of bytes actually present.
        len: usize,
        /// Number of bytes required.
        need: usize,
    },
    /// A `Combined`/`AppCombined` sub-packet length ran past the end of the
    /// outer datagram.
    #[error("combined sub-packet length {claimed} overruns remaining {remaining} bytes")]
    CombinedOverrun {
        /// Length the sub-packet claimed.
        claimed: usize,
        /// Bytes actually remaining in the outer datagram.
        remaining: usize,
    },
    /// A fragment's body would write past `fragment_total_bytes`.
    #[error("fragment write of {extra} bytes would overflow total size {total}")]
    FragmentOverflow {
        /// Bytes the new fragment would add.
        extra: usize,
        /// Declared total size of the message being reassembled.
        total: usize,
    },
    /// An opcode byte did not match any known protocol frame.
    #[error("unknown opcode {0:#04x}")]
    UnknownOpcode(u8),
}

/// A received datagram failed CRC validation or a decode pass.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Datagram was malformed before decoding even began.
    #[error(transparent)]
    Framing(#[from] FramingError),
    /// The trailing CRC bytes did not match the computed CRC.
    #[error("crc mismatch: expected {expected:#010x}, computed {computed:#010x}")]
    CrcMismatch {
        /// CRC bytes carried on the wire.
        expected: u32,
        /// CRC computed locally over the same bytes.
        computed: u32,
    },
    /// The DEFLATE decompression pass failed.
    #[error("deflate decompression failed")]
    Inflate,
}

/// Reassembly of a fragmented message failed for the given fragment.
///
/// These are not fatal: network conditions like duplicated or lost packets
/// can legitimately trigger them. The reassembly state is left valid.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReassembleError {
    /// Received a fragment with a byte range already written by a previous
    /// fragment.
    #[error("fragment range [{start}, {end}) overlaps already-written data")]
    Overlap {
        /// Start offset of the incoming fragment.
        start: usize,
        /// End offset of the incoming fragment.
        end: usize,
    },
    /// The fragment's byte range runs past the message's declared total
    /// size.
    #[error("fragment range [{start}, {end}) overflows total size {total}")]
    Overflow {
        /// Start offset of the incoming fragment.
        start: usize,
        /// End offset of the incoming fragment.
        end: usize,
        /// Declared total size of the message.
        total: usize,
    },
}
