//! Protocol opcodes, bit-exact with the legacy wire format.

/// A single-byte protocol opcode, carried as the second byte of a protocol
/// frame (first byte `0x00`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    /// Wraps an application payload whose first byte would otherwise be
    /// `0x00`.
    Padding = 0x00,
    /// Initiator → responder handshake start.
    SessionRequest = 0x01,
    /// Responder → initiator handshake reply.
    SessionResponse = 0x02,
    /// Aggregates several inner datagrams with one-byte length prefixes.
    Combined = 0x03,
    /// Either side tears down the session.
    SessionDisconnect = 0x05,
    /// Empty keep-alive.
    KeepAlive = 0x06,
    /// Requests session statistics from the peer.
    SessionStatRequest = 0x07,
    /// Replies with session statistics.
    SessionStatResponse = 0x08,
    /// Reliable data packet on stream 0.
    Packet0 = 0x09,
    /// Reliable data packet on stream 1.
    Packet1 = 0x0A,
    /// Reliable data packet on stream 2.
    Packet2 = 0x0B,
    /// Reliable data packet on stream 3.
    Packet3 = 0x0C,
    /// Reliable fragment on stream 0.
    Fragment0 = 0x0D,
    /// Reliable fragment on stream 1.
    Fragment1 = 0x0E,
    /// Reliable fragment on stream 2.
    Fragment2 = 0x0F,
    /// Reliable fragment on stream 3.
    Fragment3 = 0x10,
    /// Out-of-order acknowledgement on stream 0.
    OutOfOrderAck0 = 0x11,
    /// Out-of-order acknowledgement on stream 1.
    OutOfOrderAck1 = 0x12,
    /// Out-of-order acknowledgement on stream 2.
    OutOfOrderAck2 = 0x13,
    /// Out-of-order acknowledgement on stream 3.
    OutOfOrderAck3 = 0x14,
    /// Cumulative acknowledgement on stream 0.
    Ack0 = 0x15,
    /// Cumulative acknowledgement on stream 1.
    Ack1 = 0x16,
    /// Cumulative acknowledgement on stream 2.
    Ack2 = 0x17,
    /// Cumulative acknowledgement on stream 3.
    Ack3 = 0x18,
    /// Like [`Opcode::Combined`] but with a variable-length size prefix.
    AppCombined = 0x19,
    /// Outbound ping, empty body.
    OutboundPing = 0x1C,
    /// Sent to a peer the manager has no connection for.
    OutOfSession = 0x1D,
}

impl Opcode {
    /// Parses a raw opcode byte.
    #[must_use]
    pub fn from_u8(b: u8) -> Option<Self> {
        use Opcode::{
            Ack0, Ack1, Ack2, Ack3, AppCombined, Combined, Fragment0, Fragment1, Fragment2,
            Fragment3, KeepAlive, OutOfOrderAck0, OutOfOrderAck1, OutOfOrderAck2, OutOfOrderAck3,
            OutOfSession, OutboundPing, Packet0, Packet1, Packet2, Packet3, Padding,
            SessionDisconnect, SessionRequest, SessionResponse, SessionStatRequest,
            SessionStatResponse,
        };
        Some(match b {
            0x00 => Padding,
            0x01 => SessionRequest,
            0x02 => SessionResponse,
            0x03 => Combined,
            0x05 => SessionDisconnect,
            0x06 => KeepAlive,
            0x07 => SessionStatRequest,
            0x08 => SessionStatResponse,
            0x09 => Packet0,
            0x0A => Packet1,
            0x0B => Packet2,
            0x0C => Packet3,
            0x0D => Fragment0,
            0x0E => Fragment1,
            0x0F => Fragment2,
            0x10 => Fragment3,
            0x11 => OutOfOrderAck0,
            0x12 => OutOfOrderAck1,
            0x13 => OutOfOrderAck2,
            0x14 => OutOfOrderAck3,
            0x15 => Ack0,
            0x16 => Ack1,
            0x17 => Ack2,
            0x18 => Ack3,
            0x19 => AppCombined,
            0x1C => OutboundPing,
            0x1D => OutOfSession,
            _ => return None,
        })
    }

    /// Raw byte value.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Stream index for a `Packet[0..3]` opcode.
    #[must_use]
    pub const fn packet_stream(self) -> Option<u8> {
        match self {
            Self::Packet0 => Some(0),
            Self::Packet1 => Some(1),
            Self::Packet2 => Some(2),
            Self::Packet3 => Some(3),
            _ => None,
        }
    }

    /// Stream index for a `Fragment[0..3]` opcode.
    #[must_use]
    pub const fn fragment_stream(self) -> Option<u8> {
        match self {
            Self::Fragment0 => Some(0),
            Self::Fragment1 => Some(1),
            Self::Fragment2 => Some(2),
            Self::Fragment3 => Some(3),
            _ => None,
        }
    }

    /// Stream index for an `Ack[0..3]` opcode.
    #[must_use]
    pub const fn ack_stream(self) -> Option<u8> {
        match self {
            Self::Ack0 => Some(0),
            Self::Ack1 => Some(1),
            Self::Ack2 => Some(2),
            Self::Ack3 => Some(3),
            _ => None,
        }
    }

    /// Stream index for an `OutOfOrderAck[0..3]` opcode.
    #[must_use]
    pub const fn out_of_order_ack_stream(self) -> Option<u8> {
        match self {
            Self::OutOfOrderAck0 => Some(0),
            Self::OutOfOrderAck1 => Some(1),
            Self::OutOfOrderAck2 => Some(2),
            Self::OutOfOrderAck3 => Some(3),
            _ => None,
        }
    }

    /// Builds a `Packet[stream]` opcode.
    #[must_use]
    pub const fn packet(stream: u8) -> Self {
        match stream {
            0 => Self::Packet0,
            1 => Self::Packet1,
            2 => Self::Packet2,
            _ => Self::Packet3,
        }
    }

    /// Builds a `Fragment[stream]` opcode.
    #[must_use]
    pub const fn fragment(stream: u8) -> Self {
        match stream {
            0 => Self::Fragment0,
            1 => Self::Fragment1,
            2 => Self::Fragment2,
            _ => Self::Fragment3,
        }
    }

    /// Builds an `Ack[stream]` opcode.
    #[must_use]
    pub const fn ack(stream: u8) -> Self {
        match stream {
            0 => Self::Ack0,
            1 => Self::Ack1,
            2 => Self::Ack2,
            _ => Self::Ack3,
        }
    }

    /// Builds an `OutOfOrderAck[stream]` opcode.
    #[must_use]
    pub const fn out_of_order_ack(stream: u8) -> Self {
        match stream {
            0 => Self::OutOfOrderAck0,
            1 => Self::OutOfOrderAck1,
            2 => Self::OutOfOrderAck2,
            _ => Self::OutOfOrderAck3,
        }
    }

    /// Whether this opcode's payload (if any) goes through the XOR /
    /// Compression encode passes.
    #[must_use]
    pub const fn is_encoded(self) -> bool {
        !matches!(
            self,
            Self::SessionRequest | Self::SessionResponse | Self::OutOfSession
        )
    }
}

/// Number of independent reliable streams per connection.
pub const STREAM_COUNT: usize = 4;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_all_known() {
        for b in 0u8..=0x1Du8 {
            if let Some(op) = Opcode::from_u8(b) {
                assert_eq!(op.as_u8(), b);
            }
        }
    }

    #[test]
    fn stream_indices() {
        assert_eq!(Opcode::Packet2.packet_stream(), Some(2));
        assert_eq!(Opcode::Fragment3.fragment_stream(), Some(3));
        assert_eq!(Opcode::Ack0.ack_stream(), Some(0));
        assert_eq!(Opcode::OutOfOrderAck1.out_of_order_ack_stream(), Some(1));
        assert_eq!(Opcode::packet(2), Opcode::Packet2);
    }

    #[test]
    fn unknown_opcode() {
        assert!(Opcode::from_u8(0x7F).is_none());
    }
}
