//! Wire shapes for every opcode.
//!
//! All multi-byte fields are big-endian. Every frame here is decoded from
//! (or encoded onto) the bytes that follow the leading `0x00, opcode` pair
//! of a protocol frame — callers strip that pair first.

use bytes::Bytes;

use crate::{
    cursor::{Cursor, Writer},
    error::FramingError,
};

/// `SessionRequest` (opcode `0x01`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionRequest {
    /// Protocol version the initiator speaks.
    pub protocol_version: u32,
    /// Connection identifier chosen by the initiator.
    pub connect_code: u32,
    /// Largest datagram the initiator is willing to receive.
    pub max_packet_size: u32,
}

impl SessionRequest {
    /// Decodes the body (after the `0x00, 0x01` header).
    pub fn decode(body: &[u8]) -> Result<Self, FramingError> {
        let mut c = Cursor::new(body);
        Ok(Self {
            protocol_version: c.read_u32()?,
            connect_code: c.read_u32()?,
            max_packet_size: c.read_u32()?,
        })
    }

    /// Encodes the full datagram, including the `0x00, 0x01` header.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut w = Writer::with_capacity(14);
        w.write_u8(0x00);
        w.write_u8(super::opcode::Opcode::SessionRequest.as_u8());
        w.write_u32(self.protocol_version);
        w.write_u32(self.connect_code);
        w.write_u32(self.max_packet_size);
        w.freeze()
    }
}

/// `SessionResponse` (opcode `0x02`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionResponse {
    /// Echoes the initiator's connect code.
    pub connect_code: u32,
    /// Key used to seed the XOR encode pass for the session lifetime.
    pub encode_key: u32,
    /// CRC trailer length: 0, 2 or 4 bytes.
    pub crc_bytes: u8,
    /// First configured encode pass.
    pub encode_pass1: u8,
    /// Second configured encode pass.
    pub encode_pass2: u8,
    /// Largest datagram the responder is willing to receive.
    pub max_packet_size: u32,
}

impl SessionResponse {
    /// Decodes the body (after the `0x00, 0x02` header).
    pub fn decode(body: &[u8]) -> Result<Self, FramingError> {
        let mut c = Cursor::new(body);
        Ok(Self {
            connect_code: c.read_u32()?,
            encode_key: c.read_u32()?,
            crc_bytes: c.read_u8()?,
            encode_pass1: c.read_u8()?,
            encode_pass2: c.read_u8()?,
            max_packet_size: c.read_u32()?,
        })
    }

    /// Encodes the full datagram, including the `0x00, 0x02` header.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut w = Writer::with_capacity(17);
        w.write_u8(0x00);
        w.write_u8(super::opcode::Opcode::SessionResponse.as_u8());
        w.write_u32(self.connect_code);
        w.write_u32(self.encode_key);
        w.write_u8(self.crc_bytes);
        w.write_u8(self.encode_pass1);
        w.write_u8(self.encode_pass2);
        w.write_u32(self.max_packet_size);
        w.freeze()
    }
}

/// `SessionDisconnect` (opcode `0x05`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionDisconnect {
    /// The session being torn down.
    pub connect_code: u32,
}

impl SessionDisconnect {
    /// Decodes the body (after the `0x00, 0x05` header).
    pub fn decode(body: &[u8]) -> Result<Self, FramingError> {
        let mut c = Cursor::new(body);
        Ok(Self {
            connect_code: c.read_u32()?,
        })
    }

    /// Encodes the full datagram, including the `0x00, 0x05` header.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut w = Writer::with_capacity(6);
        w.write_u8(0x00);
        w.write_u8(super::opcode::Opcode::SessionDisconnect.as_u8());
        w.write_u32(self.connect_code);
        w.freeze()
    }
}

/// Header of a `Packet[0..3]` reliable datagram: just the sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReliableHeader {
    /// Sequence number on the packet's stream.
    pub sequence: u16,
}

impl ReliableHeader {
    /// Size in bytes of the header on the wire (after the opcode byte).
    pub const LEN: usize = 2;

    /// Decodes the header, returning the remaining payload slice.
    pub fn decode(body: &[u8]) -> Result<(Self, &[u8]), FramingError> {
        let mut c = Cursor::new(body);
        let sequence = c.read_u16()?;
        Ok((Self { sequence }, c.read_rest()))
    }
}

/// Header of a `Fragment[0..3]` reliable datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentHeader {
    /// Sequence number on the fragment's stream.
    pub sequence: u16,
    /// Total byte length of the reassembled message; present only on the
    /// first fragment of a message.
    pub total_size: Option<u32>,
}

impl FragmentHeader {
    /// Decodes a fragment header. `first` indicates whether this is
    /// expected to carry a `total_size` prefix.
    pub fn decode(body: &[u8], first: bool) -> Result<(Self, &[u8]), FramingError> {
        let mut c = Cursor::new(body);
        let sequence = c.read_u16()?;
        let total_size = if first { Some(c.read_u32()?) } else { None };
        Ok((
            Self {
                sequence,
                total_size,
            },
            c.read_rest(),
        ))
    }
}

/// Body of an `Ack[0..3]` / `OutOfOrderAck[0..3]` datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckHeader {
    /// For `Ack`, cumulative through this sequence; for `OutOfOrderAck`,
    /// exactly this sequence.
    pub sequence: u16,
}

impl AckHeader {
    /// Decodes the body (after the opcode byte).
    pub fn decode(body: &[u8]) -> Result<Self, FramingError> {
        let mut c = Cursor::new(body);
        Ok(Self {
            sequence: c.read_u16()?,
        })
    }

    /// Encodes just the sequence body (caller prepends `0x00, opcode`).
    pub fn encode_into(&self, w: &mut Writer) {
        w.write_u16(self.sequence);
    }
}

/// `SessionStatRequest` (opcode `0x07`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionStatRequest {
    /// Sender's local timestamp in milliseconds, echoed back verbatim.
    pub timestamp: u32,
    /// Sender's total sent-packet count.
    pub packets_sent: u32,
    /// Sender's total received-packet count.
    pub packets_recv: u32,
}

impl SessionStatRequest {
    /// Decodes the body (after the `0x00, 0x07` header).
    pub fn decode(body: &[u8]) -> Result<Self, FramingError> {
        let mut c = Cursor::new(body);
        Ok(Self {
            timestamp: c.read_u32()?,
            packets_sent: c.read_u32()?,
            packets_recv: c.read_u32()?,
        })
    }

    /// Encodes the full datagram, including the `0x00, 0x07` header.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut w = Writer::with_capacity(14);
        w.write_u8(0x00);
        w.write_u8(super::opcode::Opcode::SessionStatRequest.as_u8());
        w.write_u32(self.timestamp);
        w.write_u32(self.packets_sent);
        w.write_u32(self.packets_recv);
        w.freeze()
    }
}

/// `SessionStatResponse` (opcode `0x08`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionStatResponse {
    /// Echoes the request's `timestamp`.
    pub timestamp: u32,
    /// Responder's own timestamp, milliseconds since an arbitrary epoch.
    pub our_timestamp: u64,
    /// Echoes the request's `packets_sent`.
    pub client_sent: u32,
    /// Echoes the request's `packets_recv`.
    pub client_recv: u32,
    /// Responder's total sent-packet count.
    pub server_sent: u32,
    /// Responder's total received-packet count.
    pub server_recv: u32,
}

impl SessionStatResponse {
    /// Decodes the body (after the `0x00, 0x08` header).
    pub fn decode(body: &[u8]) -> Result<Self, FramingError> {
        let mut c = Cursor::new(body);
        Ok(Self {
            timestamp: c.read_u32()?,
            our_timestamp: u64::from(c.read_u32()?) << 32 | u64::from(c.read_u32()?),
            client_sent: c.read_u32()?,
            client_recv: c.read_u32()?,
            server_sent: c.read_u32()?,
            server_recv: c.read_u32()?,
        })
    }

    /// Encodes the full datagram, including the `0x00, 0x08` header.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut w = Writer::with_capacity(30);
        w.write_u8(0x00);
        w.write_u8(super::opcode::Opcode::SessionStatResponse.as_u8());
        w.write_u32(self.timestamp);
        w.write_u32((self.our_timestamp >> 32) as u32);
        w.write_u32(self.our_timestamp as u32);
        w.write_u32(self.client_sent);
        w.write_u32(self.client_recv);
        w.write_u32(self.server_sent);
        w.write_u32(self.server_recv);
        w.freeze()
    }
}

/// Largest a single sub-packet may be to carry a one-byte length prefix
/// inside a `Combined`/`AppCombined` frame (spec §4.7, invariant 6): once
/// a datagram exceeds this it can never be coalesced and must be sent
/// standalone instead.
pub const MAX_COMBINED_ITEM_LEN: usize = 0xFF;

/// Size of the original implementation's fixed `Combined` assembly buffer
/// (spec §4.7 "Flush algorithm"); the total size of one combined datagram
/// is capped here independently of `max_packet_size`.
pub const COMBINED_CAP: usize = 512;

/// Walks a `Combined` (opcode `0x03`) datagram body, yielding each inner
/// datagram's bytes in order.
///
/// Each sub-packet is prefixed by a one-byte length. A length that would
/// run past the end of `body` is a [`FramingError::CombinedOverrun`].
pub fn parse_combined(body: &[u8]) -> Result<Vec<&[u8]>, FramingError> {
    let mut c = Cursor::new(body);
    let mut out = Vec::new();
    while c.remaining() > 0 {
        let len = c.read_u8()? as usize;
        let remaining = c.remaining();
        if len > remaining {
            return Err(FramingError::CombinedOverrun {
                claimed: len,
                remaining,
            });
        }
        out.push(c.read_slice(len)?);
    }
    Ok(out)
}

/// Builds a `Combined` datagram from sub-packets, each of which must be
/// shorter than `0xFF` bytes and whose total (with one length byte each)
/// must fit in one datagram. Returns `None` if a single item alone would
/// already overrun `0xFF` bytes.
#[must_use]
pub fn build_combined<'a>(items: impl IntoIterator<Item = &'a [u8]>) -> Option<Bytes> {
    let mut w = Writer::new();
    w.write_u8(0x00);
    w.write_u8(super::opcode::Opcode::Combined.as_u8());
    for item in items {
        if item.len() > MAX_COMBINED_ITEM_LEN {
            return None;
        }
        w.write_u8(item.len() as u8);
        w.write_slice(item);
    }
    Some(w.freeze())
}

/// Decodes an `AppCombined` (opcode `0x19`) datagram body.
///
/// Unlike `Combined`, the length prefix is variable: one byte for lengths
/// under `0xFF`, three bytes (`0xFF` marker + `u16` BE) for lengths that fit
/// in a `u16`, or seven bytes (`0xFF, 0xFF, 0xFF` marker + `u32` BE) for
/// larger lengths. This implementation only ever needs to *decode*
/// `AppCombined` — nothing here emits it.
pub fn parse_app_combined(body: &[u8]) -> Result<Vec<&[u8]>, FramingError> {
    let mut c = Cursor::new(body);
    let mut out = Vec::new();
    while c.remaining() > 0 {
        let len = read_app_combined_len(&mut c)?;
        let remaining = c.remaining();
        if len > remaining {
            return Err(FramingError::CombinedOverrun {
                claimed: len,
                remaining,
            });
        }
        out.push(c.read_slice(len)?);
    }
    Ok(out)
}

fn read_app_combined_len(c: &mut Cursor<'_>) -> Result<usize, FramingError> {
    let first = c.read_u8()?;
    if first < 0xFF {
        return Ok(usize::from(first));
    }
    let second = c.read_u8()?;
    if second < 0xFF {
        // three-byte form: 0xFF, hi, lo (u16 BE split across two bytes we
        // already consumed one of)
        let lo = c.read_u8()?;
        return Ok((usize::from(second) << 8) | usize::from(lo));
    }
    // seven-byte form: 0xFF, 0xFF, then a u32 BE
    let third = c.read_u8()?;
    if third != 0xFF {
        // shouldn't happen on a well-formed stream, but don't panic:
        // treat third..+4 as the u32
        let rest = c.read_slice(3)?;
        let v = (u32::from(third) << 24)
            | (u32::from(rest[0]) << 16)
            | (u32::from(rest[1]) << 8)
            | u32::from(rest[2]);
        return Ok(v as usize);
    }
    let v = c.read_u32()?;
    Ok(v as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_request_round_trip() {
        let req = SessionRequest {
            protocol_version: 3,
            connect_code: 0x1122_3344,
            max_packet_size: 512,
        };
        let bytes = req.encode();
        assert_eq!(bytes[0], 0x00);
        assert_eq!(bytes[1], 0x01);
        let decoded = SessionRequest::decode(&bytes[2..]).unwrap();
        assert_eq!(decoded, req);
    }

    #[test]
    fn session_response_round_trip() {
        let resp = SessionResponse {
            connect_code: 0x1122_3344,
            encode_key: 0xDEAD_BEEF,
            crc_bytes: 2,
            encode_pass1: 2, // Compression
            encode_pass2: 1, // XOR
            max_packet_size: 512,
        };
        let bytes = resp.encode();
        let decoded = SessionResponse::decode(&bytes[2..]).unwrap();
        assert_eq!(decoded, resp);
    }

    #[test]
    fn reliable_header_splits_payload() {
        let mut w = Writer::new();
        w.write_u16(42);
        w.write_slice(b"payload");
        let bytes = w.freeze();
        let (hdr, rest) = ReliableHeader::decode(&bytes).unwrap();
        assert_eq!(hdr.sequence, 42);
        assert_eq!(rest, b"payload");
    }

    #[test]
    fn combined_round_trip() {
        let items: Vec<&[u8]> = vec![b"one", b"two", b"three"];
        let combined = build_combined(items.clone()).unwrap();
        let parsed = parse_combined(&combined[2..]).unwrap();
        assert_eq!(parsed, items);
    }

    #[test]
    fn combined_overrun_is_framing_error() {
        let body = [5u8, b'h', b'i']; // claims 5 bytes, only 2 follow
        assert!(matches!(
            parse_combined(&body),
            Err(FramingError::CombinedOverrun {
                claimed: 5,
                remaining: 2
            })
        ));
    }

    #[test]
    fn app_combined_one_byte_len() {
        let mut w = Writer::new();
        w.write_u8(3);
        w.write_slice(b"abc");
        let parsed = parse_app_combined(&w.freeze()).unwrap();
        assert_eq!(parsed, vec![b"abc".as_slice()]);
    }

    #[test]
    fn app_combined_three_byte_len() {
        let payload = vec![7u8; 300];
        let mut w = Writer::new();
        w.write_u8(0xFF);
        w.write_u16(300);
        w.write_slice(&payload);
        let parsed = parse_app_combined(&w.freeze()).unwrap();
        assert_eq!(parsed[0].len(), 300);
    }

    #[test]
    fn app_combined_seven_byte_len() {
        let payload = vec![9u8; 70_000];
        let mut w = Writer::new();
        w.write_u8(0xFF);
        w.write_u8(0xFF);
        w.write_u32(70_000);
        w.write_slice(&payload);
        let parsed = parse_app_combined(&w.freeze()).unwrap();
        assert_eq!(parsed[0].len(), 70_000);
    }
}
