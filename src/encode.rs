//! The two optional encode passes applied to encoded-opcode payloads: a
//! rolling XOR stream cipher and DEFLATE compression.
//!
//! Passes are applied in configured order on send and unwound in reverse
//! order on receive. [`Opcode::is_encoded`](crate::opcode::Opcode::is_encoded)
//! decides which datagrams go through this module at all.

use std::io::{Read, Write};

use bytes::{BufMut, Bytes, BytesMut};
use flate2::{
    read::ZlibDecoder,
    write::ZlibEncoder,
    Compression,
};

use crate::error::DecodeError;

/// One configured encode pass, negotiated in `SessionResponse`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodePass {
    /// No-op.
    None,
    /// Rolling XOR stream cipher keyed by the session's `encode_key`.
    Xor,
    /// DEFLATE compression, marker-byte framed.
    Compression,
}

impl EncodePass {
    /// Maps the wire value carried in `SessionResponse.encode_pass{1,2}`.
    #[must_use]
    pub const fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Xor,
            2 => Self::Compression,
            _ => Self::None,
        }
    }

    /// Wire value for this pass.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Xor => 1,
            Self::Compression => 2,
        }
    }
}

/// Applies a single encode pass on the send side (payload already built,
/// about to go out).
pub fn apply(pass: EncodePass, data: &[u8], key: u32) -> Bytes {
    match pass {
        EncodePass::None => Bytes::copy_from_slice(data),
        EncodePass::Xor => Bytes::from(xor_encode(data, key)),
        EncodePass::Compression => compress(data),
    }
}

/// Reverses a single encode pass on the receive side.
pub fn unapply(pass: EncodePass, data: &[u8], key: u32) -> Result<Bytes, DecodeError> {
    match pass {
        EncodePass::None => Ok(Bytes::copy_from_slice(data)),
        EncodePass::Xor => Ok(Bytes::from(xor_decode(data, key))),
        EncodePass::Compression => decompress(data),
    }
}

/// Rolling XOR stream cipher: the key advances by XOR-ing in each
/// ciphertext word as it is produced, so encode and decode must walk the
/// buffer in the same direction.
///
/// `offset` skips the first one or two bytes of the buffer
/// depending on whether the leading byte is `0x00` (a protocol frame,
/// offset 2, to avoid re-obscuring the `0x00` opcode marker) or not
/// (an application frame, offset 1, to preserve the always-nonzero first
/// byte invariant).
fn xor_offset(data: &[u8]) -> usize {
    match data.first() {
        Some(0x00) => 2,
        _ => 1,
    }
}

fn xor_encode(data: &[u8], key: u32) -> Vec<u8> {
    let offset = xor_offset(data).min(data.len());
    let mut out = Vec::with_capacity(data.len());
    out.extend_from_slice(&data[..offset]);
    let mut running = key;
    let mut chunks = data[offset..].chunks_exact(4);
    for chunk in &mut chunks {
        let word = u32::from_be_bytes(chunk.try_into().expect("chunks_exact(4)"));
        let cipher = word ^ running;
        out.extend_from_slice(&cipher.to_be_bytes());
        running = cipher;
    }
    let rem = chunks.remainder();
    if !rem.is_empty() {
        let kc = (running & 0xFF) as u8;
        for b in rem {
            out.push(b ^ kc);
        }
    }
    out
}

fn xor_decode(data: &[u8], key: u32) -> Vec<u8> {
    let offset = xor_offset(data).min(data.len());
    let mut out = Vec::with_capacity(data.len());
    out.extend_from_slice(&data[..offset]);
    let mut running = key;
    let mut chunks = data[offset..].chunks_exact(4);
    for chunk in &mut chunks {
        let cipher = u32::from_be_bytes(chunk.try_into().expect("chunks_exact(4)"));
        let word = cipher ^ running;
        out.extend_from_slice(&word.to_be_bytes());
        running = cipher;
    }
    let rem = chunks.remainder();
    if !rem.is_empty() {
        let kc = (running & 0xFF) as u8;
        for b in rem {
            out.push(b ^ kc);
        }
    }
    out
}

/// Below this size, compression is skipped outright: the
/// marker byte alone would make small payloads larger, not smaller.
const COMPRESS_MIN_LEN: usize = 30;

/// Marker byte for a DEFLATE-compressed payload.
const MARKER_COMPRESSED: u8 = 0x5A;
/// Marker byte for a payload left uncompressed.
const MARKER_UNCOMPRESSED: u8 = 0xA5;

fn compress(data: &[u8]) -> Bytes {
    if data.len() <= COMPRESS_MIN_LEN {
        return with_marker(MARKER_UNCOMPRESSED, data);
    }
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(data.len()), Compression::default());
    if encoder.write_all(data).is_err() {
        return with_marker(MARKER_UNCOMPRESSED, data);
    }
    match encoder.finish() {
        Ok(compressed) if compressed.len() < data.len() => {
            with_marker(MARKER_COMPRESSED, &compressed)
        }
        _ => with_marker(MARKER_UNCOMPRESSED, data),
    }
}

fn with_marker(marker: u8, data: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(data.len() + 1);
    out.put_u8(marker);
    out.put_slice(data);
    out.freeze()
}

fn decompress(data: &[u8]) -> Result<Bytes, DecodeError> {
    let (marker, rest) = data.split_first().ok_or(DecodeError::Inflate)?;
    match *marker {
        MARKER_UNCOMPRESSED => Ok(Bytes::copy_from_slice(rest)),
        MARKER_COMPRESSED => {
            let mut decoder = ZlibDecoder::new(rest);
            let mut out = Vec::new();
            decoder.read_to_end(&mut out).map_err(|_| DecodeError::Inflate)?;
            Ok(Bytes::from(out))
        }
        // Unknown marker: the original leaves the buffer untouched rather
        // than treating it as an error, so we pass the bytes through as-is.
        _ => Ok(Bytes::copy_from_slice(data)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xor_round_trip_protocol_frame() {
        let data = [0x00u8, 0x09, 1, 2, 3, 4, 5, 6, 7, 8, 9];
        let key = 0xAABB_CCDD;
        let enc = xor_encode(&data, key);
        assert_eq!(&enc[..2], &data[..2]);
        let dec = xor_decode(&enc, key);
        assert_eq!(dec, data);
    }

    #[test]
    fn xor_round_trip_app_frame() {
        let data = [7u8, 1, 2, 3, 4, 5, 6, 7, 8];
        let key = 0x1234_5678;
        let enc = xor_encode(&data, key);
        assert_eq!(enc[0], data[0]);
        let dec = xor_decode(&enc, key);
        assert_eq!(dec, data);
    }

    #[test]
    fn compress_small_payload_stays_uncompressed() {
        let data = b"short";
        let out = compress(data);
        assert_eq!(out[0], MARKER_UNCOMPRESSED);
        let back = decompress(&out).unwrap();
        assert_eq!(&back[..], data);
    }

    #[test]
    fn compress_round_trip_large_payload() {
        let data = vec![b'z'; 4096];
        let out = compress(&data);
        assert_eq!(out[0], MARKER_COMPRESSED);
        let back = decompress(&out).unwrap();
        assert_eq!(&back[..], data.as_slice());
    }

    #[test]
    fn compress_incompressible_falls_back() {
        // Random-looking bytes that won't shrink under DEFLATE.
        let data: Vec<u8> = (0..64u32).map(|i| (i.wrapping_mul(2654435761) >> 24) as u8).collect();
        let out = compress(&data);
        let back = decompress(&out).unwrap();
        assert_eq!(&back[..], data.as_slice());
    }

    #[test]
    fn xor_tail_bytes_use_single_low_key_byte() {
        // 5 bytes past the offset leaves a 1-byte tail after one 4-byte
        // chunk; the tail must be XORed with the low byte of the key that
        // rolled forward from that chunk, the same byte for every tail
        // position, not a different byte of the big-endian key per index.
        let data = [0x00u8, 0x09, 1, 2, 3, 4, 99];
        let key = 0xAABB_CCDD;
        let enc = xor_encode(&data, key);
        let word = u32::from_be_bytes([1, 2, 3, 4]);
        let running = word ^ key;
        let kc = (running & 0xFF) as u8;
        assert_eq!(enc[6], data[6] ^ kc);
        let dec = xor_decode(&enc, key);
        assert_eq!(dec, data);
    }

    #[test]
    fn decompress_unknown_marker_passes_through_unchanged() {
        let data = [0x7Fu8, 1, 2, 3, 4];
        let out = decompress(&data).unwrap();
        assert_eq!(&out[..], &data[..]);
    }

    #[test]
    fn apply_unapply_pass_round_trip() {
        let data = [0x00u8, 0x09, 10, 20, 30, 40, 50];
        let key = 0xABCD_EF01;
        for pass in [EncodePass::None, EncodePass::Xor, EncodePass::Compression] {
            let encoded = apply(pass, &data, key);
            let decoded = unapply(pass, &encoded, key).unwrap();
            assert_eq!(&decoded[..], &data[..], "pass {pass:?} round trip");
        }
    }
}
