//! CRC integrity trailer.
//!
//! The wire CRC is keyed: it covers the datagram bytes followed by the
//! session's `encode_key`, then truncated to the negotiated trailer width.

/// Computes the keyed CRC32 over `data` and appends `key`'s bytes to the
/// checksum input, matching the legacy client/server behaviour.
#[must_use]
pub fn checksum(data: &[u8], key: u32) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(data);
    hasher.update(&key.to_be_bytes());
    hasher.finalize()
}

/// Truncates a computed CRC to the number of trailer bytes negotiated for
/// the session: 0 (disabled), 2 (low 16 bits) or 4 (full 32 bits).
#[must_use]
pub fn truncate(crc: u32, crc_bytes: u8) -> Vec<u8> {
    match crc_bytes {
        0 => Vec::new(),
        2 => crc.to_be_bytes()[2..].to_vec(),
        4 => crc.to_be_bytes().to_vec(),
        other => {
            debug_assert!(false, "invalid crc_bytes {other}");
            Vec::new()
        }
    }
}

/// Compares a datagram's trailing CRC bytes against a freshly computed
/// checksum of the bytes preceding them. Returns `true` if `crc_bytes` is
/// `0` (CRC disabled, nothing to check).
#[must_use]
pub fn verify(body: &[u8], trailer: &[u8], key: u32) -> bool {
    if trailer.is_empty() {
        return true;
    }
    let computed = checksum(body, key);
    let truncated = truncate(computed, trailer.len() as u8);
    truncated == trailer
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_widths() {
        let crc = 0x1234_5678;
        assert_eq!(truncate(crc, 0), Vec::<u8>::new());
        assert_eq!(truncate(crc, 2), vec![0x56, 0x78]);
        assert_eq!(truncate(crc, 4), vec![0x12, 0x34, 0x56, 0x78]);
    }

    #[test]
    fn verify_round_trip() {
        let body = b"hello daybreak";
        let key = 0xCAFE_BABE;
        let crc = checksum(body, key);
        let trailer = truncate(crc, 2);
        assert!(verify(body, &trailer, key));
        assert!(!verify(body, &[0x00, 0x00], key));
    }

    #[test]
    fn disabled_crc_always_verifies() {
        assert!(verify(b"anything", &[], 0));
    }
}
