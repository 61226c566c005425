//! CRC-32/ISO-HDLC frame checksums.

/// CRC-32/ISO-HDLC of `data` (the common "CRC-32" used by Ethernet, zip
/// and PNG — polynomial 0xEDB88320, reflected, final XOR 0xFFFFFFFF).
#[must_use]
pub fn crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}
