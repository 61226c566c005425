//! LZ4 payload compression.
//!
//! Per the codec's compression policy, callers only invoke this for
//! payloads of at least 100 bytes, and only keep the compressed form if
//! it is strictly smaller than the input; this module itself is a plain
//! compress/decompress pair and does not enforce that policy.

/// Compress `data` with LZ4, prefixing the frame with the original
/// uncompressed length so [`lz4_decompress`] does not need it supplied
/// out of band.
#[must_use]
pub fn lz4_compress(data: &[u8]) -> Vec<u8> {
    lz4_flex::block::compress_prepend_size(data)
}

/// Decompress an LZ4 block produced by [`lz4_compress`].
///
/// # Errors
///
/// Returns an error if `data` is truncated or not a valid LZ4 block.
pub fn lz4_decompress(data: &[u8]) -> Result<Vec<u8>, lz4_flex::block::DecompressError> {
    lz4_flex::block::decompress_size_prepended(data)
}

/// Decompress an LZ4 block given the known original size, for wire
/// formats that carry the size separately rather than prepended.
///
/// # Errors
///
/// Returns an error if `data` is truncated, not valid LZ4, or decompresses
/// to a different length than `original_size`.
pub fn lz4_decompress_with_size(
    data: &[u8],
    original_size: usize,
) -> Result<Vec<u8>, lz4_flex::block::DecompressError> {
    lz4_flex::block::decompress(data, original_size)
}

/// Whether compression should be attempted per the codec's policy:
/// only for inputs of at least 100 bytes.
#[must_use]
pub fn should_attempt_compression(input_len: usize) -> bool {
    input_len >= 100
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let data = b"the quick brown fox jumps over the lazy dog ".repeat(10);
        let compressed = lz4_compress(&data);
        let decompressed = lz4_decompress(&compressed).unwrap();
        assert_eq!(decompressed, data);
    }

    #[test]
    fn roundtrip_with_explicit_size() {
        let data = vec![0x42u8; 512];
        let compressed = lz4_flex::block::compress(&data);
        let decompressed = lz4_decompress_with_size(&compressed, data.len()).unwrap();
        assert_eq!(decompressed, data);
    }

    #[test]
    fn compression_threshold() {
        assert!(!should_attempt_compression(99));
        assert!(should_attempt_compression(100));
    }

    #[test]
    fn empty_input_roundtrips() {
        let compressed = lz4_compress(b"");
        let decompressed = lz4_decompress(&compressed).unwrap();
        assert!(decompressed.is_empty());
    }
}
