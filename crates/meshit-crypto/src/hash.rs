//! SHA-256 hashing and RFC 5869 HKDF.
//!
//! The handshake's key derivation must be interoperable with any other
//! RFC 5869 implementation, so this is a direct `sha2`/`hkdf` wrapper
//! rather than a project-specific construction.

use crate::error::CryptoError;
use hkdf::Hkdf;
use sha2::{Digest, Sha256};

/// SHA-256 of `data`.
#[must_use]
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Lowercase hex of SHA-256(`data`).
#[must_use]
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(sha256(data))
}

/// `HKDF-Expand` over `ikm` with a zero-filled 32-byte extraction salt,
/// producing `length` output bytes.
///
/// Extracting with an all-zero salt (rather than `ikm` itself) is what
/// RFC 5869 calls the "unsalted" mode; the PRK this produces, and
/// therefore the expand output, is identical to any other standard
/// implementation given the same `ikm`, `info`, and `length`.
///
/// # Errors
///
/// Returns [`CryptoError::KeyDerivationFailed`] if `length` exceeds HKDF's
/// maximum output (255 * 32 bytes for SHA-256), which never happens for
/// the 32-byte outputs this protocol uses.
pub fn hkdf_sha256_expand(ikm: &[u8], info: &[u8], length: usize) -> Result<Vec<u8>, CryptoError> {
    let salt = [0u8; 32];
    let hk = Hkdf::<Sha256>::new(Some(&salt), ikm);
    let mut okm = vec![0u8; length];
    hk.expand(info, &mut okm)
        .map_err(|_| CryptoError::KeyDerivationFailed)?;
    Ok(okm)
}

/// Convenience wrapper producing a fixed 32-byte key via
/// [`hkdf_sha256_expand`].
///
/// # Errors
///
/// Propagates [`CryptoError::KeyDerivationFailed`] from the underlying
/// expand call.
pub fn hkdf_sha256_expand_32(ikm: &[u8], info: &[u8]) -> Result<[u8; 32], CryptoError> {
    let okm = hkdf_sha256_expand(ikm, info, 32)?;
    let mut out = [0u8; 32];
    out.copy_from_slice(&okm);
    Ok(out)
}
