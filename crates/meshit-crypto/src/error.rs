//! Cryptographic error types.

use thiserror::Error;

/// Cryptographic errors.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// AEAD encryption failed.
    #[error("encryption failed")]
    EncryptionFailed,

    /// AEAD decryption failed (authentication failure).
    #[error("decryption failed: authentication failure")]
    DecryptionFailed,

    /// Invalid key length.
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Expected length.
        expected: usize,
        /// Actual length.
        actual: usize,
    },

    /// Invalid nonce length.
    #[error("invalid nonce length")]
    InvalidNonceLength,

    /// A public key did not decode to a valid curve point.
    #[error("invalid public key")]
    InvalidPublicKey,

    /// A signature failed to verify or did not parse.
    #[error("invalid signature")]
    InvalidSignature,

    /// X25519 agreement produced a low-order (all-zero) shared secret.
    #[error("key agreement produced a degenerate shared secret")]
    InvalidKeyAgreement,

    /// Key derivation failed.
    #[error("key derivation failed")]
    KeyDerivationFailed,

    /// Stored key material was truncated, malformed, or the wrong format version.
    #[error("invalid key material")]
    InvalidKeyMaterial,

    /// An Argon2id parameter was out of its valid range.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// Random number generation failed.
    #[error("random number generation failed: {0}")]
    RandomGenerationFailed(String),

    /// Nonce counter exhausted; the session must be re-established.
    #[error("nonce counter exhausted, rekey required")]
    NonceOverflow,
}
