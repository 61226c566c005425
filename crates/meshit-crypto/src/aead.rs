//! ChaCha20-Poly1305 AEAD encryption.
//!
//! A thin wrapper over the `chacha20poly1305` crate's 12-byte-nonce
//! construction, used both for the handshake messages and for the
//! per-session transport cipher.

use crate::error::CryptoError;
use chacha20poly1305::{
    ChaCha20Poly1305, Nonce,
    aead::{Aead, KeyInit, Payload},
};

/// A ChaCha20-Poly1305 key bound to a single 32-byte secret.
pub struct AeadKey {
    cipher: ChaCha20Poly1305,
}

impl AeadKey {
    /// Wrap a raw 32-byte key.
    #[must_use]
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(key.into()),
        }
    }

    /// Encrypt `plaintext` under `nonce`, appending a 16-byte tag.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::EncryptionFailed`] if the underlying cipher
    /// rejects the operation (never happens for in-range inputs, but the
    /// API is fallible because the trait it wraps is).
    pub fn encrypt(&self, nonce: &[u8; 12], aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let payload = Payload {
            msg: plaintext,
            aad,
        };
        self.cipher
            .encrypt(Nonce::from_slice(nonce), payload)
            .map_err(|_| CryptoError::EncryptionFailed)
    }

    /// Decrypt `ciphertext` (tag included) under `nonce`.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::DecryptionFailed`] on authentication failure.
    pub fn decrypt(&self, nonce: &[u8; 12], aad: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let payload = Payload {
            msg: ciphertext,
            aad,
        };
        self.cipher
            .decrypt(Nonce::from_slice(nonce), payload)
            .map_err(|_| CryptoError::DecryptionFailed)
    }
}

/// Build the 12-byte AEAD nonce from an 8-byte little-endian counter, as
/// required for the transport cipher: four zero bytes followed by the
/// counter.
#[must_use]
pub fn nonce_from_counter(counter: u64) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[4..12].copy_from_slice(&counter.to_le_bytes());
    nonce
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let key = AeadKey::new(&[0x11u8; 32]);
        let nonce = nonce_from_counter(7);
        let ct = key.encrypt(&nonce, b"", b"hello").unwrap();
        let pt = key.decrypt(&nonce, b"", &ct).unwrap();
        assert_eq!(pt, b"hello");
    }

    #[test]
    fn tamper_detected() {
        let key = AeadKey::new(&[0x22u8; 32]);
        let nonce = nonce_from_counter(0);
        let mut ct = key.encrypt(&nonce, b"", b"secret").unwrap();
        ct[0] ^= 0xFF;
        assert!(key.decrypt(&nonce, b"", &ct).is_err());
    }

    #[test]
    fn wrong_nonce_fails() {
        let key = AeadKey::new(&[0x33u8; 32]);
        let ct = key.encrypt(&nonce_from_counter(1), b"", b"data").unwrap();
        assert!(key.decrypt(&nonce_from_counter(2), b"", &ct).is_err());
    }

    #[test]
    fn nonce_from_counter_is_big_header_little_counter() {
        let nonce = nonce_from_counter(0x0102_0304_0506_0708);
        assert_eq!(&nonce[0..4], &[0, 0, 0, 0]);
        assert_eq!(&nonce[4..12], &0x0102_0304_0506_0708u64.to_le_bytes());
    }
}
