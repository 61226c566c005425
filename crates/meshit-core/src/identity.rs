//! Long-term node identity: X25519/Ed25519 keypairs, fingerprint derivation,
//! and OS-scoped at-rest persistence.
//!
//! # Example
//!
//! ```
//! use meshit_core::identity::Identity;
//!
//! let identity = Identity::generate();
//! assert_eq!(identity.fingerprint().len(), 64);
//! ```

use crate::error::IdentityError;
use meshit_crypto::encrypted_keys::{EncryptedPrivateKey, KeyEncryptionParams};
use meshit_crypto::hash::sha256_hex;
use meshit_crypto::signatures::{SigningKey, VerifyingKey};
use meshit_crypto::x25519::{PrivateKey as X25519PrivateKey, PublicKey as X25519PublicKey};
use rand_core::OsRng;
use serde::{Deserialize, Serialize};

/// A node's long-term cryptographic identity: one X25519 static keypair for
/// Noise-like handshakes and one Ed25519 keypair for signatures.
///
/// Created once per user account and never rotated except by an explicit
/// wipe (`spec.md` §3).
pub struct Identity {
    nickname: Option<String>,
    x25519_private: X25519PrivateKey,
    x25519_public: X25519PublicKey,
    ed25519: SigningKey,
}

/// On-disk representation of `identity.json`: protected private-key material
/// plus plaintext public keys and nickname, per `spec.md` §6's persisted
/// state layout.
#[derive(Serialize, Deserialize)]
struct StoredIdentity {
    nickname: Option<String>,
    x25519_public: [u8; 32],
    ed25519_public: [u8; 32],
    x25519_protected: String,
    ed25519_protected: String,
}

impl Identity {
    /// Generate a fresh identity with random X25519 and Ed25519 keypairs.
    #[must_use]
    pub fn generate() -> Self {
        let x25519_private = X25519PrivateKey::generate(&mut OsRng);
        let x25519_public = x25519_private.public_key();
        let ed25519 = SigningKey::generate(&mut OsRng);
        Self {
            nickname: None,
            x25519_private,
            x25519_public,
            ed25519,
        }
    }

    /// Load a previously persisted identity from `bytes` (the contents of
    /// `identity.json`), decrypting both private keys under `passphrase`.
    ///
    /// On a corrupt or unparseable file, or on decryption/public-key-parse
    /// failure, the caller is expected to fall back to [`Identity::generate`]
    /// and log a warning, per `spec.md` §4.2's failure-mode policy — this
    /// function itself just reports the error, it does not fall back.
    pub fn load(bytes: &[u8], passphrase: &str) -> Result<Self, IdentityError> {
        let stored: StoredIdentity = serde_json::from_slice(bytes)
            .map_err(|e| IdentityError::CorruptIdentity(e.to_string()))?;

        let x25519_bytes = decode_protected(&stored.x25519_protected, passphrase)?;
        let ed25519_bytes = decode_protected(&stored.ed25519_protected, passphrase)?;

        if x25519_bytes.len() != 32 || ed25519_bytes.len() != 32 {
            return Err(IdentityError::CorruptIdentity(
                "decrypted key material has the wrong length".into(),
            ));
        }

        let mut x25519_arr = [0u8; 32];
        x25519_arr.copy_from_slice(&x25519_bytes);
        let x25519_private = X25519PrivateKey::from_bytes(x25519_arr);
        let x25519_public = x25519_private.public_key();
        if x25519_public.to_bytes() != stored.x25519_public {
            return Err(IdentityError::CorruptIdentity(
                "x25519 public key does not match stored private key".into(),
            ));
        }

        let mut ed25519_arr = [0u8; 32];
        ed25519_arr.copy_from_slice(&ed25519_bytes);
        let ed25519 = SigningKey::from_bytes(&ed25519_arr);
        if ed25519.verifying_key().to_bytes() != stored.ed25519_public {
            return Err(IdentityError::CorruptIdentity(
                "ed25519 public key does not match stored private key".into(),
            ));
        }

        Ok(Self {
            nickname: stored.nickname,
            x25519_private,
            x25519_public,
            ed25519,
        })
    }

    /// Load an identity if `bytes` is `Some`, otherwise generate a fresh one.
    /// Any load error is treated as `corrupt-identity` and also falls back
    /// to a fresh identity, per `spec.md` §4.2.
    pub fn load_or_create(
        bytes: Option<&[u8]>,
        passphrase: &str,
        nickname: Option<String>,
    ) -> Self {
        let identity = match bytes {
            Some(bytes) => match Self::load(bytes, passphrase) {
                Ok(identity) => identity,
                Err(e) => {
                    tracing::warn!("stored identity unusable ({e}), generating a fresh one");
                    Self::generate()
                }
            },
            None => Self::generate(),
        };
        if nickname.is_some() {
            Self {
                nickname,
                ..identity
            }
        } else {
            identity
        }
    }

    /// Serialize this identity to the `identity.json` persisted layout,
    /// encrypting both private keys under `passphrase`.
    pub fn save(&self, passphrase: &str) -> Result<Vec<u8>, IdentityError> {
        let params = KeyEncryptionParams::default();
        let x25519_protected =
            encode_protected(&self.x25519_private.to_bytes(), passphrase, &params)?;
        let ed25519_protected =
            encode_protected(&self.ed25519.to_bytes(), passphrase, &params)?;

        let stored = StoredIdentity {
            nickname: self.nickname.clone(),
            x25519_public: self.x25519_public.to_bytes(),
            ed25519_public: self.ed25519.verifying_key().to_bytes(),
            x25519_protected,
            ed25519_protected,
        };

        serde_json::to_vec_pretty(&stored).map_err(|e| IdentityError::CorruptIdentity(e.to_string()))
    }

    /// The node's nickname, if one has been set.
    #[must_use]
    pub fn nickname(&self) -> Option<&str> {
        self.nickname.as_deref()
    }

    /// Set or clear the nickname.
    pub fn set_nickname(&mut self, nickname: Option<String>) {
        self.nickname = nickname;
    }

    /// The X25519 static private key, used for Noise-like handshakes.
    #[must_use]
    pub fn x25519_private(&self) -> &X25519PrivateKey {
        &self.x25519_private
    }

    /// The X25519 static public key.
    #[must_use]
    pub fn x25519_public(&self) -> &X25519PublicKey {
        &self.x25519_public
    }

    /// The Ed25519 signing key, used to authenticate this identity.
    #[must_use]
    pub fn ed25519_signing_key(&self) -> &SigningKey {
        &self.ed25519
    }

    /// The Ed25519 public key.
    #[must_use]
    pub fn ed25519_public(&self) -> VerifyingKey {
        self.ed25519.verifying_key()
    }

    /// The 64-char lowercase-hex SHA-256 fingerprint of the X25519 public
    /// key, per `spec.md` §3.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        fingerprint_of(&self.x25519_public.to_bytes())
    }

    /// The first 8 characters of [`Identity::fingerprint`].
    #[must_use]
    pub fn short_fingerprint(&self) -> String {
        short_fingerprint_of(&self.fingerprint())
    }

    /// Build this identity's `meshit://verify` URI for out-of-band
    /// verification, per `spec.md` §6.
    #[must_use]
    pub fn verification_uri(&self) -> String {
        build_verification_uri(&self.fingerprint(), self.nickname.as_deref().unwrap_or(""))
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("nickname", &self.nickname)
            .field("fingerprint", &self.short_fingerprint())
            .finish()
    }
}

/// Compute the lowercase-hex SHA-256 fingerprint of a raw X25519 public key.
#[must_use]
pub fn fingerprint_of(x25519_public: &[u8; 32]) -> String {
    sha256_hex(x25519_public)
}

/// The first 8 characters of a full fingerprint.
#[must_use]
pub fn short_fingerprint_of(fingerprint: &str) -> String {
    fingerprint.chars().take(8).collect()
}

/// Build a `meshit://verify?fp=<64 hex>&nick=<percent-encoded>` URI.
#[must_use]
pub fn build_verification_uri(fingerprint: &str, nickname: &str) -> String {
    format!(
        "meshit://verify?fp={}&nick={}",
        fingerprint,
        percent_encode(nickname)
    )
}

/// Parse a `meshit://verify` URI into `(fingerprint, nickname)`.
#[must_use]
pub fn parse_verification_uri(uri: &str) -> Option<(String, String)> {
    let query = uri.strip_prefix("meshit://verify?")?;
    let mut fp = None;
    let mut nick = None;
    for pair in query.split('&') {
        let (key, value) = pair.split_once('=')?;
        match key {
            "fp" => fp = Some(value.to_string()),
            "nick" => nick = Some(percent_decode(value)),
            _ => {}
        }
    }
    Some((fp?, nick.unwrap_or_default()))
}

fn percent_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char);
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Ok(byte) = u8::from_str_radix(&s[i + 1..i + 3], 16) {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn encode_protected(
    key_bytes: &[u8; 32],
    passphrase: &str,
    params: &KeyEncryptionParams,
) -> Result<String, IdentityError> {
    let encrypted = EncryptedPrivateKey::encrypt(key_bytes, passphrase.as_bytes(), *params)?;
    Ok(base64::Engine::encode(
        &base64::engine::general_purpose::STANDARD,
        encrypted.to_bytes(),
    ))
}

fn decode_protected(encoded: &str, passphrase: &str) -> Result<Vec<u8>, IdentityError> {
    let raw = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, encoded)
        .map_err(|e| IdentityError::CorruptIdentity(e.to_string()))?;
    let encrypted = EncryptedPrivateKey::from_bytes(&raw)?;
    let decrypted = encrypted.decrypt(passphrase.as_bytes())?;
    Ok(decrypted.as_bytes().to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_64_lowercase_hex_chars() {
        let identity = Identity::generate();
        let fp = identity.fingerprint();
        assert_eq!(fp.len(), 64);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn short_fingerprint_is_prefix() {
        let identity = Identity::generate();
        assert_eq!(identity.short_fingerprint(), &identity.fingerprint()[..8]);
    }

    #[test]
    fn save_and_load_roundtrip() {
        let mut identity = Identity::generate();
        identity.set_nickname(Some("alice".to_string()));

        let saved = identity.save("correct horse battery staple").unwrap();
        let loaded = Identity::load(&saved, "correct horse battery staple").unwrap();

        assert_eq!(loaded.fingerprint(), identity.fingerprint());
        assert_eq!(loaded.nickname(), Some("alice"));
    }

    #[test]
    fn load_with_wrong_passphrase_fails() {
        let identity = Identity::generate();
        let saved = identity.save("correct").unwrap();
        assert!(Identity::load(&saved, "wrong").is_err());
    }

    #[test]
    fn load_or_create_falls_back_on_corrupt_data() {
        let identity = Identity::load_or_create(Some(b"not json"), "pw", None);
        assert_eq!(identity.fingerprint().len(), 64);
    }

    #[test]
    fn verification_uri_roundtrip() {
        let uri = build_verification_uri("ab".repeat(32).as_str(), "Alice Smith");
        let (fp, nick) = parse_verification_uri(&uri).unwrap();
        assert_eq!(fp, "ab".repeat(32));
        assert_eq!(nick, "Alice Smith");
    }
}
