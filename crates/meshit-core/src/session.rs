//! The three-message handshake (`spec.md` §4.4's construction, not standard
//! Noise_XX payloads), post-handshake transport-key derivation, and
//! per-session AEAD transport encryption with strict replay rejection.
//!
//! A pre-shared-key fallback (AES-256-CBC) is provided for interop with
//! peers that have no established session.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::SystemTime;

use aes::Aes256;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use dashmap::DashMap;
use rand_core::OsRng;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{HandshakeError, SessionError};
use meshit_crypto::aead::{AeadKey, nonce_from_counter};
use meshit_crypto::hash::hkdf_sha256_expand_32;
use meshit_crypto::random::random_16;
use meshit_crypto::x25519::{PrivateKey as X25519PrivateKey, x25519_agree};

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

const ALL_ZERO_NONCE: [u8; 12] = [0u8; 12];

/// `combine(a, b) = hkdfExpand(a||b, "meshIt-combine", 32)`.
fn combine(a: &[u8; 32], b: &[u8; 32]) -> Result<[u8; 32], HandshakeError> {
    let mut ikm = Vec::with_capacity(64);
    ikm.extend_from_slice(a);
    ikm.extend_from_slice(b);
    Ok(hkdf_sha256_expand_32(&ikm, b"meshIt-combine")?)
}

/// Initiator-side handshake state between message 1 and message 3.
pub struct HandshakeInitiator {
    ephemeral_priv: X25519PrivateKey,
}

impl HandshakeInitiator {
    /// Begin a handshake, returning the state to resume with and message 1
    /// (the 32-byte ephemeral public key) to send to the responder.
    #[must_use]
    pub fn start() -> (Self, [u8; 32]) {
        let ephemeral_priv = X25519PrivateKey::generate(&mut OsRng);
        let ephemeral_pub = ephemeral_priv.public_key().to_bytes();
        (Self { ephemeral_priv }, ephemeral_pub)
    }

    /// Consume message 2 (`e || AEAD(ee; responder_static_pub)`), returning
    /// message 3 to send back and the now-established [`Session`].
    ///
    /// # Errors
    ///
    /// Returns [`HandshakeError::InvalidMessageLength`] if `msg2` is too
    /// short, or [`HandshakeError::Crypto`] if either AEAD operation fails.
    pub fn process_msg2(
        self,
        local_static: &X25519PrivateKey,
        msg2: &[u8],
    ) -> Result<(Vec<u8>, Session), HandshakeError> {
        if msg2.len() <= 32 {
            return Err(HandshakeError::InvalidMessageLength);
        }
        let (responder_eph_pub_bytes, ciphertext) = msg2.split_at(32);
        let mut responder_eph_pub = [0u8; 32];
        responder_eph_pub.copy_from_slice(responder_eph_pub_bytes);

        let mut ee = x25519_agree(&self.ephemeral_priv.to_bytes(), &responder_eph_pub)?;
        let responder_static_pub = decrypt_fixed32(&ee, ciphertext)?;

        let mut se = x25519_agree(&self.ephemeral_priv.to_bytes(), &responder_static_pub)?;
        let mut combined = combine(&ee, &se)?;
        let local_static_pub = local_static.public_key().to_bytes();
        let msg3 = AeadKey::new(&combined).encrypt(&ALL_ZERO_NONCE, b"", &local_static_pub)?;

        let mut ss = x25519_agree(&local_static.to_bytes(), &responder_static_pub)?;
        let mut send_key = hkdf_sha256_expand_32(&ss, b"meshIt-key-1")?;
        let mut receive_key = hkdf_sha256_expand_32(&ss, b"meshIt-key-2")?;
        let session = Session::new(responder_static_pub, send_key, receive_key);

        ee.zeroize();
        se.zeroize();
        ss.zeroize();
        combined.zeroize();
        send_key.zeroize();
        receive_key.zeroize();

        tracing::debug!("handshake complete (initiator), deriving transport keys");
        Ok((msg3, session))
    }
}

/// Responder-side handshake state between message 1 and message 3.
///
/// Holds the raw `ee` shared secret across the wait for message 3; zeroized
/// on drop so an abandoned handshake doesn't leave it lingering in memory.
#[derive(ZeroizeOnDrop)]
pub struct HandshakeResponder {
    ee: [u8; 32],
    initiator_eph_pub: [u8; 32],
}

impl HandshakeResponder {
    /// Consume message 1 (the initiator's 32-byte ephemeral public key),
    /// returning message 2 to send back and the state to resume with once
    /// message 3 arrives.
    ///
    /// # Errors
    ///
    /// Returns [`HandshakeError::InvalidMessageLength`] if `msg1` is not
    /// exactly 32 bytes, or [`HandshakeError::Crypto`] if the DH or AEAD
    /// operation fails.
    pub fn process_msg1(
        local_static: &X25519PrivateKey,
        msg1: &[u8],
    ) -> Result<(Vec<u8>, Self), HandshakeError> {
        if msg1.len() != 32 {
            return Err(HandshakeError::InvalidMessageLength);
        }
        let mut initiator_eph_pub = [0u8; 32];
        initiator_eph_pub.copy_from_slice(msg1);

        let responder_eph_priv = X25519PrivateKey::generate(&mut OsRng);
        let responder_eph_pub = responder_eph_priv.public_key().to_bytes();

        let ee = x25519_agree(&responder_eph_priv.to_bytes(), &initiator_eph_pub)?;
        let local_static_pub = local_static.public_key().to_bytes();
        let ct = AeadKey::new(&ee).encrypt(&ALL_ZERO_NONCE, b"", &local_static_pub)?;

        let mut msg2 = Vec::with_capacity(32 + ct.len());
        msg2.extend_from_slice(&responder_eph_pub);
        msg2.extend_from_slice(&ct);

        tracing::trace!("sent handshake msg2");
        Ok((
            msg2,
            Self {
                ee,
                initiator_eph_pub,
            },
        ))
    }

    /// Consume message 3 (`AEAD(combine(ee, se); initiator_static_pub)`),
    /// completing the handshake and returning the established [`Session`].
    ///
    /// # Errors
    ///
    /// Returns [`HandshakeError::Crypto`] on AEAD or DH failure.
    pub fn process_msg3(
        self,
        local_static: &X25519PrivateKey,
        msg3: &[u8],
    ) -> Result<Session, HandshakeError> {
        // se = X25519(initiator_eph_priv, responder_static_pub), which by DH
        // symmetry equals X25519(responder_static_priv, initiator_eph_pub).
        let mut se = x25519_agree(&local_static.to_bytes(), &self.initiator_eph_pub)?;
        let mut combined = combine(&self.ee, &se)?;
        let initiator_static_pub = decrypt_fixed32(&combined, msg3)?;

        let mut ss = x25519_agree(&local_static.to_bytes(), &initiator_static_pub)?;
        let mut send_key = hkdf_sha256_expand_32(&ss, b"meshIt-key-2")?;
        let mut receive_key = hkdf_sha256_expand_32(&ss, b"meshIt-key-1")?;
        let session = Session::new(initiator_static_pub, send_key, receive_key);

        se.zeroize();
        combined.zeroize();
        ss.zeroize();
        send_key.zeroize();
        receive_key.zeroize();

        tracing::debug!("handshake complete (responder), deriving transport keys");
        Ok(session)
    }
}

fn decrypt_fixed32(key: &[u8; 32], ciphertext: &[u8]) -> Result<[u8; 32], HandshakeError> {
    let plaintext = AeadKey::new(key).decrypt(&ALL_ZERO_NONCE, b"", ciphertext)?;
    if plaintext.len() != 32 {
        return Err(HandshakeError::InvalidMessageLength);
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&plaintext);
    Ok(out)
}

/// An established session: derived transport keys, monotonic send counter,
/// and the last accepted receive nonce, bound to one remote peer identity.
pub struct Session {
    remote_static_pub: [u8; 32],
    send_key: AeadKey,
    receive_key: AeadKey,
    send_nonce: AtomicU64,
    last_received_nonce: AtomicI64,
    established_at: SystemTime,
}

impl Session {
    fn new(remote_static_pub: [u8; 32], send_key: [u8; 32], receive_key: [u8; 32]) -> Self {
        Self {
            remote_static_pub,
            send_key: AeadKey::new(&send_key),
            receive_key: AeadKey::new(&receive_key),
            send_nonce: AtomicU64::new(0),
            last_received_nonce: AtomicI64::new(-1),
            established_at: SystemTime::now(),
        }
    }

    /// The remote peer's static X25519 public key.
    #[must_use]
    pub fn remote_static_pub(&self) -> &[u8; 32] {
        &self.remote_static_pub
    }

    /// When this session was established.
    #[must_use]
    pub fn established_at(&self) -> SystemTime {
        self.established_at
    }

    /// Encrypt `plaintext` as `nonceCounter(8 little-endian) ||
    /// AEAD(sendKey, nonce12, empty_aad, plaintext)`, atomically
    /// incrementing the send counter first.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Handshake`] if the underlying AEAD operation
    /// fails (never happens for a correctly derived key, but the
    /// `chacha20poly1305` API is fallible).
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, SessionError> {
        let counter = self.send_nonce.fetch_add(1, Ordering::SeqCst);
        let nonce = nonce_from_counter(counter);
        let ciphertext = self
            .send_key
            .encrypt(&nonce, b"", plaintext)
            .map_err(HandshakeError::Crypto)?;
        let mut frame = Vec::with_capacity(8 + ciphertext.len());
        frame.extend_from_slice(&counter.to_le_bytes());
        frame.extend_from_slice(&ciphertext);
        Ok(frame)
    }

    /// Decrypt a frame produced by [`Session::encrypt`], rejecting it if
    /// its nonce is not strictly greater than the last accepted one.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::ReplayDetected`] on a replayed or
    /// out-of-order nonce, and [`SessionError::Handshake`] on a malformed
    /// frame or AEAD tag failure.
    pub fn decrypt(&self, frame: &[u8]) -> Result<Vec<u8>, SessionError> {
        if frame.len() < 8 {
            return Err(SessionError::Handshake(HandshakeError::InvalidMessageLength));
        }
        let counter = u64::from_le_bytes(frame[0..8].try_into().expect("checked length"));
        let n = counter as i64;
        if n <= self.last_received_nonce.load(Ordering::SeqCst) {
            return Err(SessionError::ReplayDetected);
        }
        let nonce = nonce_from_counter(counter);
        let plaintext = self
            .receive_key
            .decrypt(&nonce, b"", &frame[8..])
            .map_err(HandshakeError::Crypto)?;
        self.last_received_nonce.store(n, Ordering::SeqCst);
        Ok(plaintext)
    }
}

/// Per-peer session store (C4): keyed by peer fingerprint, one established
/// [`Session`] per peer (`spec.md` §4.4). Exposes the `encryptFor`/
/// `decryptFrom` lookup contract: encrypt/decrypt through the session if one
/// exists, falling back to the fixed PSK transport otherwise.
#[derive(Default)]
pub struct SessionMap {
    sessions: DashMap<String, Session>,
}

impl SessionMap {
    /// An empty session store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    /// Install the session established with `peer_id`, replacing any prior
    /// one (a fresh handshake always wins).
    pub fn insert(&self, peer_id: &str, session: Session) {
        self.sessions.insert(peer_id.to_string(), session);
    }

    /// Drop the session for `peer_id`, e.g. when the peer disconnects.
    pub fn remove(&self, peer_id: &str) {
        self.sessions.remove(peer_id);
    }

    /// True if an established session exists for `peer_id`.
    #[must_use]
    pub fn has_session(&self, peer_id: &str) -> bool {
        self.sessions.contains_key(peer_id)
    }

    /// `encryptFor(peerId, plaintext)`: encrypt through the established
    /// session for `peer_id` if one exists, otherwise under the fixed PSK.
    #[must_use]
    pub fn encrypt_for(&self, peer_id: &str, plaintext: &[u8]) -> Vec<u8> {
        if let Some(session) = self.sessions.get(peer_id) {
            if let Ok(frame) = session.encrypt(plaintext) {
                return frame;
            }
        }
        psk_encrypt(&psk_fallback_key(), plaintext).expect("psk encryption is infallible in practice")
    }

    /// `decryptFrom(peerId, ciphertext)`: mirror of [`SessionMap::encrypt_for`]
    /// — try the session first, the PSK on failure or absence.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NoSession`] if neither the session nor the PSK
    /// fallback could decrypt the frame.
    pub fn decrypt_from(&self, peer_id: &str, ciphertext: &[u8]) -> Result<Vec<u8>, SessionError> {
        if let Some(session) = self.sessions.get(peer_id) {
            if let Ok(plaintext) = session.decrypt(ciphertext) {
                return Ok(plaintext);
            }
        }
        psk_decrypt(&psk_fallback_key(), ciphertext).map_err(|_| SessionError::NoSession)
    }
}

/// Encrypt `plaintext` under the fixed pre-shared key for v1-peer interop:
/// a per-message random 16-byte IV followed by PKCS#7-padded AES-256-CBC
/// ciphertext.
///
/// # Errors
///
/// Returns [`SessionError::Handshake`] if IV generation fails.
pub fn psk_encrypt(key: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>, SessionError> {
    let iv = random_16().map_err(HandshakeError::Crypto)?;
    let ciphertext = Aes256CbcEnc::new(key.into(), &iv.into()).encrypt_padded_vec_mut::<Pkcs7>(plaintext);
    let mut frame = Vec::with_capacity(16 + ciphertext.len());
    frame.extend_from_slice(&iv);
    frame.extend_from_slice(&ciphertext);
    Ok(frame)
}

/// Decrypt a frame produced by [`psk_encrypt`].
///
/// # Errors
///
/// Returns [`SessionError::Handshake`] if `frame` is shorter than one IV
/// plus one AES block, or if padding/authentication of the block cipher
/// fails (there is no AEAD tag in CBC mode; corruption surfaces as a
/// padding error).
pub fn psk_decrypt(key: &[u8; 32], frame: &[u8]) -> Result<Vec<u8>, SessionError> {
    if frame.len() < 16 {
        return Err(SessionError::Handshake(HandshakeError::InvalidMessageLength));
    }
    let (iv, ciphertext) = frame.split_at(16);
    Aes256CbcDec::new(key.into(), iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| SessionError::Handshake(HandshakeError::InvalidMessageLength))
}

/// The fixed pre-shared key used by [`psk_encrypt`]/[`psk_decrypt`],
/// derived deterministically so every conforming implementation agrees on
/// it without a literal shared secret baked into the source.
#[must_use]
pub fn psk_fallback_key() -> [u8; 32] {
    hkdf_sha256_expand_32(&[0u8; 32], b"meshIt-psk-fallback")
        .expect("fixed-length HKDF expand never fails")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_symmetry() {
        let initiator_static = X25519PrivateKey::generate(&mut OsRng);
        let responder_static = X25519PrivateKey::generate(&mut OsRng);

        let (initiator, msg1) = HandshakeInitiator::start();
        let (msg2, responder) = HandshakeResponder::process_msg1(&responder_static, &msg1).unwrap();
        let (msg3, initiator_session) = initiator.process_msg2(&initiator_static, &msg2).unwrap();
        let responder_session = responder.process_msg3(&responder_static, &msg3).unwrap();

        let pt = b"hello mesh";
        let ct = initiator_session.encrypt(pt).unwrap();
        assert_eq!(responder_session.decrypt(&ct).unwrap(), pt);

        let pt2 = b"reply";
        let ct2 = responder_session.encrypt(pt2).unwrap();
        assert_eq!(initiator_session.decrypt(&ct2).unwrap(), pt2);

        assert_eq!(
            initiator_session.remote_static_pub(),
            &responder_static.public_key().to_bytes()
        );
        assert_eq!(
            responder_session.remote_static_pub(),
            &initiator_static.public_key().to_bytes()
        );
    }

    #[test]
    fn transport_roundtrip_and_replay_rejection() {
        let a_static = X25519PrivateKey::generate(&mut OsRng);
        let b_static = X25519PrivateKey::generate(&mut OsRng);
        let (initiator, msg1) = HandshakeInitiator::start();
        let (msg2, responder) = HandshakeResponder::process_msg1(&b_static, &msg1).unwrap();
        let (msg3, a_session) = initiator.process_msg2(&a_static, &msg2).unwrap();
        let b_session = responder.process_msg3(&b_static, &msg3).unwrap();

        let ct = a_session.encrypt(b"x").unwrap();
        assert_eq!(b_session.decrypt(&ct).unwrap(), b"x");
        assert!(matches!(
            b_session.decrypt(&ct),
            Err(SessionError::ReplayDetected)
        ));
    }

    #[test]
    fn transport_tolerates_skipped_nonce() {
        let a_static = X25519PrivateKey::generate(&mut OsRng);
        let b_static = X25519PrivateKey::generate(&mut OsRng);
        let (initiator, msg1) = HandshakeInitiator::start();
        let (msg2, responder) = HandshakeResponder::process_msg1(&b_static, &msg1).unwrap();
        let (msg3, a_session) = initiator.process_msg2(&a_static, &msg2).unwrap();
        let b_session = responder.process_msg3(&b_static, &msg3).unwrap();

        let _skipped = a_session.encrypt(b"skip-me").unwrap();
        let ct = a_session.encrypt(b"second").unwrap();
        assert_eq!(b_session.decrypt(&ct).unwrap(), b"second");
    }

    #[test]
    fn malformed_msg1_length_rejected() {
        let responder_static = X25519PrivateKey::generate(&mut OsRng);
        assert!(matches!(
            HandshakeResponder::process_msg1(&responder_static, &[0u8; 10]),
            Err(HandshakeError::InvalidMessageLength)
        ));
    }

    #[test]
    fn psk_fallback_roundtrip() {
        let key = psk_fallback_key();
        let ct = psk_encrypt(&key, b"v1 interop payload").unwrap();
        let pt = psk_decrypt(&key, &ct).unwrap();
        assert_eq!(pt, b"v1 interop payload");
    }

    #[test]
    fn psk_fallback_is_deterministic_across_processes() {
        assert_eq!(psk_fallback_key(), psk_fallback_key());
    }

    #[test]
    fn psk_tamper_is_detected() {
        let key = psk_fallback_key();
        let mut ct = psk_encrypt(&key, b"tamper test").unwrap();
        let last = ct.len() - 1;
        ct[last] ^= 0xFF;
        assert!(psk_decrypt(&key, &ct).is_err());
    }

    #[test]
    fn session_map_falls_back_to_psk_without_a_session() {
        let map = SessionMap::new();
        let ct = map.encrypt_for("unknown-peer", b"hi");
        assert_eq!(map.decrypt_from("unknown-peer", &ct).unwrap(), b"hi");
    }

    #[test]
    fn session_map_prefers_the_established_session() {
        let a_static = X25519PrivateKey::generate(&mut OsRng);
        let b_static = X25519PrivateKey::generate(&mut OsRng);
        let (initiator, msg1) = HandshakeInitiator::start();
        let (msg2, responder) = HandshakeResponder::process_msg1(&b_static, &msg1).unwrap();
        let (msg3, a_session) = initiator.process_msg2(&a_static, &msg2).unwrap();
        let b_session = responder.process_msg3(&b_static, &msg3).unwrap();

        let a_map = SessionMap::new();
        a_map.insert("b", a_session);
        let b_map = SessionMap::new();
        b_map.insert("a", b_session);

        let ct = a_map.encrypt_for("b", b"mesh traffic");
        assert_eq!(b_map.decrypt_from("a", &ct).unwrap(), b"mesh traffic");
        assert!(a_map.has_session("b"));
    }
}
