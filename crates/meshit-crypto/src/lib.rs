//! # meshit-crypto
//!
//! Cryptographic primitives for the meshit protocol core.
//!
//! This crate provides:
//! - X25519 Diffie-Hellman agreement and Ed25519 signatures
//! - ChaCha20-Poly1305 AEAD encryption
//! - SHA-256 hashing and fingerprinting, and RFC 5869 HKDF-SHA256
//! - CRC-32/ISO-HDLC frame checksums and LZ4 payload compression
//! - Password-based private key encryption (Argon2id + XChaCha20-Poly1305)
//! - Secure random number generation
//!
//! ## Cryptographic suite
//!
//! | Function | Algorithm |
//! |----------|-----------|
//! | Key exchange | X25519 |
//! | AEAD | ChaCha20-Poly1305 (12-byte nonce) |
//! | Hash | SHA-256 |
//! | KDF | HKDF-SHA256 (RFC 5869) |
//! | Signatures | Ed25519 |
//! | Key-at-rest encryption | Argon2id + XChaCha20-Poly1305 |
//! | Checksum | CRC-32/ISO-HDLC |
//! | Compression | LZ4 |

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod aead;
pub mod constant_time;
pub mod crc32;
pub mod encrypted_keys;
pub mod error;
pub mod hash;
pub mod lz4;
pub mod random;
pub mod signatures;
pub mod x25519;

pub use error::CryptoError;

/// X25519 public key size
pub const X25519_PUBLIC_KEY_SIZE: usize = 32;

/// X25519 secret key size
pub const X25519_SECRET_KEY_SIZE: usize = 32;

/// ChaCha20-Poly1305 key size
pub const AEAD_KEY_SIZE: usize = 32;

/// ChaCha20-Poly1305 nonce size (transport cipher and handshake messages)
pub const AEAD_NONCE_SIZE: usize = 12;

/// ChaCha20-Poly1305 authentication tag size
pub const AEAD_TAG_SIZE: usize = 16;

/// SHA-256 output size
pub const SHA256_OUTPUT_SIZE: usize = 32;

/// Ed25519 public key size
pub const ED25519_PUBLIC_KEY_SIZE: usize = 32;

/// Ed25519 secret key size
pub const ED25519_SECRET_KEY_SIZE: usize = 32;

/// Ed25519 signature size
pub const ED25519_SIGNATURE_SIZE: usize = 64;
