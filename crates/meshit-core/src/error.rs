//! Error types for the meshit protocol core.

use thiserror::Error;

/// Packet codec errors (`parse-error` in the error taxonomy).
#[derive(Debug, Error)]
pub enum CodecError {
    /// Frame shorter than the minimum header size for its version.
    #[error("frame too short: expected at least {expected}, got {actual}")]
    TooShort {
        /// Expected minimum size for the detected version.
        expected: usize,
        /// Actual size received.
        actual: usize,
    },

    /// The version byte is neither 1 nor 2.
    #[error("unsupported packet version: {0}")]
    UnsupportedVersion(u8),

    /// CRC-32 recomputed over the frame does not match the trailing checksum.
    #[error("crc mismatch")]
    CrcMismatch,

    /// The packet-type byte does not match any known variant.
    #[error("invalid packet type: 0x{0:02X}")]
    InvalidPacketType(u8),

    /// The metadata prefix length or JSON body was malformed.
    #[error("invalid metadata prefix")]
    InvalidMetadata,

    /// The compressed-flag was set but the payload failed to LZ4-decompress.
    #[error("lz4 decompression failed")]
    DecompressionFailed,
}

/// Noise-like handshake errors (`handshake-failed`).
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// A handshake message arrived while the state machine was in the wrong
    /// phase to accept it.
    #[error("invalid handshake state")]
    InvalidState,

    /// A handshake message was not the exact expected length.
    #[error("invalid handshake message length")]
    InvalidMessageLength,

    /// An underlying cryptographic operation (DH, AEAD) failed.
    #[error(transparent)]
    Crypto(#[from] meshit_crypto::CryptoError),
}

/// Session-level errors covering handshake failure, replay, and missing
/// session state.
#[derive(Debug, Error)]
pub enum SessionError {
    /// No established session exists for this peer and the PSK fallback is
    /// unavailable or also failed.
    #[error("no session for peer")]
    NoSession,

    /// A received nonce was not strictly greater than `lastReceivedNonce`.
    #[error("replay detected")]
    ReplayDetected,

    /// The three-message handshake failed.
    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    /// The decrypted payload failed to parse as a packet.
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Reasons the routing engine silently drops a packet (`routing-drop`). This
/// is normal operation, never surfaced as an error to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Already present in the seen-message cache.
    Duplicate,
    /// `ttl <= 0`.
    TtlExpired,
    /// Local fingerprint already present in `routeHistory`/`seenByNodes`.
    LoopDetected,
    /// No route (direct or table) to the destination.
    NoRoute,
    /// The payload failed to decrypt under either the established session
    /// or the PSK fallback (`spec.md`'s `crypto-error`).
    CryptoError,
}

/// Channel-service errors surfaced to the caller for user-initiated
/// operations (join/send), per the propagation policy in `spec.md` §7.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The supplied password did not match the channel's stored password.
    #[error("unauthorized: wrong channel password")]
    Unauthorized,

    /// `sendChannelMessage` was called on a channel that is not joined.
    #[error("not a member of this channel")]
    NotJoined,
}

/// Store-and-forward errors.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Underlying file I/O failed.
    #[error("queue io error: {0}")]
    Io(#[from] std::io::Error),

    /// A queued record failed to (de)serialize as JSON.
    #[error("queue record malformed: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Identity-store errors (`storage-io`, `crypto-error`, `corrupt-identity`).
#[derive(Debug, Error)]
pub enum IdentityError {
    /// Reading or writing the protected identity file failed.
    #[error("identity storage io error: {0}")]
    StorageIo(#[from] std::io::Error),

    /// Decrypting or parsing stored key material failed.
    #[error(transparent)]
    Crypto(#[from] meshit_crypto::CryptoError),

    /// Stored identity JSON was malformed or a public key failed to parse.
    #[error("corrupt identity: {0}")]
    CorruptIdentity(String),
}
