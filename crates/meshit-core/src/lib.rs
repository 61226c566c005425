//! # meshit-core
//!
//! Protocol core for meshit, a peer-to-peer BLE mesh messaging and
//! file-transfer protocol built for intermittent connectivity.
//!
//! This crate provides:
//! - **Identity**: persistent X25519/Ed25519 identity, fingerprints, and
//!   verification URIs
//! - **Packet codec**: the wire format shared by every packet type
//! - **Session engine**: the 3-message handshake, transport encryption,
//!   and the PSK fallback path
//! - **Mesh routing**: dedup, TTL/loop checks, the routing table, and
//!   route discovery
//! - **Channels**: IRC-style channel membership and slash commands
//! - **Store-and-forward**: per-destination queues for offline peers
//! - **Error types**: one `thiserror` enum per subsystem
//!
//! ## Module Structure
//!
//! - [`identity`]: persistent identity, fingerprints, verification URIs
//! - [`packet`]: wire-format packet codec
//! - [`session`]: handshake, transport encryption, PSK fallback
//! - [`routing`]: mesh routing engine
//! - [`channel`]: channel service and command parsing
//! - [`store_and_forward`]: per-destination offline-message queues
//! - [`error`]: error types and result handling

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod channel;
pub mod error;
pub mod identity;
pub mod packet;
pub mod routing;
pub mod session;
pub mod store_and_forward;

pub use channel::{Channel, ChannelEvent, ChannelService, Command};
pub use error::{ChannelError, CodecError, DropReason, HandshakeError, IdentityError, QueueError, SessionError};
pub use identity::{Identity, build_verification_uri, fingerprint_of, parse_verification_uri, short_fingerprint_of};
pub use packet::{BROADCAST_DESTINATION, Packet, PacketType};
pub use routing::{IngestOutcome, PacketSink, RoutingEngine, RoutingEvent, RoutingTable, SeenCache};
pub use session::{HandshakeInitiator, HandshakeResponder, Session, SessionMap};
pub use store_and_forward::StoreAndForward;

/// Wire protocol version (major.minor encoded as u32).
pub const PROTOCOL_VERSION: u32 = 0x0000_0002;
