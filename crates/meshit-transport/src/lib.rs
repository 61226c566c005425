//! # meshit-transport
//!
//! Connection-manager and dispatcher layer for meshit: the abstract
//! [`link::Link`] contract, length-prefixed framing with connect-retry
//! backoff, at-most-one-connection-per-peer, packet-type fan-out, and
//! BLE GATT MTU chunking.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod chunk;
pub mod dispatch;
pub mod link;
pub mod manager;
pub mod peers;
