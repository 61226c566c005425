//! Fingerprint-to-address bookkeeping and the [`PacketSink`] adapter that
//! lets the mesh routing engine (which only knows fingerprints) send
//! through the connection manager (which only knows link addresses).

use std::sync::Arc;

use dashmap::DashMap;
use meshit_core::routing::PacketSink;

use crate::manager::ConnectionManager;

/// Bidirectional `fingerprint <-> address` map, populated once a link's
/// peer identity is known (after the Noise handshake completes).
#[derive(Default)]
pub struct PeerDirectory {
    by_fingerprint: DashMap<String, String>,
    by_address: DashMap<String, String>,
}

impl PeerDirectory {
    /// Build an empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `fingerprint` is reachable at `address`.
    pub fn bind(&self, fingerprint: &str, address: &str) {
        self.by_fingerprint.insert(fingerprint.to_string(), address.to_string());
        self.by_address.insert(address.to_string(), fingerprint.to_string());
    }

    /// Forget an address (its link dropped); returns the fingerprint that
    /// was bound to it, if any.
    pub fn unbind_address(&self, address: &str) -> Option<String> {
        let (_, fingerprint) = self.by_address.remove(address)?;
        self.by_fingerprint.remove(&fingerprint);
        Some(fingerprint)
    }

    /// Look up the address currently bound to `fingerprint`.
    #[must_use]
    pub fn address_of(&self, fingerprint: &str) -> Option<String> {
        self.by_fingerprint.get(fingerprint).map(|e| e.clone())
    }

    /// Look up the fingerprint currently bound to `address`.
    #[must_use]
    pub fn fingerprint_of(&self, address: &str) -> Option<String> {
        self.by_address.get(address).map(|e| e.clone())
    }
}

/// Implements [`PacketSink`] by resolving a fingerprint to its link
/// address through a [`PeerDirectory`] and sending through a
/// [`ConnectionManager`].
pub struct TransportSink {
    manager: Arc<ConnectionManager>,
    directory: Arc<PeerDirectory>,
}

impl TransportSink {
    /// Build a sink over `manager`, resolving fingerprints via `directory`.
    #[must_use]
    pub fn new(manager: Arc<ConnectionManager>, directory: Arc<PeerDirectory>) -> Self {
        Self { manager, directory }
    }
}

impl PacketSink for TransportSink {
    fn send_to(&self, fingerprint: &str, bytes: Vec<u8>) -> bool {
        let Some(address) = self.directory.address_of(fingerprint) else {
            return false;
        };
        let manager = Arc::clone(&self.manager);
        tokio::spawn(async move {
            manager.send(&address, &bytes).await;
        });
        true
    }
}
