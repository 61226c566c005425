//! Mesh routing engine: seen-message dedup, TTL/loop checks, the routing
//! table, direct-peer set, and route discovery/reply.
//!
//! The routing engine never sends bytes itself; it holds an abstract
//! [`PacketSink`] handed to it at construction, breaking the cycle between
//! routing (which decides where to forward) and the connection manager
//! (which owns the actual links) the way `spec.md` §9 describes.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use tokio::sync::broadcast;

use crate::error::DropReason;
use crate::identity::fingerprint_of;
use crate::packet::{BROADCAST_DESTINATION, Packet, PacketType};
use crate::session::SessionMap;

/// Session-store key used for channel broadcast traffic: a channel has no
/// single peer identity to hold a Noise session with, so `ChannelMessage`
/// payloads always resolve to the PSK transport through this key, which
/// [`SessionMap`] never has a session entry for.
fn channel_session_key(channel_name: &str) -> String {
    format!("channel:{channel_name}")
}

/// `spec.md` §6 constants governing routing.
pub const MAX_HOPS: u8 = 7;
pub const DEFAULT_TTL: u8 = 7;
pub const ROUTE_EXPIRY: Duration = Duration::from_secs(5 * 60);
pub const SEEN_CACHE_MAX: usize = 10_000;
pub const ROUTING_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// One entry in the routing table: the best known next hop toward a
/// destination fingerprint.
#[derive(Debug, Clone)]
struct RouteEntry {
    next_hop: String,
    hop_count: u8,
    last_seen: Instant,
    direct: bool,
}

/// `destinationFingerprint -> {nextHopFingerprint, hopCount, lastSeen}`
/// (`spec.md` §3). Direct peers are always present with `hopCount = 1` and
/// never expire via [`RoutingTable::cleanup_expired`].
pub struct RoutingTable {
    entries: DashMap<String, RouteEntry>,
}

impl RoutingTable {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    fn register_direct_peer(&self, fingerprint: &str) {
        self.entries.insert(
            fingerprint.to_string(),
            RouteEntry {
                next_hop: fingerprint.to_string(),
                hop_count: 1,
                last_seen: Instant::now(),
                direct: true,
            },
        );
    }

    fn unregister_direct_peer(&self, fingerprint: &str) {
        self.entries.remove(fingerprint);
    }

    /// Learn or improve a route: a direct-peer entry is never overwritten;
    /// a non-direct entry is replaced only when `hop_count` is strictly
    /// smaller than the one already on file (`spec.md` §4.7).
    fn learn_route(&self, destination: &str, next_hop: &str, hop_count: u8) {
        match self.entries.entry(destination.to_string()) {
            Entry::Occupied(mut occ) => {
                if !occ.get().direct && hop_count < occ.get().hop_count {
                    occ.insert(RouteEntry {
                        next_hop: next_hop.to_string(),
                        hop_count,
                        last_seen: Instant::now(),
                        direct: false,
                    });
                }
            }
            Entry::Vacant(vac) => {
                vac.insert(RouteEntry {
                    next_hop: next_hop.to_string(),
                    hop_count,
                    last_seen: Instant::now(),
                    direct: false,
                });
            }
        }
    }

    fn next_hop(&self, destination: &str) -> Option<String> {
        self.entries.get(destination).map(|e| e.next_hop.clone())
    }

    /// Remove non-direct entries whose `lastSeen` is older than
    /// [`ROUTE_EXPIRY`]. Intended to run every [`ROUTING_CLEANUP_INTERVAL`].
    pub fn cleanup_expired(&self) {
        let now = Instant::now();
        self.entries
            .retain(|_, entry| entry.direct || now.duration_since(entry.last_seen) < ROUTE_EXPIRY);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for RoutingTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Bounded `msgKey -> insertTime` dedup cache, size <= [`SEEN_CACHE_MAX`];
/// when full, the oldest half by insertion time is evicted (`spec.md` §3).
pub struct SeenCache {
    entries: DashMap<String, Instant>,
}

impl SeenCache {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Insert `key` if absent and return whether it was newly inserted.
    /// The occupied-or-vacant check and insert happen as one atomic
    /// `entry()` call, satisfying the "dedup insert-or-drop must be
    /// compare-and-swap" requirement in `spec.md` §5.
    pub fn insert_if_new(&self, key: String) -> bool {
        let inserted = match self.entries.entry(key) {
            Entry::Occupied(_) => false,
            Entry::Vacant(v) => {
                v.insert(Instant::now());
                true
            }
        };
        if inserted && self.entries.len() > SEEN_CACHE_MAX {
            self.evict_oldest_half();
        }
        inserted
    }

    fn evict_oldest_half(&self) {
        let mut by_age: Vec<(String, Instant)> =
            self.entries.iter().map(|e| (e.key().clone(), *e.value())).collect();
        by_age.sort_by_key(|(_, t)| *t);
        for (key, _) in by_age.into_iter().take(by_age.len() / 2) {
            self.entries.remove(&key);
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

impl Default for SeenCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of feeding one packet through [`RoutingEngine::ingest`] or its
/// control-packet variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Delivered to the local node (unicast-for-me, or a broadcast also
    /// delivered locally).
    Delivered,
    /// Forwarded to one or more peers without local delivery.
    Forwarded,
    /// Silently dropped; never surfaced as an error (`spec.md` §7).
    Dropped(DropReason),
}

/// Typed events published by the routing engine for interested components
/// to consume, per the subject/observer design note in `spec.md` §9.
#[derive(Debug, Clone)]
pub enum RoutingEvent {
    /// A packet addressed to (or broadcast to) this node was delivered.
    MessageDelivered(Packet),
    /// A packet was forwarded to the listed peer fingerprints.
    Forwarded {
        packet_type: PacketType,
        to: Vec<String>,
    },
}

/// Abstract send interface the routing engine forwards through. Implemented
/// by the connection manager / dispatcher in `meshit-transport`; kept as a
/// trait here so neither module owns the other.
pub trait PacketSink: Send + Sync {
    /// Send `bytes` to the direct peer identified by `fingerprint`. Returns
    /// `false` if no link to that peer exists (a stale routing-table entry
    /// or a peer that just disconnected); the caller treats this as
    /// best-effort delivery, per `spec.md` §5.
    fn send_to(&self, fingerprint: &str, bytes: Vec<u8>) -> bool;
}

/// The mesh routing engine (C7): dedup, TTL, loop check, local-delivery
/// decision, forwarding, route discovery/reply, and the routing table.
pub struct RoutingEngine {
    local_fingerprint: String,
    local_static_pub: [u8; 32],
    direct_peers: DashSet<String>,
    routing_table: RoutingTable,
    seen_cache: SeenCache,
    seq_counter: AtomicU32,
    sink: Arc<dyn PacketSink>,
    sessions: Arc<SessionMap>,
    events: broadcast::Sender<RoutingEvent>,
}

impl RoutingEngine {
    /// Build a new engine for a node with the given static X25519 public
    /// key, forwarding packets through `sink` and encrypting/decrypting
    /// application payloads through `sessions` (`spec.md` §4.4's
    /// `encryptFor`/`decryptFrom` contract, §2's `UI/routing → C4 encrypt →
    /// C3 serialize` pipeline). Returns the engine plus a receiver for its
    /// published [`RoutingEvent`]s.
    #[must_use]
    pub fn new(
        local_static_pub: [u8; 32],
        sink: Arc<dyn PacketSink>,
        sessions: Arc<SessionMap>,
    ) -> (Self, broadcast::Receiver<RoutingEvent>) {
        let (tx, rx) = broadcast::channel(256);
        let engine = Self {
            local_fingerprint: fingerprint_of(&local_static_pub),
            local_static_pub,
            direct_peers: DashSet::new(),
            routing_table: RoutingTable::new(),
            seen_cache: SeenCache::new(),
            seq_counter: AtomicU32::new(0),
            sink,
            sessions,
            events: tx,
        };
        (engine, rx)
    }

    #[must_use]
    pub fn local_fingerprint(&self) -> &str {
        &self.local_fingerprint
    }

    #[must_use]
    pub fn routing_table(&self) -> &RoutingTable {
        &self.routing_table
    }

    fn next_seq(&self) -> u32 {
        self.seq_counter.fetch_add(1, Ordering::SeqCst)
    }

    fn direct_peer_fingerprints(&self) -> Vec<String> {
        self.direct_peers.iter().map(|e| e.clone()).collect()
    }

    /// Register a newly connected direct peer; seeds the routing table
    /// with `(fp -> fp, hopCount=1, now)`.
    pub fn register_direct_peer(&self, fingerprint: &str) {
        tracing::debug!(peer = %fingerprint, "registering direct peer");
        self.direct_peers.insert(fingerprint.to_string());
        self.routing_table.register_direct_peer(fingerprint);
    }

    /// Unregister a peer that disconnected.
    pub fn unregister_direct_peer(&self, fingerprint: &str) {
        tracing::debug!(peer = %fingerprint, "unregistering direct peer");
        self.direct_peers.remove(fingerprint);
        self.routing_table.unregister_direct_peer(fingerprint);
    }

    /// Direct peers always win; otherwise consult the routing table.
    #[must_use]
    pub fn next_hop(&self, destination_fingerprint: &str) -> Option<String> {
        if self.direct_peers.contains(destination_fingerprint) {
            return Some(destination_fingerprint.to_string());
        }
        self.routing_table.next_hop(destination_fingerprint)
    }

    /// Run the routing-table cleanup pass. Callers should invoke this every
    /// [`ROUTING_CLEANUP_INTERVAL`].
    pub fn cleanup(&self) {
        self.routing_table.cleanup_expired();
    }

    fn learn_from_route_history(&self, packet: &Packet) {
        if packet.route_history.is_empty() {
            return;
        }
        let origin_fp = fingerprint_of(&packet.originator_pub);
        if let Some(hop) = packet
            .route_history
            .iter()
            .find(|fp| self.direct_peers.contains(fp.as_str()))
        {
            self.routing_table
                .learn_route(&origin_fp, hop, packet.route_history.len() as u8);
        }
    }

    fn msg_key(packet: &Packet) -> String {
        format!("{}:{}", hex::encode(packet.originator_pub), packet.seq_num)
    }

    /// Decrypt the payload of a packet about to be locally delivered
    /// (`spec.md` §2's inbound mirror: `C4 decrypt` before the payload
    /// reaches routing/UI). Only `RoutedMessage` (keyed by the originator's
    /// session) and `ChannelMessage` (keyed by the channel's PSK slot) carry
    /// an encrypted payload; every other type passes through unchanged.
    /// Returns `None` if decryption fails, per the `crypto-error` recovery
    /// policy: drop the packet rather than deliver garbage.
    fn decrypt_payload(&self, mut packet: Packet) -> Option<Packet> {
        let key = match packet.packet_type {
            PacketType::RoutedMessage => fingerprint_of(&packet.originator_pub),
            PacketType::ChannelMessage => channel_session_key(packet.channel_name.as_deref().unwrap_or_default()),
            _ => return Some(packet),
        };
        match self.sessions.decrypt_from(&key, &packet.payload) {
            Ok(plaintext) => {
                packet.payload = plaintext;
                Some(packet)
            }
            Err(e) => {
                tracing::debug!(packet_type = ?packet.packet_type, error = %e, "dropping packet with undecryptable payload");
                None
            }
        }
    }

    /// Decrement TTL, increment hop count, append the local fingerprint to
    /// `routeHistory`, and send the result onward: to the known next hop
    /// (if any and not already traversed) and, for broadcast or
    /// unknown-destination traffic, to every direct peer not already
    /// traversed (`spec.md` §4.7 step 5).
    fn forward(&self, mut packet: Packet) {
        packet.hop_count = packet.hop_count.saturating_add(1);
        packet.ttl = packet.ttl.saturating_sub(1);
        packet.route_history.push(self.local_fingerprint.clone());
        packet.sender_id = crate::packet::sender_id_from_pub(&self.local_static_pub);

        let is_broadcast = packet.is_broadcast();
        let dest_fp = fingerprint_of(&packet.destination_pub);
        let next = if is_broadcast { None } else { self.next_hop(&dest_fp) };

        let bytes = packet.serialize();
        let mut sent_to = Vec::new();

        if let Some(next_fp) = &next {
            if !packet.route_history.contains(next_fp) && self.sink.send_to(next_fp, bytes.clone()) {
                sent_to.push(next_fp.clone());
            }
        }

        if is_broadcast || next.is_none() {
            for fp in self.direct_peer_fingerprints() {
                if sent_to.contains(&fp) || packet.route_history.contains(&fp) {
                    continue;
                }
                if self.sink.send_to(&fp, bytes.clone()) {
                    sent_to.push(fp);
                }
            }
        }

        let _ = self.events.send(RoutingEvent::Forwarded {
            packet_type: packet.packet_type,
            to: sent_to,
        });
    }

    /// Send a freshly originated packet without running it through the
    /// ingest pipeline (it has not been received from anyone), but still
    /// record it in the seen cache so a looped-back copy is dropped.
    fn originate(&self, packet: Packet) {
        self.seen_cache.insert_if_new(Self::msg_key(&packet));
        let bytes = packet.serialize();
        if packet.is_broadcast() {
            for fp in self.direct_peer_fingerprints() {
                self.sink.send_to(&fp, bytes.clone());
            }
        } else {
            let dest_fp = fingerprint_of(&packet.destination_pub);
            if let Some(next) = self.next_hop(&dest_fp) {
                self.sink.send_to(&next, bytes);
            }
        }
    }

    /// The common ingest pipeline (`spec.md` §4.7): dedup, TTL, loop check,
    /// opportunistic route learning, destination check, and forward.
    pub fn ingest(&self, packet: Packet) -> IngestOutcome {
        if !self.seen_cache.insert_if_new(Self::msg_key(&packet)) {
            return IngestOutcome::Dropped(DropReason::Duplicate);
        }
        if packet.ttl == 0 {
            return IngestOutcome::Dropped(DropReason::TtlExpired);
        }
        if packet.route_history.iter().any(|fp| fp == &self.local_fingerprint) {
            return IngestOutcome::Dropped(DropReason::LoopDetected);
        }

        self.learn_from_route_history(&packet);

        let is_for_me = packet.is_for(&self.local_static_pub);
        let is_broadcast = packet.is_broadcast();

        if is_for_me {
            return match self.decrypt_payload(packet) {
                Some(packet) => {
                    let _ = self.events.send(RoutingEvent::MessageDelivered(packet));
                    IngestOutcome::Delivered
                }
                None => IngestOutcome::Dropped(DropReason::CryptoError),
            };
        }
        if is_broadcast {
            if let Some(delivered) = self.decrypt_payload(packet.clone()) {
                let _ = self.events.send(RoutingEvent::MessageDelivered(delivered));
            }
        }

        self.forward(packet);
        IngestOutcome::Forwarded
    }

    /// Route-discovery/reply and channel-control packets go through
    /// [`RoutingEngine::ingest`] too, except route-discovery (which may
    /// answer locally) and route-reply (which always learns from
    /// `routeHistory`) need their own handling first.
    pub fn ingest_control(&self, packet: Packet) -> IngestOutcome {
        match packet.packet_type {
            PacketType::RouteDiscovery => self.ingest_route_discovery(packet),
            PacketType::RouteReply => self.ingest_route_reply(packet),
            _ => self.ingest(packet),
        }
    }

    fn ingest_route_discovery(&self, packet: Packet) -> IngestOutcome {
        if !self.seen_cache.insert_if_new(Self::msg_key(&packet)) {
            return IngestOutcome::Dropped(DropReason::Duplicate);
        }
        if packet.ttl == 0 {
            return IngestOutcome::Dropped(DropReason::TtlExpired);
        }
        if packet.route_history.iter().any(|fp| fp == &self.local_fingerprint) {
            return IngestOutcome::Dropped(DropReason::LoopDetected);
        }

        self.learn_from_route_history(&packet);

        let target_fp = String::from_utf8_lossy(&packet.payload).trim().to_string();
        if target_fp == self.local_fingerprint {
            let reply = Packet::new_v2(
                PacketType::RouteReply,
                self.next_seq(),
                self.local_static_pub,
                packet.originator_pub,
                0,
                DEFAULT_TTL,
                packet.payload.clone(),
            )
            .with_route_history(packet.route_history.clone());
            self.forward(reply);
            return IngestOutcome::Delivered;
        }

        self.forward(packet);
        IngestOutcome::Forwarded
    }

    fn ingest_route_reply(&self, packet: Packet) -> IngestOutcome {
        if !self.seen_cache.insert_if_new(Self::msg_key(&packet)) {
            return IngestOutcome::Dropped(DropReason::Duplicate);
        }
        if packet.ttl == 0 {
            return IngestOutcome::Dropped(DropReason::TtlExpired);
        }
        if packet.route_history.iter().any(|fp| fp == &self.local_fingerprint) {
            return IngestOutcome::Dropped(DropReason::LoopDetected);
        }

        self.learn_from_route_history(&packet);

        if packet.is_for(&self.local_static_pub) {
            let _ = self.events.send(RoutingEvent::MessageDelivered(packet));
            return IngestOutcome::Delivered;
        }

        self.forward(packet);
        IngestOutcome::Forwarded
    }

    /// Build and send a channel-message packet: TTL=7, broadcast
    /// destination, empty `routeHistory` (`spec.md` §4.7). The payload is
    /// encrypted through the channel's PSK slot before it hits the wire.
    pub fn send_channel(&self, channel_name: &str, text: &str) {
        let ciphertext = self
            .sessions
            .encrypt_for(&channel_session_key(channel_name), text.as_bytes());
        let packet = Packet::new_v2(
            PacketType::ChannelMessage,
            self.next_seq(),
            self.local_static_pub,
            BROADCAST_DESTINATION,
            0,
            DEFAULT_TTL,
            ciphertext,
        )
        .with_channel_name(channel_name.to_string());
        self.originate(packet);
    }

    /// Build and send a channel-join/leave/announce packet with payload
    /// `nickname[|extraData]`.
    pub fn send_channel_control(
        &self,
        packet_type: PacketType,
        channel_name: &str,
        nickname: &str,
        extra_data: Option<&str>,
    ) {
        let mut payload = nickname.to_string();
        if let Some(extra) = extra_data {
            payload.push('|');
            payload.push_str(extra);
        }
        let packet = Packet::new_v2(
            packet_type,
            self.next_seq(),
            self.local_static_pub,
            BROADCAST_DESTINATION,
            0,
            DEFAULT_TTL,
            payload.into_bytes(),
        )
        .with_channel_name(channel_name.to_string());
        self.originate(packet);
    }

    /// Build and send a unicast text-message packet addressed to
    /// `destination_pub`, wrapped as a [`PacketType::RoutedMessage`] so
    /// intermediate hops forward it without decrypting or interpreting it.
    /// The payload is encrypted through the destination's session
    /// (PSK fallback if none is established yet) before it is serialized.
    pub fn send_text(&self, destination_pub: [u8; 32], text: &str) {
        let dest_fp = fingerprint_of(&destination_pub);
        let ciphertext = self.sessions.encrypt_for(&dest_fp, text.as_bytes());
        let packet = Packet::new_v2(
            PacketType::RoutedMessage,
            self.next_seq(),
            self.local_static_pub,
            destination_pub,
            0,
            DEFAULT_TTL,
            ciphertext,
        );
        self.originate(packet);
    }

    /// Encrypt `plaintext` for `destination_fingerprint` the same way
    /// [`RoutingEngine::send_text`] does, for callers that need the
    /// ciphertext directly (e.g. the store-and-forward offline queue).
    #[must_use]
    pub fn encrypt_for(&self, destination_fingerprint: &str, plaintext: &[u8]) -> Vec<u8> {
        self.sessions.encrypt_for(destination_fingerprint, plaintext)
    }

    /// Install the session established with `peer_fingerprint`, e.g. after
    /// completing a handshake over a newly connected link.
    pub fn install_session(&self, peer_fingerprint: &str, session: crate::session::Session) {
        self.sessions.insert(peer_fingerprint, session);
    }

    /// Build and send a route-discovery packet: TTL=7, broadcast
    /// destination, payload = the target fingerprint.
    pub fn discover_route(&self, destination_fingerprint: &str) {
        let packet = Packet::new_v2(
            PacketType::RouteDiscovery,
            self.next_seq(),
            self.local_static_pub,
            BROADCAST_DESTINATION,
            0,
            DEFAULT_TTL,
            destination_fingerprint.as_bytes().to_vec(),
        );
        self.originate(packet);
    }
}
