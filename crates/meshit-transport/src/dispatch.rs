//! Dispatcher (C6): the single entry point from the link layer. Parses
//! every inbound frame and fans it out by packet type.

use std::sync::Arc;

use meshit_core::channel::ChannelService;
use meshit_core::packet::{Packet, PacketType};
use meshit_core::routing::RoutingEngine;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use crate::manager::ConnectionEvent;
use crate::peers::PeerDirectory;

/// A successfully parsed, non-routing packet handed to application-level
/// subscribers.
#[derive(Debug, Clone)]
pub struct InboundPacket {
    /// The peer address the frame arrived on.
    pub from_address: String,
    /// The parsed packet.
    pub packet: Packet,
}

/// Fans out parsed packets to the subscribers named in `spec.md` §4.6:
/// message, file, and channel handlers each get their own queue, while
/// routing/control types go straight into the [`RoutingEngine`] and
/// [`ChannelService`].
pub struct Dispatcher {
    routing: Arc<RoutingEngine>,
    channels: Arc<ChannelService>,
    directory: Arc<PeerDirectory>,
    message_tx: mpsc::UnboundedSender<InboundPacket>,
    file_tx: mpsc::UnboundedSender<InboundPacket>,
}

impl Dispatcher {
    /// Build a dispatcher wired to `routing` and `channels`, returning it
    /// alongside the message and file subscriber queues.
    #[must_use]
    pub fn new(
        routing: Arc<RoutingEngine>,
        channels: Arc<ChannelService>,
        directory: Arc<PeerDirectory>,
    ) -> (Self, mpsc::UnboundedReceiver<InboundPacket>, mpsc::UnboundedReceiver<InboundPacket>) {
        let (message_tx, message_rx) = mpsc::unbounded_channel();
        let (file_tx, file_rx) = mpsc::unbounded_channel();
        (
            Self {
                routing,
                channels,
                directory,
                message_tx,
                file_tx,
            },
            message_rx,
            file_rx,
        )
    }

    /// Run the dispatch loop against a stream of connection events,
    /// exiting when the event channel closes.
    pub async fn run(&self, mut events: broadcast::Receiver<ConnectionEvent>) {
        loop {
            match events.recv().await {
                Ok(ConnectionEvent::DataReceived { address, bytes }) => {
                    self.handle_frame(&address, &bytes);
                }
                Ok(ConnectionEvent::Connected { address }) => {
                    debug!(address, "dispatcher observed connect");
                }
                Ok(ConnectionEvent::Disconnected { address }) => {
                    if let Some(fingerprint) = self.directory.unbind_address(&address) {
                        self.routing.unregister_direct_peer(&fingerprint);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "dispatcher lagged behind connection events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    /// Parse one frame and route it by packet type (`spec.md` §4.6).
    pub fn handle_frame(&self, from_address: &str, bytes: &[u8]) {
        let packet = match Packet::parse(bytes) {
            Ok(p) => p,
            Err(e) => {
                debug!(from_address, error = %e, "dropping unparseable frame");
                return;
            }
        };
        self.handle_packet(from_address, packet);
    }

    fn handle_packet(&self, from_address: &str, packet: Packet) {
        match packet.packet_type {
            PacketType::TextMessage | PacketType::NoiseMsg1 | PacketType::NoiseMsg2 | PacketType::NoiseMsg3 => {
                let _ = self.message_tx.send(InboundPacket {
                    from_address: from_address.to_string(),
                    packet,
                });
            }
            PacketType::FileMetadata | PacketType::FileChunk => {
                let _ = self.file_tx.send(InboundPacket {
                    from_address: from_address.to_string(),
                    packet,
                });
            }
            PacketType::RoutedMessage => {
                self.routing.ingest(packet);
            }
            PacketType::RouteDiscovery | PacketType::RouteReply => {
                self.routing.ingest_control(packet);
            }
            PacketType::ChannelMessage | PacketType::ChannelJoin | PacketType::ChannelLeave | PacketType::ChannelAnnounce => {
                self.handle_channel_packet(packet.clone());
                self.routing.ingest_control(packet);
            }
            PacketType::Ack | PacketType::PeerAnnouncement => {
                let _ = self.message_tx.send(InboundPacket {
                    from_address: from_address.to_string(),
                    packet,
                });
            }
        }
    }

    fn handle_channel_packet(&self, packet: Packet) {
        let Some(channel_name) = packet.channel_name.clone() else {
            return;
        };
        let fingerprint = meshit_core::identity::fingerprint_of(&packet.originator_pub);
        let nickname = String::from_utf8_lossy(&packet.payload).to_string();
        match packet.packet_type {
            PacketType::ChannelJoin => self.channels.record_remote_join(&channel_name, &fingerprint, &nickname),
            PacketType::ChannelLeave => self.channels.record_remote_leave(&channel_name, &fingerprint),
            PacketType::ChannelAnnounce => self.channels.record_remote_announce(&channel_name),
            _ => {}
        }
    }
}
