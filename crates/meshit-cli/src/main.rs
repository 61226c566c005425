//! Command-line interface binary for meshit: identity management and an
//! interactive chat node wiring together the core protocol engine and the
//! connection-manager/dispatcher transport layer.

mod config;
mod progress;

use std::sync::Arc;

use clap::{Parser, Subcommand};
use dashmap::DashMap;
use meshit_core::channel::{ChannelEvent, ChannelService, Command as ChatCommand, parse_command};
use meshit_core::identity::{Identity, fingerprint_of};
use meshit_core::packet::{BROADCAST_DESTINATION, Packet, PacketType};
use meshit_core::routing::{DEFAULT_TTL, ROUTING_CLEANUP_INTERVAL, RoutingEngine, RoutingEvent};
use meshit_core::session::{HandshakeInitiator, HandshakeResponder, Session, SessionMap};
use meshit_core::store_and_forward::StoreAndForward;
use meshit_crypto::x25519::PrivateKey as X25519PrivateKey;
use meshit_transport::chunk::{Reassembler, chunk};
use meshit_transport::dispatch::{Dispatcher, InboundPacket};
use meshit_transport::link::{TcpConnector, TcpLink};
use meshit_transport::manager::ConnectionManager;
use meshit_transport::peers::{PeerDirectory, TransportSink};
use serde::Deserialize;
use std::collections::HashMap;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;
use tracing::{info, warn};

use config::Config;
use progress::TransferProgress;

#[derive(Parser)]
#[command(name = "meshit", version, about = "Peer-to-peer BLE mesh messaging")]
struct Cli {
    /// Increase log verbosity (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Path to a configuration file; defaults to the platform config dir.
    #[arg(short, long)]
    config: Option<std::path::PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a new node identity, protected by a passphrase.
    Keygen {
        /// Overwrite an existing identity file if one is present.
        #[arg(long)]
        force: bool,
    },
    /// Print the local identity and configuration summary.
    Status,
    /// Run the interactive mesh node: dial bootstrap peers, accept inbound
    /// links, join configured channels, and read chat commands from stdin.
    Run,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.unwrap_or_else(Config::default_path);
    let config = if config_path.exists() {
        Config::load(&config_path)?
    } else {
        let config = Config::default();
        config.save(&config_path)?;
        config
    };
    config.validate()?;

    let level = match cli.verbose {
        0 => config.logging.level.clone(),
        1 => "debug".to_string(),
        _ => "trace".to_string(),
    };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(level))
        .init();

    match cli.command {
        Commands::Keygen { force } => keygen(&config, force).await,
        Commands::Status => status(&config).await,
        Commands::Run => run(&config).await,
    }
}

fn prompt_passphrase(confirm: bool) -> anyhow::Result<String> {
    let passphrase = rpassword::prompt_password("Identity passphrase: ")?;
    if confirm {
        let again = rpassword::prompt_password("Confirm passphrase: ")?;
        if passphrase != again {
            anyhow::bail!("passphrases did not match");
        }
    }
    Ok(passphrase)
}

async fn keygen(config: &Config, force: bool) -> anyhow::Result<()> {
    if config.node.identity_file.exists() && !force {
        anyhow::bail!(
            "identity file already exists at {}; pass --force to overwrite",
            config.node.identity_file.display()
        );
    }

    let passphrase = prompt_passphrase(true)?;
    let mut identity = Identity::generate();
    identity.set_nickname(Some(config.node.nickname.clone()));

    let bytes = identity.save(&passphrase)?;
    if let Some(parent) = config.node.identity_file.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&config.node.identity_file, bytes)?;

    println!("Identity written to {}", config.node.identity_file.display());
    println!("Fingerprint: {}", identity.fingerprint());
    println!("Verification URI: {}", identity.verification_uri());
    Ok(())
}

fn load_identity(config: &Config) -> anyhow::Result<Identity> {
    let bytes = std::fs::read(&config.node.identity_file).ok();
    let passphrase = prompt_passphrase(false)?;
    let mut identity = Identity::load_or_create(bytes.as_deref(), &passphrase, None);
    if identity.nickname().is_none() {
        identity.set_nickname(Some(config.node.nickname.clone()));
    }
    Ok(identity)
}

async fn status(config: &Config) -> anyhow::Result<()> {
    let identity = load_identity(config)?;
    println!("Nickname: {}", identity.nickname().unwrap_or("(none)"));
    println!("Fingerprint: {}", identity.fingerprint());
    println!("Short fingerprint: {}", identity.short_fingerprint());
    println!("Verification URI: {}", identity.verification_uri());
    println!("Listen address: {}", config.network.listen_addr);
    println!("Bootstrap peers: {:?}", config.network.bootstrap_peers);
    println!("Auto-join channels: {:?}", config.channels.auto_join);
    Ok(())
}

/// Known direct/previously-seen peers: fingerprint -> raw X25519 public key,
/// learned once a handshake with that peer completes.
type KnownPeers = Arc<DashMap<String, [u8; 32]>>;

/// Handshake state kept between sending/receiving message 1 and completing
/// the exchange, keyed by link address (`spec.md` §4.4's 3-message
/// handshake is performed directly over each [`meshit_transport::link::Link`]
/// on connect, taking the place of a plaintext peer announcement).
type PendingInitiators = Arc<DashMap<String, HandshakeInitiator>>;
type PendingResponders = Arc<DashMap<String, HandshakeResponder>>;

async fn run(config: &Config) -> anyhow::Result<()> {
    let identity = load_identity(config)?;
    let local_fp = identity.fingerprint();
    let local_pub = identity.x25519_public().to_bytes();
    let local_static = Arc::new(identity.x25519_private().clone());
    info!(fingerprint = %local_fp, "node starting");

    let (manager, _announce_events) = ConnectionManager::new(Arc::new(TcpConnector));
    let directory = Arc::new(PeerDirectory::new());
    let sink = Arc::new(TransportSink::new(Arc::clone(&manager), Arc::clone(&directory)));
    let sessions = Arc::new(SessionMap::new());
    let (routing, routing_events) = RoutingEngine::new(local_pub, sink, Arc::clone(&sessions));
    let routing = Arc::new(routing);
    let channels = Arc::new(ChannelService::new());
    let store_and_forward = Arc::new(StoreAndForward::new(&config.store_and_forward.pending_dir));
    let known_peers: KnownPeers = Arc::new(DashMap::new());
    let pending_initiators: PendingInitiators = Arc::new(DashMap::new());
    let pending_responders: PendingResponders = Arc::new(DashMap::new());

    let (dispatcher, message_rx, mut file_rx) =
        Dispatcher::new(Arc::clone(&routing), Arc::clone(&channels), Arc::clone(&directory));
    let dispatch_events = manager.subscribe();
    tokio::spawn(async move {
        dispatcher.run(dispatch_events).await;
    });

    let listen_addr = config.parse_listen_addr()?;
    let listener = TcpListener::bind(listen_addr).await?;
    info!(%listen_addr, "listening for inbound links");
    {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        let link = Arc::new(TcpLink::new(stream, peer.to_string()));
                        manager.register_incoming(peer.to_string(), link);
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                    }
                }
            }
        });
    }

    for peer in &config.network.bootstrap_peers {
        match manager.connect(peer).await {
            Ok(()) => initiate_handshake(&manager, &pending_initiators, local_pub, peer).await,
            Err(e) => warn!(peer, error = %e, "failed to dial bootstrap peer"),
        }
    }

    for channel in &config.channels.auto_join {
        if let Ok(ChannelEvent::Joined { channel, nickname }) =
            channels.join(channel, None, &local_fp, &identity_nickname(&identity))
        {
            routing.send_channel_control(PacketType::ChannelJoin, &channel, &nickname, None);
            println!("joined {channel}");
        }
    }

    spawn_inbound_message_handler(
        message_rx,
        Arc::clone(&directory),
        Arc::clone(&routing),
        Arc::clone(&manager),
        Arc::clone(&store_and_forward),
        Arc::clone(&known_peers),
        Arc::clone(&local_static),
        local_pub,
        Arc::clone(&pending_initiators),
        Arc::clone(&pending_responders),
    );

    spawn_file_receiver(file_rx, config.file_transfer.received_dir.clone());

    spawn_routing_event_printer(routing_events);
    spawn_maintenance(Arc::clone(&routing), Arc::clone(&channels));

    println!("ready. /join #channel, /leave #channel, /msg <fingerprint> <text>, /send <fingerprint> <path>, /who, /channels, /help");
    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();
    let mut current_channel: Option<String> = None;
    let nickname = identity_nickname(&identity);

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        if line.starts_with('/') {
            handle_chat_command(
                &line,
                &channels,
                &routing,
                &store_and_forward,
                &known_peers,
                &directory,
                &manager,
                &local_fp,
                local_pub,
                &nickname,
                &mut current_channel,
            )
            .await;
            continue;
        }

        let Some(channel) = current_channel.clone() else {
            println!("join a channel first with /join #channel");
            continue;
        };
        match channels.send_message(&channel, &line) {
            Ok(ChannelEvent::MessageReady { channel, text }) => {
                routing.send_channel(&channel, &text);
            }
            Err(e) => println!("send failed: {e}"),
            Ok(_) => {}
        }
    }

    Ok(())
}

fn identity_nickname(identity: &Identity) -> String {
    identity.nickname().unwrap_or("anonymous").to_string()
}

#[allow(clippy::too_many_arguments)]
async fn handle_chat_command(
    line: &str,
    channels: &ChannelService,
    routing: &RoutingEngine,
    store_and_forward: &StoreAndForward,
    known_peers: &KnownPeers,
    directory: &PeerDirectory,
    manager: &ConnectionManager,
    local_fp: &str,
    local_pub: [u8; 32],
    nickname: &str,
    current_channel: &mut Option<String>,
) {
    match parse_command(line) {
        ChatCommand::Join { channel, password } => {
            match channels.join(&channel, password.as_deref(), local_fp, nickname) {
                Ok(ChannelEvent::Joined { channel, nickname }) => {
                    routing.send_channel_control(PacketType::ChannelJoin, &channel, &nickname, None);
                    *current_channel = Some(channel.clone());
                    println!("joined {channel}");
                }
                Ok(_) => {}
                Err(e) => println!("join failed: {e}"),
            }
        }
        ChatCommand::Leave { channel } => {
            let event = channels.leave(&channel, local_fp, nickname);
            if let ChannelEvent::Left { channel, nickname } = event {
                routing.send_channel_control(PacketType::ChannelLeave, &channel, &nickname, None);
                if current_channel.as_deref() == Some(channel.as_str()) {
                    *current_channel = None;
                }
                println!("left {channel}");
            }
        }
        ChatCommand::ListChannels => {
            println!("joined: {:?}", channels.joined_channels());
            println!("available: {:?}", channels.available_channels());
        }
        ChatCommand::Who { channel } => {
            let Some(channel) = channel.or_else(|| current_channel.clone()) else {
                println!("no channel specified and none active");
                return;
            };
            println!("members of {channel}: {:?}", channels.members(&channel));
        }
        ChatCommand::DirectMessage { name, text } => match known_peers.get(&name) {
            Some(pubkey) => {
                let dest_pub = *pubkey;
                if routing.next_hop(&name).is_some() {
                    routing.send_text(dest_pub, &text);
                } else {
                    let ciphertext = routing.encrypt_for(&name, text.as_bytes());
                    let packet = Packet::new_v2(PacketType::RoutedMessage, 0, local_pub, dest_pub, 0, DEFAULT_TTL, ciphertext);
                    if let Err(e) = store_and_forward.queue(&name, &packet.serialize()) {
                        println!("failed to queue offline message: {e}");
                    } else {
                        println!("peer {name} unreachable, message queued for later delivery");
                    }
                }
            }
            None => println!("unknown peer '{name}'; peers must be seen at least once before messaging directly"),
        },
        ChatCommand::SendFile { name, path } => {
            if known_peers.get(&name).is_none() {
                println!("unknown peer '{name}'; peers must be seen at least once before messaging directly");
            } else if let Some(address) = directory.address_of(&name) {
                send_file(manager, &address, local_pub, &path).await;
            } else {
                println!("peer {name} is not directly connected; file transfer needs a live link");
            }
        }
        ChatCommand::Help => {
            println!("/join #channel [password]  /leave #channel  /who [#channel]");
            println!("/channels  /msg <fingerprint> <text>  /send <fingerprint> <path>  /help");
        }
        ChatCommand::Unhandled(text) => println!("unknown command: {text}"),
    }
}

/// A file-chunk's reassembly-header MTU for the dev TCP transport
/// (`meshit_transport::chunk`'s header is 8 bytes, so this yields roughly
/// 16 KiB of payload per chunk).
const FILE_CHUNK_MTU: usize = 16 * 1024;

/// Sidecar JSON payload carried by a [`PacketType::FileMetadata`] frame,
/// announcing the transfer that the following `FileChunk`s belong to.
#[derive(Debug, Clone, serde::Serialize, Deserialize)]
struct FileMetadataPayload {
    msg_id: u32,
    filename: String,
    size: u64,
}

/// Distinguishes concurrent in-flight transfers; wraps rather than panics
/// since an overlap only risks interleaving two reassemblies, never a crash.
fn next_file_msg_id() -> u32 {
    static NEXT: std::sync::atomic::AtomicU32 = std::sync::atomic::AtomicU32::new(1);
    NEXT.fetch_add(1, std::sync::atomic::Ordering::Relaxed)
}

async fn send_file(manager: &ConnectionManager, address: &str, local_pub: [u8; 32], path: &str) {
    let filename = std::path::Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string());

    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) => {
            println!("failed to read {path}: {e}");
            return;
        }
    };

    let msg_id = next_file_msg_id();

    let metadata = FileMetadataPayload {
        msg_id,
        filename: filename.clone(),
        size: bytes.len() as u64,
    };
    let metadata_payload = serde_json::to_vec(&metadata).expect("file metadata always serializes");
    let metadata_packet =
        Packet::new_v2(PacketType::FileMetadata, 0, local_pub, BROADCAST_DESTINATION, 0, DEFAULT_TTL, metadata_payload);
    manager.send(address, &metadata_packet.serialize()).await;

    let chunks = chunk(FILE_CHUNK_MTU, msg_id, &bytes);
    let total_chunks = chunks.len() as u64;
    let total_bytes = bytes.len() as u64;
    let progress = TransferProgress::new(total_bytes, &filename);

    for (index, chunk_bytes) in chunks.into_iter().enumerate() {
        let packet =
            Packet::new_v2(PacketType::FileChunk, index as u32, local_pub, BROADCAST_DESTINATION, 0, DEFAULT_TTL, chunk_bytes);
        manager.send(address, &packet.serialize()).await;
        progress.update(((index as u64 + 1) * total_bytes) / total_chunks.max(1));
    }
    progress.finish_with_message(format!("sent {filename}"));
}

/// Send handshake message 1 over the just-connected link to `address`,
/// registering the initiator state to resume once message 2 arrives.
async fn initiate_handshake(
    manager: &ConnectionManager,
    pending_initiators: &PendingInitiators,
    local_pub: [u8; 32],
    address: &str,
) {
    let (initiator, msg1) = HandshakeInitiator::start();
    pending_initiators.insert(address.to_string(), initiator);
    let packet = Packet::new_v2(PacketType::NoiseMsg1, 0, local_pub, BROADCAST_DESTINATION, 0, 1, msg1);
    manager.send(address, &packet.serialize()).await;
}

/// Finish wiring up a peer once its handshake has produced an established
/// [`Session`]: bind its fingerprint to the link address, mark it reachable
/// for routing, install the session, and flush anything queued for it
/// while it was offline. Takes the place of the old plaintext
/// `PeerAnnouncement` handler.
#[allow(clippy::too_many_arguments)]
async fn complete_handshake(
    directory: &PeerDirectory,
    routing: &RoutingEngine,
    known_peers: &KnownPeers,
    store_and_forward: &StoreAndForward,
    manager: &ConnectionManager,
    address: &str,
    session: Session,
) {
    let fingerprint = fingerprint_of(session.remote_static_pub());
    let remote_pub = *session.remote_static_pub();
    directory.bind(&fingerprint, address);
    routing.register_direct_peer(&fingerprint);
    known_peers.insert(fingerprint.clone(), remote_pub);
    routing.install_session(&fingerprint, session);
    println!("peer connected: {}", &fingerprint[..8]);

    if let Ok(queued) = store_and_forward.flush(&fingerprint) {
        for frame in queued {
            manager.send(address, &frame).await;
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn spawn_inbound_message_handler(
    mut message_rx: tokio::sync::mpsc::UnboundedReceiver<InboundPacket>,
    directory: Arc<PeerDirectory>,
    routing: Arc<RoutingEngine>,
    manager: Arc<ConnectionManager>,
    store_and_forward: Arc<StoreAndForward>,
    known_peers: KnownPeers,
    local_static: Arc<X25519PrivateKey>,
    local_pub: [u8; 32],
    pending_initiators: PendingInitiators,
    pending_responders: PendingResponders,
) {
    tokio::spawn(async move {
        while let Some(InboundPacket { from_address, packet }) = message_rx.recv().await {
            match packet.packet_type {
                PacketType::NoiseMsg1 => match HandshakeResponder::process_msg1(&local_static, &packet.payload) {
                    Ok((msg2, responder)) => {
                        pending_responders.insert(from_address.clone(), responder);
                        let reply = Packet::new_v2(PacketType::NoiseMsg2, 0, local_pub, BROADCAST_DESTINATION, 0, 1, msg2);
                        manager.send(&from_address, &reply.serialize()).await;
                    }
                    Err(e) => warn!(from_address, error = %e, "rejected handshake message 1"),
                },
                PacketType::NoiseMsg2 => {
                    if let Some((_, initiator)) = pending_initiators.remove(&from_address) {
                        match initiator.process_msg2(&local_static, &packet.payload) {
                            Ok((msg3, session)) => {
                                let reply = Packet::new_v2(PacketType::NoiseMsg3, 0, local_pub, BROADCAST_DESTINATION, 0, 1, msg3);
                                manager.send(&from_address, &reply.serialize()).await;
                                complete_handshake(
                                    &directory,
                                    &routing,
                                    &known_peers,
                                    &store_and_forward,
                                    &manager,
                                    &from_address,
                                    session,
                                )
                                .await;
                            }
                            Err(e) => warn!(from_address, error = %e, "rejected handshake message 2"),
                        }
                    }
                }
                PacketType::NoiseMsg3 => {
                    if let Some((_, responder)) = pending_responders.remove(&from_address) {
                        match responder.process_msg3(&local_static, &packet.payload) {
                            Ok(session) => {
                                complete_handshake(
                                    &directory,
                                    &routing,
                                    &known_peers,
                                    &store_and_forward,
                                    &manager,
                                    &from_address,
                                    session,
                                )
                                .await;
                            }
                            Err(e) => warn!(from_address, error = %e, "rejected handshake message 3"),
                        }
                    }
                }
                PacketType::TextMessage => {
                    let text = String::from_utf8_lossy(&packet.payload);
                    println!("[{from_address}] {text}");
                }
                _ => {}
            }
        }
    });
}

/// Reassemble inbound `FileMetadata`/`FileChunk` frames and write completed
/// transfers to `received_dir`, driving a [`TransferProgress`] bar for
/// each in-flight transfer.
fn spawn_file_receiver(mut file_rx: tokio::sync::mpsc::UnboundedReceiver<InboundPacket>, received_dir: std::path::PathBuf) {
    struct PendingReceive {
        filename: String,
        size: u64,
        progress: TransferProgress,
    }

    tokio::spawn(async move {
        let mut reassembler = Reassembler::new();
        let mut pending: HashMap<u32, PendingReceive> = HashMap::new();

        while let Some(InboundPacket { from_address, packet }) = file_rx.recv().await {
            match packet.packet_type {
                PacketType::FileMetadata => match serde_json::from_slice::<FileMetadataPayload>(&packet.payload) {
                    Ok(meta) => {
                        let progress = TransferProgress::new(meta.size, &meta.filename);
                        pending.insert(
                            meta.msg_id,
                            PendingReceive {
                                filename: meta.filename,
                                size: meta.size,
                                progress,
                            },
                        );
                    }
                    Err(e) => warn!(from_address, error = %e, "malformed file metadata"),
                },
                PacketType::FileChunk => {
                    if packet.payload.len() < 8 {
                        continue;
                    }
                    let msg_id = u32::from_be_bytes(packet.payload[0..4].try_into().expect("checked length"));
                    let index = u16::from_be_bytes(packet.payload[4..6].try_into().expect("checked length"));
                    let total = u16::from_be_bytes(packet.payload[6..8].try_into().expect("checked length"));
                    if let Some(receive) = pending.get(&msg_id) {
                        receive
                            .progress
                            .update(((u64::from(index) + 1) * receive.size) / u64::from(total.max(1)));
                    }

                    match reassembler.push(&packet.payload) {
                        Ok(Some(assembled)) => {
                            if let Some(receive) = pending.remove(&msg_id) {
                                let dest = received_dir.join(&receive.filename);
                                match std::fs::create_dir_all(&received_dir).and_then(|()| std::fs::write(&dest, &assembled)) {
                                    Ok(()) => receive.progress.finish_with_message(format!("received {}", receive.filename)),
                                    Err(e) => {
                                        receive.progress.abandon();
                                        warn!(from_address, error = %e, "failed to write received file");
                                    }
                                }
                            } else {
                                println!(
                                    "received file (msg {msg_id}, {} bytes) from {from_address} with no matching metadata",
                                    assembled.len()
                                );
                            }
                        }
                        Ok(None) => {}
                        Err(e) => warn!(from_address, error = %e, "malformed file chunk"),
                    }
                }
                _ => {}
            }
        }
    });
}

fn spawn_routing_event_printer(mut routing_events: tokio::sync::broadcast::Receiver<RoutingEvent>) {
    tokio::spawn(async move {
        loop {
            match routing_events.recv().await {
                Ok(RoutingEvent::MessageDelivered(packet)) => match packet.packet_type {
                    PacketType::ChannelMessage => {
                        let channel = packet.channel_name.clone().unwrap_or_default();
                        let text = String::from_utf8_lossy(&packet.payload);
                        let from = fingerprint_of(&packet.originator_pub);
                        println!("{channel} <{}>: {text}", &from[..8]);
                    }
                    PacketType::RoutedMessage => {
                        let text = String::from_utf8_lossy(&packet.payload);
                        let from = fingerprint_of(&packet.originator_pub);
                        println!("(dm) <{}>: {text}", &from[..8]);
                    }
                    _ => {}
                },
                Ok(RoutingEvent::Forwarded { .. }) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

fn spawn_maintenance(routing: Arc<RoutingEngine>, channels: Arc<ChannelService>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(ROUTING_CLEANUP_INTERVAL);
        loop {
            interval.tick().await;
            routing.cleanup();
            for event in channels.announce_all() {
                if let ChannelEvent::Announce { channel, member_count } = event {
                    routing.send_channel_control(PacketType::ChannelAnnounce, &channel, "", Some(&member_count.to_string()));
                }
            }
        }
    });
}
