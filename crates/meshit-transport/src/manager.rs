//! Connection manager (C5): outbound dial, inbound accept, length-prefixed
//! framing, and at-most-one live link per peer address.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, info, warn};

use crate::link::{Link, LinkConnector, LinkError};

/// Maximum number of connect attempts before giving up (`spec.md` §4.5).
pub const MAX_RETRIES: u32 = 3;

/// Frames above this size are rejected and the link is dropped
/// (`spec.md` §4.5).
pub const MAX_PAYLOAD_FRAME: u32 = 10 * 1024 * 1024;

/// Errors surfaced by connection-manager operations.
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    /// Every connect attempt failed.
    #[error("connect to {address} failed after {attempts} attempts: {source}")]
    ConnectFailed {
        /// The address that could not be reached.
        address: String,
        /// How many attempts were made.
        attempts: u32,
        /// The last link error observed.
        #[source]
        source: LinkError,
    },
}

/// Events the manager publishes for the dispatcher to consume.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// A link to `address` is now established (outbound or inbound).
    Connected { address: String },
    /// The link to `address` closed, cleanly or due to an error.
    Disconnected { address: String },
    /// A complete framed payload arrived on the link to `address`.
    DataReceived { address: String, bytes: Vec<u8> },
}

/// Owns the set of live links, keyed by peer address, and the background
/// read loop for each.
pub struct ConnectionManager {
    links: DashMap<String, Arc<dyn Link>>,
    connect_lock: Mutex<()>,
    events: broadcast::Sender<ConnectionEvent>,
    connector: Arc<dyn LinkConnector>,
}

impl ConnectionManager {
    /// Build a manager that dials new outbound links through `connector`.
    #[must_use]
    pub fn new(connector: Arc<dyn LinkConnector>) -> (Arc<Self>, broadcast::Receiver<ConnectionEvent>) {
        let (tx, rx) = broadcast::channel(1024);
        let manager = Arc::new(Self {
            links: DashMap::new(),
            connect_lock: Mutex::new(()),
            events: tx,
            connector,
        });
        (manager, rx)
    }

    /// Subscribe to connection events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    /// True when a live link is registered for `address`.
    #[must_use]
    pub fn is_connected(&self, address: &str) -> bool {
        self.links.contains_key(address)
    }

    /// Number of live links.
    #[must_use]
    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    /// Dial `address` if not already connected, retrying up to
    /// [`MAX_RETRIES`] times with exponential backoff (`2^attempt`
    /// seconds). Connect attempts are serialized so two concurrent calls
    /// for the same address cannot race.
    pub async fn connect(self: &Arc<Self>, address: &str) -> Result<(), ManagerError> {
        let _guard = self.connect_lock.lock().await;
        if self.links.contains_key(address) {
            return Ok(());
        }

        let mut last_err = None;
        for attempt in 0..MAX_RETRIES {
            match self.connector.connect(address).await {
                Ok(link) => {
                    self.register(address.to_string(), link);
                    return Ok(());
                }
                Err(e) => {
                    warn!(address, attempt, error = %e, "connect attempt failed");
                    last_err = Some(e);
                    tokio::time::sleep(Duration::from_secs(1 << attempt)).await;
                }
            }
        }

        Err(ManagerError::ConnectFailed {
            address: address.to_string(),
            attempts: MAX_RETRIES,
            source: last_err.expect("loop ran at least once"),
        })
    }

    /// Register an inbound link, closing any existing link for the same
    /// address first.
    pub fn register_incoming(self: &Arc<Self>, address: String, link: Arc<dyn Link>) {
        self.register(address, link);
    }

    fn register(self: &Arc<Self>, address: String, link: Arc<dyn Link>) {
        if let Some((_, old)) = self.links.remove(&address) {
            let old = old.clone();
            tokio::spawn(async move {
                let _ = old.close().await;
            });
        }
        self.links.insert(address.clone(), link.clone());
        let _ = self.events.send(ConnectionEvent::Connected { address: address.clone() });
        self.spawn_read_loop(address, link);
    }

    fn spawn_read_loop(self: &Arc<Self>, address: String, link: Arc<dyn Link>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match read_frame(link.as_ref()).await {
                    Ok(bytes) => {
                        let _ = manager.events.send(ConnectionEvent::DataReceived {
                            address: address.clone(),
                            bytes,
                        });
                    }
                    Err(_) => {
                        manager.links.remove(&address);
                        let _ = manager.events.send(ConnectionEvent::Disconnected { address: address.clone() });
                        debug!(address, "link closed, read loop exiting");
                        break;
                    }
                }
            }
        });
    }

    /// Send `bytes` to `address` as one length-prefixed frame. Returns
    /// `false` when no link is registered for `address`.
    pub async fn send(&self, address: &str, bytes: &[u8]) -> bool {
        let Some(link) = self.links.get(address).map(|e| e.clone()) else {
            return false;
        };
        match write_frame(link.as_ref(), bytes).await {
            Ok(()) => true,
            Err(e) => {
                warn!(address, error = %e, "send failed");
                self.links.remove(address);
                let _ = self.events.send(ConnectionEvent::Disconnected { address: address.to_string() });
                false
            }
        }
    }

    /// Tear down the link to `address`, if any.
    pub async fn disconnect(&self, address: &str) {
        if let Some((_, link)) = self.links.remove(address) {
            let _ = link.close().await;
            let _ = self.events.send(ConnectionEvent::Disconnected { address: address.to_string() });
            info!(address, "disconnected");
        }
    }
}

async fn read_frame(link: &dyn Link) -> Result<Vec<u8>, LinkError> {
    let mut len_bytes = [0u8; 4];
    link.read_exact(&mut len_bytes).await?;
    let len = u32::from_be_bytes(len_bytes);
    if len == 0 || len > MAX_PAYLOAD_FRAME {
        return Err(LinkError::Closed);
    }
    let mut buf = vec![0u8; len as usize];
    link.read_exact(&mut buf).await?;
    Ok(buf)
}

async fn write_frame(link: &dyn Link, bytes: &[u8]) -> Result<(), LinkError> {
    let len = u32::try_from(bytes.len()).map_err(|_| LinkError::Closed)?;
    link.write_all(&len.to_be_bytes()).await?;
    link.write_all(bytes).await
}
