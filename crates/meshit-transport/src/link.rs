//! The abstract byte-stream link (`spec.md` §6's link contract).
//!
//! A [`Link`] is whatever the radio stack hands back for an established
//! connection to one peer — a BLE GATT characteristic wrapper, an RFCOMM
//! socket, or (for development and tests) a plain TCP stream. The
//! connection manager and dispatcher never depend on which.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

/// Errors surfaced by a [`Link`] implementation.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    /// The underlying I/O primitive failed.
    #[error("link I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer closed the connection (clean EOF).
    #[error("link closed")]
    Closed,
}

/// An established, bidirectional byte-stream connection to one peer.
///
/// Implementations must serialize their own writes (a single `write_all`
/// call never interleaves with another); the connection manager relies on
/// this to keep per-link byte order intact per `spec.md` §5.
#[async_trait]
pub trait Link: Send + Sync {
    /// Read exactly `buf.len()` bytes, or fail with [`LinkError::Closed`]
    /// on EOF before the buffer is full.
    async fn read_exact(&self, buf: &mut [u8]) -> Result<(), LinkError>;

    /// Write the entire buffer.
    async fn write_all(&self, buf: &[u8]) -> Result<(), LinkError>;

    /// Close the link. Idempotent.
    async fn close(&self) -> Result<(), LinkError>;

    /// A human-readable remote address, for logging only.
    fn remote_label(&self) -> String;
}

impl fmt::Debug for dyn Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Link").field("remote", &self.remote_label()).finish()
    }
}

/// Something that can establish outbound [`Link`]s to an address string
/// (a BLE MAC, an RFCOMM channel identifier, a `host:port` pair in tests).
#[async_trait]
pub trait LinkConnector: Send + Sync {
    /// Dial `address`, returning an established link.
    async fn connect(&self, address: &str) -> Result<Arc<dyn Link>, LinkError>;
}

/// A TCP-backed [`Link`], used for local development and integration tests
/// in place of a real BLE/RFCOMM radio stack.
pub struct TcpLink {
    stream: tokio::sync::Mutex<tokio::net::TcpStream>,
    remote_label: String,
}

impl TcpLink {
    /// Wrap an already-connected TCP stream.
    #[must_use]
    pub fn new(stream: tokio::net::TcpStream, remote_label: String) -> Self {
        Self {
            stream: tokio::sync::Mutex::new(stream),
            remote_label,
        }
    }
}

#[async_trait]
impl Link for TcpLink {
    async fn read_exact(&self, buf: &mut [u8]) -> Result<(), LinkError> {
        use tokio::io::AsyncReadExt;
        let mut stream = self.stream.lock().await;
        match stream.read_exact(buf).await {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(LinkError::Closed),
            Err(e) => Err(LinkError::Io(e)),
        }
    }

    async fn write_all(&self, buf: &[u8]) -> Result<(), LinkError> {
        use tokio::io::AsyncWriteExt;
        let mut stream = self.stream.lock().await;
        stream.write_all(buf).await.map_err(LinkError::Io)
    }

    async fn close(&self) -> Result<(), LinkError> {
        use tokio::io::AsyncWriteExt;
        let mut stream = self.stream.lock().await;
        let _ = stream.shutdown().await;
        Ok(())
    }

    fn remote_label(&self) -> String {
        self.remote_label.clone()
    }
}

/// Dials [`TcpLink`]s, treating `address` as a `host:port` pair.
pub struct TcpConnector;

#[async_trait]
impl LinkConnector for TcpConnector {
    async fn connect(&self, address: &str) -> Result<Arc<dyn Link>, LinkError> {
        let stream = tokio::net::TcpStream::connect(address).await?;
        Ok(Arc::new(TcpLink::new(stream, address.to_string())))
    }
}
