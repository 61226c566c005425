//! Store-and-forward (C9): per-destination encrypted queues, persisted as
//! append-only JSONL files, flushed when the destination is next observed
//! online (`spec.md` §4.9).

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::QueueError;

/// `spec.md` §6 constants governing the queue.
pub const MAX_ENTRIES_PER_PEER: usize = 100;
pub const QUEUE_EXPIRY: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// One pending queue entry (`spec.md` §3): a message awaiting delivery to
/// an offline destination.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct PendingEntry {
    message_id: Uuid,
    timestamp: u64,
    destination_fingerprint: String,
    encrypted_payload_base64: String,
    expiry: u64,
}

impl PendingEntry {
    fn new(destination_fingerprint: &str, encrypted_payload: &[u8]) -> Self {
        let timestamp = now_unix_secs();
        Self {
            message_id: Uuid::new_v4(),
            timestamp,
            destination_fingerprint: destination_fingerprint.to_string(),
            encrypted_payload_base64: base64::Engine::encode(
                &base64::engine::general_purpose::STANDARD,
                encrypted_payload,
            ),
            expiry: timestamp + QUEUE_EXPIRY.as_secs(),
        }
    }

    fn is_expired(&self, now: u64) -> bool {
        self.expiry < now
    }

    fn decode_payload(&self) -> Result<Vec<u8>, QueueError> {
        base64::Engine::decode(&base64::engine::general_purpose::STANDARD, &self.encrypted_payload_base64)
            .map_err(|e| QueueError::Malformed(serde_json::Error::io(std::io::Error::new(std::io::ErrorKind::InvalidData, e))))
    }
}

fn now_unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Per-destination append-only JSONL queue store, rooted at a `pending/`
/// directory.
pub struct StoreAndForward {
    root: PathBuf,
}

impl StoreAndForward {
    /// Use `root` as the `pending/` directory. It is created on first
    /// write if missing.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn queue_path(&self, destination_fingerprint: &str) -> PathBuf {
        self.root.join(format!("{destination_fingerprint}.jsonl"))
    }

    fn read_entries(path: &Path) -> Result<Vec<PendingEntry>, QueueError> {
        match fs::read_to_string(path) {
            Ok(contents) => contents
                .lines()
                .filter(|line| !line.trim().is_empty())
                .map(|line| serde_json::from_str(line).map_err(QueueError::Malformed))
                .collect(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(QueueError::Io(e)),
        }
    }

    fn write_entries(path: &Path, entries: &[PendingEntry]) -> Result<(), QueueError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut contents = String::new();
        for entry in entries {
            contents.push_str(&serde_json::to_string(entry).map_err(QueueError::Malformed)?);
            contents.push('\n');
        }
        fs::write(path, contents)?;
        Ok(())
    }

    /// Append a pending record for `destination_fingerprint`. When the
    /// queue reaches [`MAX_ENTRIES_PER_PEER`], the oldest (head) records
    /// are discarded so at most that many remain.
    pub fn queue(&self, destination_fingerprint: &str, encrypted_payload: &[u8]) -> Result<(), QueueError> {
        let path = self.queue_path(destination_fingerprint);
        let mut entries = Self::read_entries(&path)?;
        entries.push(PendingEntry::new(destination_fingerprint, encrypted_payload));
        if entries.len() > MAX_ENTRIES_PER_PEER {
            let overflow = entries.len() - MAX_ENTRIES_PER_PEER;
            entries.drain(0..overflow);
        }
        Self::write_entries(&path, &entries)
    }

    /// Read all records for `destination_fingerprint`, dropping any past
    /// their expiry, return the remaining decoded payloads in insertion
    /// order, then delete the queue file.
    pub fn flush(&self, destination_fingerprint: &str) -> Result<Vec<Vec<u8>>, QueueError> {
        let path = self.queue_path(destination_fingerprint);
        let entries = Self::read_entries(&path)?;
        let now = now_unix_secs();

        let payloads = entries
            .iter()
            .filter(|e| !e.is_expired(now))
            .map(PendingEntry::decode_payload)
            .collect::<Result<Vec<_>, _>>()?;

        match fs::remove_file(&path) {
            Ok(()) | Err(_) => {}
        }

        Ok(payloads)
    }
}
