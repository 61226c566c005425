//! BLE GATT MTU chunking (`spec.md` §6): large frames are split into
//! characteristic-sized writes on the packet-oriented transport, each
//! carrying a small reassembly header.
//!
//! Chunk header: `msgId(4 big-endian) | index(2 big-endian) | total(2
//! big-endian) | data`.

use std::collections::HashMap;

const HEADER_LEN: usize = 8;

/// Split `payload` into chunks no larger than `mtu` bytes each, including
/// the header. `msg_id` identifies the message being split so the
/// receiver can reassemble interleaved messages from different senders.
///
/// # Panics
///
/// Panics if `mtu <= HEADER_LEN` or `payload` would require more than
/// `u16::MAX` chunks.
#[must_use]
pub fn chunk(mtu: usize, msg_id: u32, payload: &[u8]) -> Vec<Vec<u8>> {
    assert!(mtu > HEADER_LEN, "mtu must exceed the chunk header size");
    let data_cap = mtu - HEADER_LEN;
    let total = payload.len().div_ceil(data_cap.max(1)).max(1);
    assert!(total <= usize::from(u16::MAX), "payload needs too many chunks");

    payload
        .chunks(data_cap)
        .enumerate()
        .map(|(index, data)| {
            let mut out = Vec::with_capacity(HEADER_LEN + data.len());
            out.extend_from_slice(&msg_id.to_be_bytes());
            out.extend_from_slice(&(index as u16).to_be_bytes());
            out.extend_from_slice(&(total as u16).to_be_bytes());
            out.extend_from_slice(data);
            out
        })
        .collect()
}

/// Error returned by [`Reassembler::push`] for a malformed chunk.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ChunkError {
    /// The chunk is shorter than the fixed header.
    #[error("chunk shorter than the {HEADER_LEN}-byte header")]
    TooShort,
}

struct Pending {
    total: u16,
    parts: HashMap<u16, Vec<u8>>,
}

/// Reassembles chunks produced by [`chunk`], tracking multiple in-flight
/// `msgId`s concurrently.
#[derive(Default)]
pub struct Reassembler {
    pending: HashMap<u32, Pending>,
}

impl Reassembler {
    /// Build an empty reassembler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk. Returns the fully reassembled payload once every
    /// chunk for its `msgId` has arrived, in order; otherwise `None`.
    pub fn push(&mut self, raw: &[u8]) -> Result<Option<Vec<u8>>, ChunkError> {
        if raw.len() < HEADER_LEN {
            return Err(ChunkError::TooShort);
        }
        let msg_id = u32::from_be_bytes(raw[0..4].try_into().unwrap());
        let index = u16::from_be_bytes(raw[4..6].try_into().unwrap());
        let total = u16::from_be_bytes(raw[6..8].try_into().unwrap());
        let data = raw[HEADER_LEN..].to_vec();

        let entry = self.pending.entry(msg_id).or_insert_with(|| Pending {
            total,
            parts: HashMap::new(),
        });
        entry.parts.insert(index, data);

        if entry.parts.len() < usize::from(entry.total) {
            return Ok(None);
        }

        let pending = self.pending.remove(&msg_id).expect("just inserted");
        let mut assembled = Vec::new();
        for i in 0..pending.total {
            match pending.parts.get(&i) {
                Some(part) => assembled.extend_from_slice(part),
                None => return Ok(None),
            }
        }
        Ok(Some(assembled))
    }
}
