//! Packet codec: v1 (26-byte header) and v2 (93-byte header) wire framing,
//! the v2 metadata prefix, LZ4 payload compression, and CRC-32 integrity.
//!
//! `serialize` LZ4-compresses a v2 payload when doing so is worth
//! attempting and actually shrinks it, setting [`FLAG_COMPRESSED`]
//! accordingly; `parse` reverses this after stripping the metadata prefix.
//! v1 has no flags byte and is never compressed.

use crate::error::CodecError;
use meshit_crypto::crc32::crc32;
use meshit_crypto::lz4::{lz4_compress, lz4_decompress, should_attempt_compression};
use serde::{Deserialize, Serialize};

/// Minimum length of a v1 frame (22-byte header + 4-byte CRC, empty payload).
pub const V1_HEADER_LEN: usize = 26;
/// Minimum length of a v2 frame (89-byte header + 4-byte CRC, empty payload).
pub const V2_HEADER_LEN: usize = 93;

/// bit0 of the v2 `flags` byte: payload is LZ4-compressed.
pub const FLAG_COMPRESSED: u8 = 0b0000_0001;

/// The all-zero destination public key marking a broadcast packet.
pub const BROADCAST_DESTINATION: [u8; 32] = [0u8; 32];

/// Wire packet-type tag, stable byte values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    TextMessage = 0x01,
    FileMetadata = 0x02,
    FileChunk = 0x03,
    Ack = 0x04,
    NoiseMsg1 = 0x10,
    NoiseMsg2 = 0x11,
    NoiseMsg3 = 0x12,
    RoutedMessage = 0x20,
    ChannelMessage = 0x21,
    ChannelJoin = 0x22,
    ChannelLeave = 0x23,
    RouteDiscovery = 0x24,
    RouteReply = 0x25,
    ChannelAnnounce = 0x26,
    PeerAnnouncement = 0x30,
}

impl TryFrom<u8> for PacketType {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0x01 => Self::TextMessage,
            0x02 => Self::FileMetadata,
            0x03 => Self::FileChunk,
            0x04 => Self::Ack,
            0x10 => Self::NoiseMsg1,
            0x11 => Self::NoiseMsg2,
            0x12 => Self::NoiseMsg3,
            0x20 => Self::RoutedMessage,
            0x21 => Self::ChannelMessage,
            0x22 => Self::ChannelJoin,
            0x23 => Self::ChannelLeave,
            0x24 => Self::RouteDiscovery,
            0x25 => Self::RouteReply,
            0x26 => Self::ChannelAnnounce,
            0x30 => Self::PeerAnnouncement,
            other => return Err(CodecError::InvalidPacketType(other)),
        })
    }
}

/// The v2 metadata prefix carried ahead of the real payload:
/// `{"routeHistory": [fp, ...], "channelName": "..."}`.
#[derive(Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
struct RouteMeta {
    #[serde(rename = "routeHistory", default, skip_serializing_if = "Vec::is_empty")]
    route_history: Vec<String>,
    #[serde(rename = "channelName", default, skip_serializing_if = "Option::is_none")]
    channel_name: Option<String>,
}

/// A parsed or to-be-serialized packet. v2-only fields are zeroed/empty on
/// a v1 packet; `serialize` omits them from the wire form accordingly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub version: u8,
    pub packet_type: PacketType,
    pub seq_num: u32,
    pub sender_id: [u8; 16],
    pub originator_pub: [u8; 32],
    pub destination_pub: [u8; 32],
    pub hop_count: u8,
    pub flags: u8,
    pub ttl: u8,
    pub route_history: Vec<String>,
    pub channel_name: Option<String>,
    pub payload: Vec<u8>,
}

fn fit_bytes<const N: usize>(src: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    let n = src.len().min(N);
    out[..n].copy_from_slice(&src[..n]);
    out
}

/// The first 16 bytes of a 32-byte originator public key, used as `senderId`
/// on v2 packets.
#[must_use]
pub fn sender_id_from_pub(pub_key: &[u8; 32]) -> [u8; 16] {
    fit_bytes(&pub_key[..16])
}

impl Packet {
    /// Build a v1 packet. `sender_id` is zero-padded or truncated to 16 bytes.
    #[must_use]
    pub fn new_v1(packet_type: PacketType, seq_num: u32, sender_id: &[u8], payload: Vec<u8>) -> Self {
        Self {
            version: 1,
            packet_type,
            seq_num,
            sender_id: fit_bytes(sender_id),
            originator_pub: [0u8; 32],
            destination_pub: [0u8; 32],
            hop_count: 0,
            flags: 0,
            ttl: 0,
            route_history: Vec::new(),
            channel_name: None,
            payload,
        }
    }

    /// Build a v2 packet. `senderId` is derived from `originator_pub`.
    #[must_use]
    pub fn new_v2(
        packet_type: PacketType,
        seq_num: u32,
        originator_pub: [u8; 32],
        destination_pub: [u8; 32],
        hop_count: u8,
        ttl: u8,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            version: 2,
            packet_type,
            seq_num,
            sender_id: sender_id_from_pub(&originator_pub),
            originator_pub,
            destination_pub,
            hop_count,
            flags: 0,
            ttl,
            route_history: Vec::new(),
            channel_name: None,
            payload,
        }
    }

    #[must_use]
    pub fn with_route_history(mut self, route_history: Vec<String>) -> Self {
        self.route_history = route_history;
        self
    }

    #[must_use]
    pub fn with_channel_name(mut self, channel_name: String) -> Self {
        self.channel_name = Some(channel_name);
        self
    }

    /// A v2 packet whose destination public key is all zeros.
    #[must_use]
    pub fn is_broadcast(&self) -> bool {
        self.destination_pub == BROADCAST_DESTINATION
    }

    #[must_use]
    pub fn is_compressed(&self) -> bool {
        self.flags & FLAG_COMPRESSED != 0
    }

    /// True when `destination_pub` matches `local_static_pub` byte-for-byte.
    #[must_use]
    pub fn is_for(&self, local_static_pub: &[u8; 32]) -> bool {
        &self.destination_pub == local_static_pub
    }

    /// Serialize to the wire form for this packet's `version`, appending
    /// the trailing CRC-32 over every preceding byte. On a v2 packet, the
    /// payload is LZ4-compressed first when that's worth attempting and
    /// actually shrinks it, with [`FLAG_COMPRESSED`] set to match.
    #[must_use]
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.push(self.version);
        buf.push(self.packet_type as u8);
        buf.extend_from_slice(&self.seq_num.to_be_bytes());
        buf.extend_from_slice(&self.sender_id);

        if self.version >= 2 {
            let (payload, compressed) = self.maybe_compress_payload();
            let mut flags = self.flags;
            if compressed {
                flags |= FLAG_COMPRESSED;
            } else {
                flags &= !FLAG_COMPRESSED;
            }
            buf.extend_from_slice(&self.originator_pub);
            buf.extend_from_slice(&self.destination_pub);
            buf.push(self.hop_count);
            buf.push(flags);
            buf.push(self.ttl);
            buf.extend_from_slice(&self.combined_payload(&payload));
        } else {
            buf.extend_from_slice(&self.combined_payload(&self.payload));
        }

        let crc = crc32(&buf);
        buf.extend_from_slice(&crc.to_be_bytes());
        buf
    }

    /// LZ4-compress the payload if it's long enough to be worth trying and
    /// compression actually shrinks it; otherwise return it unchanged.
    fn maybe_compress_payload(&self) -> (Vec<u8>, bool) {
        if should_attempt_compression(self.payload.len()) {
            let compressed = lz4_compress(&self.payload);
            if compressed.len() < self.payload.len() {
                return (compressed, true);
            }
        }
        (self.payload.clone(), false)
    }

    fn combined_payload(&self, payload: &[u8]) -> Vec<u8> {
        let has_metadata =
            self.version >= 2 && (!self.route_history.is_empty() || self.channel_name.is_some());
        if !has_metadata {
            return payload.to_vec();
        }

        let meta = RouteMeta {
            route_history: self.route_history.clone(),
            channel_name: self.channel_name.clone(),
        };
        let meta_json = serde_json::to_vec(&meta).expect("RouteMeta always serializes");
        let mut out = Vec::with_capacity(4 + meta_json.len() + payload.len());
        out.extend_from_slice(&(meta_json.len() as i32).to_le_bytes());
        out.extend_from_slice(&meta_json);
        out.extend_from_slice(payload);
        out
    }

    /// Parse a wire frame, dispatching on the version byte.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::TooShort`] if `bytes` is smaller than the
    /// minimum header for its version, [`CodecError::UnsupportedVersion`]
    /// if the version byte is neither 1 nor 2, [`CodecError::CrcMismatch`]
    /// if the trailing CRC-32 does not match, [`CodecError::InvalidPacketType`]
    /// if the type byte is unrecognized, and [`CodecError::DecompressionFailed`]
    /// if the compressed-flag is set but the payload doesn't LZ4-decompress.
    pub fn parse(bytes: &[u8]) -> Result<Self, CodecError> {
        if bytes.len() < V1_HEADER_LEN {
            return Err(CodecError::TooShort {
                expected: V1_HEADER_LEN,
                actual: bytes.len(),
            });
        }
        match bytes[0] {
            1 => Self::parse_v1(bytes),
            2 => Self::parse_v2(bytes),
            other => Err(CodecError::UnsupportedVersion(other)),
        }
    }

    fn verify_crc(bytes: &[u8]) -> Result<(), CodecError> {
        let (body, trailer) = bytes.split_at(bytes.len() - 4);
        let expected = u32::from_be_bytes(trailer.try_into().expect("trailer is exactly 4 bytes"));
        if crc32(body) != expected {
            return Err(CodecError::CrcMismatch);
        }
        Ok(())
    }

    fn parse_v1(bytes: &[u8]) -> Result<Self, CodecError> {
        if bytes.len() < V1_HEADER_LEN {
            return Err(CodecError::TooShort {
                expected: V1_HEADER_LEN,
                actual: bytes.len(),
            });
        }
        Self::verify_crc(bytes)?;

        let packet_type = PacketType::try_from(bytes[1])?;
        let seq_num = u32::from_be_bytes(bytes[2..6].try_into().unwrap());
        let mut sender_id = [0u8; 16];
        sender_id.copy_from_slice(&bytes[6..22]);
        let payload = bytes[22..bytes.len() - 4].to_vec();

        Ok(Self {
            version: 1,
            packet_type,
            seq_num,
            sender_id,
            originator_pub: [0u8; 32],
            destination_pub: [0u8; 32],
            hop_count: 0,
            flags: 0,
            ttl: 0,
            route_history: Vec::new(),
            channel_name: None,
            payload,
        })
    }

    fn parse_v2(bytes: &[u8]) -> Result<Self, CodecError> {
        if bytes.len() < V2_HEADER_LEN {
            return Err(CodecError::TooShort {
                expected: V2_HEADER_LEN,
                actual: bytes.len(),
            });
        }
        Self::verify_crc(bytes)?;

        let packet_type = PacketType::try_from(bytes[1])?;
        let seq_num = u32::from_be_bytes(bytes[2..6].try_into().unwrap());
        let mut sender_id = [0u8; 16];
        sender_id.copy_from_slice(&bytes[6..22]);
        let mut originator_pub = [0u8; 32];
        originator_pub.copy_from_slice(&bytes[22..54]);
        let mut destination_pub = [0u8; 32];
        destination_pub.copy_from_slice(&bytes[54..86]);
        let hop_count = bytes[86];
        let flags = bytes[87];
        let ttl = bytes[88];
        let raw_payload = &bytes[89..bytes.len() - 4];

        let (route_history, channel_name, payload) = Self::strip_metadata(raw_payload);
        let payload = if flags & FLAG_COMPRESSED != 0 {
            lz4_decompress(&payload).map_err(|_| CodecError::DecompressionFailed)?
        } else {
            payload
        };

        Ok(Self {
            version: 2,
            packet_type,
            seq_num,
            sender_id,
            originator_pub,
            destination_pub,
            hop_count,
            flags,
            ttl,
            route_history,
            channel_name,
            payload,
        })
    }

    /// Strip a leading metadata block from `raw`, if one is present and
    /// well-formed. A malformed or absent metadata block is not fatal: the
    /// payload is returned unmodified.
    fn strip_metadata(raw: &[u8]) -> (Vec<String>, Option<String>, Vec<u8>) {
        if raw.len() >= 4 {
            let meta_len = i32::from_le_bytes(raw[0..4].try_into().unwrap());
            if meta_len >= 0 {
                let meta_len = meta_len as usize;
                if 4 + meta_len <= raw.len() {
                    if let Ok(meta) = serde_json::from_slice::<RouteMeta>(&raw[4..4 + meta_len]) {
                        return (
                            meta.route_history,
                            meta.channel_name,
                            raw[4 + meta_len..].to_vec(),
                        );
                    }
                }
            }
        }
        (Vec::new(), None, raw.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v1_roundtrip() {
        let packet = Packet::new_v1(PacketType::TextMessage, 42, &[0xAA; 16], b"hello".to_vec());
        let bytes = packet.serialize();
        assert_eq!(bytes.len(), V1_HEADER_LEN + 5);
        let parsed = Packet::parse(&bytes).unwrap();
        assert_eq!(parsed, packet);
    }

    #[test]
    fn v1_empty_payload_roundtrip() {
        let packet = Packet::new_v1(PacketType::Ack, 0, &[0u8; 16], Vec::new());
        let bytes = packet.serialize();
        assert_eq!(bytes.len(), V1_HEADER_LEN);
        assert_eq!(Packet::parse(&bytes).unwrap(), packet);
    }

    // Scenario S1 from the testable-properties table: a v2 channel-message
    // with both routeHistory and channelName set.
    #[test]
    fn s1_v2_with_metadata_roundtrip() {
        let packet = Packet::new_v2(
            PacketType::ChannelMessage,
            0x0102_0304,
            [0xBB; 32],
            [0x00; 32],
            2,
            5,
            b"hi".to_vec(),
        )
        .with_route_history(vec!["ab".to_string(), "cd".to_string()])
        .with_channel_name("#general".to_string());

        let mut expected_sender_id = [0u8; 16];
        expected_sender_id.copy_from_slice(&[0xBB; 16]);
        assert_eq!(packet.sender_id, expected_sender_id);

        let bytes = packet.serialize();
        let parsed = Packet::parse(&bytes).unwrap();
        assert_eq!(parsed, packet);
        assert_eq!(parsed.hop_count, 2);
        assert_eq!(parsed.ttl, 5);
        assert_eq!(parsed.route_history, vec!["ab", "cd"]);
        assert_eq!(parsed.channel_name.as_deref(), Some("#general"));
    }

    #[test]
    fn v2_without_metadata_has_no_prefix() {
        let packet = Packet::new_v2(
            PacketType::RoutedMessage,
            1,
            [0x01; 32],
            BROADCAST_DESTINATION,
            0,
            7,
            b"payload".to_vec(),
        );
        let bytes = packet.serialize();
        assert_eq!(bytes.len(), V2_HEADER_LEN + "payload".len());
        let parsed = Packet::parse(&bytes).unwrap();
        assert_eq!(parsed.payload, b"payload");
        assert!(parsed.route_history.is_empty());
        assert!(parsed.channel_name.is_none());
    }

    #[test]
    fn broadcast_destination_is_detected() {
        let packet = Packet::new_v2(
            PacketType::RouteDiscovery,
            0,
            [0x01; 32],
            BROADCAST_DESTINATION,
            0,
            7,
            Vec::new(),
        );
        assert!(packet.is_broadcast());
    }

    #[test]
    fn crc_sensitivity_any_bit_flip_fails_parse() {
        let packet = Packet::new_v1(PacketType::TextMessage, 7, &[0x03; 16], b"hello world".to_vec());
        let bytes = packet.serialize();
        for bit_index in 0..(bytes.len() - 4) * 8 {
            let mut corrupted = bytes.clone();
            corrupted[bit_index / 8] ^= 1 << (bit_index % 8);
            assert!(
                Packet::parse(&corrupted).is_err(),
                "bit {bit_index} flip was not detected"
            );
        }
    }

    #[test]
    fn unsupported_version_is_rejected() {
        let mut bytes = Packet::new_v1(PacketType::Ack, 0, &[0u8; 16], Vec::new()).serialize();
        bytes[0] = 3;
        let crc = crc32(&bytes[..bytes.len() - 4]);
        bytes[bytes.len() - 4..].copy_from_slice(&crc.to_be_bytes());
        assert!(matches!(
            Packet::parse(&bytes),
            Err(CodecError::UnsupportedVersion(3))
        ));
    }

    #[test]
    fn invalid_packet_type_is_rejected() {
        let mut bytes = Packet::new_v1(PacketType::Ack, 0, &[0u8; 16], Vec::new()).serialize();
        bytes[1] = 0x99;
        let crc = crc32(&bytes[..bytes.len() - 4]);
        bytes[bytes.len() - 4..].copy_from_slice(&crc.to_be_bytes());
        assert!(matches!(
            Packet::parse(&bytes),
            Err(CodecError::InvalidPacketType(0x99))
        ));
    }

    #[test]
    fn malformed_metadata_block_is_not_fatal() {
        // metaLen claims 4 bytes of JSON, but the bytes are garbage.
        let mut raw_payload = Vec::new();
        raw_payload.extend_from_slice(&4i32.to_le_bytes());
        raw_payload.extend_from_slice(b"nope");
        raw_payload.extend_from_slice(b"rest");

        let packet = Packet::new_v2(
            PacketType::RoutedMessage,
            1,
            [0x01; 32],
            BROADCAST_DESTINATION,
            0,
            7,
            raw_payload.clone(),
        );
        let bytes = packet.serialize();
        let parsed = Packet::parse(&bytes).unwrap();
        assert_eq!(parsed.payload, raw_payload);
        assert!(parsed.route_history.is_empty());
    }

    #[test]
    fn sender_id_is_first_16_bytes_of_originator() {
        let mut originator = [0u8; 32];
        for (i, b) in originator.iter_mut().enumerate() {
            *b = i as u8;
        }
        let sender_id = sender_id_from_pub(&originator);
        assert_eq!(sender_id, originator[..16]);
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn prop_parse_never_panics(data in prop::collection::vec(any::<u8>(), 0..512)) {
                let _ = Packet::parse(&data);
            }

            #[test]
            fn prop_v1_roundtrip(
                seq_num in any::<u32>(),
                sender_id in prop::collection::vec(any::<u8>(), 16),
                payload in prop::collection::vec(any::<u8>(), 0..256),
            ) {
                let packet = Packet::new_v1(PacketType::TextMessage, seq_num, &sender_id, payload.clone());
                let bytes = packet.serialize();
                let parsed = Packet::parse(&bytes).unwrap();
                prop_assert_eq!(parsed.seq_num, seq_num);
                prop_assert_eq!(parsed.payload, payload);
            }

            #[test]
            fn prop_v2_roundtrip(
                seq_num in any::<u32>(),
                hop_count in any::<u8>(),
                ttl in 0u8..=7,
                payload in prop::collection::vec(any::<u8>(), 0..256),
            ) {
                let packet = Packet::new_v2(
                    PacketType::RoutedMessage,
                    seq_num,
                    [0x42; 32],
                    BROADCAST_DESTINATION,
                    hop_count,
                    ttl,
                    payload.clone(),
                );
                let bytes = packet.serialize();
                let parsed = Packet::parse(&bytes).unwrap();
                prop_assert_eq!(parsed.hop_count, hop_count);
                prop_assert_eq!(parsed.ttl, ttl);
                prop_assert_eq!(parsed.payload, payload);
            }
        }
    }
}
