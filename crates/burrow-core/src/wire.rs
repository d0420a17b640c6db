//! Burrow wire format — framing and channel envelopes.
//!
//! The transport underneath us is an authenticated, ordered, encrypted byte
//! stream between two peers. Everything sent over it is a packet:
//!
//!   [length: u16 BE][channel: u16 BE][payload ...]
//!
//! `length` covers the whole packet including the 4-byte header. Channel 0 is
//! the control channel; every other channel id names a logical channel opened
//! through it. Payloads are JSON envelopes, one enum per channel type.
//!
//! These types ARE the protocol. Field names and tags are part of the wire
//! format and must not change without a protocol bump.

use bytes::{BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use static_assertions::assert_eq_size;
use zerocopy::byteorder::network_endian::U16;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

// ── Identifiers ───────────────────────────────────────────────────────────────

pub type ChannelId = u16;
pub type MessageId = u32;
pub type FileId = u32;
pub type ChunkId = u32;

/// BLAKE3-256 digest of a chunk or a whole file.
pub type ContentHash = [u8; 32];

// ── Constants ─────────────────────────────────────────────────────────────────

/// Channel id reserved for channel control packets.
pub const CONTROL_CHANNEL: ChannelId = 0;

/// Size of the packet header preceding every payload.
pub const PACKET_HEADER_SIZE: usize = 4;

/// Largest packet the 16-bit length field can describe.
pub const MAX_PACKET_SIZE: usize = u16::MAX as usize;

/// Largest payload that fits in a single packet.
pub const MAX_PAYLOAD: usize = MAX_PACKET_SIZE - PACKET_HEADER_SIZE;

/// Bytes of file data carried by one FileChunk. Also the receiver maximum.
pub const FILE_CHUNK_SIZE: usize = 2000;

/// Read buffer used when hashing whole files.
pub const HASH_BUFFER_SIZE: usize = 4096;

/// Longest chat message the receiver will accept, in characters.
pub const MAX_MESSAGE_CHARS: usize = 2000;

pub const CHAT_PROTOCOL: &str = "im.burrow.chat";
pub const FILE_PROTOCOL: &str = "im.burrow.file-transfer";

/// Number of FILE_CHUNK_SIZE chunks needed to carry `size` bytes.
pub fn chunk_count_for(size: u64) -> u64 {
    size.div_ceil(FILE_CHUNK_SIZE as u64)
}

// ── Packet header ─────────────────────────────────────────────────────────────

/// Fixed header in front of every packet on the transport.
///
/// Wire size: 4 bytes, both fields big-endian.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct PacketHeader {
    /// Total packet length including this header.
    pub length: U16,
    /// Logical channel the payload belongs to.
    pub channel: U16,
}

assert_eq_size!(PacketHeader, [u8; PACKET_HEADER_SIZE]);

/// One packet: a payload addressed to a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub channel: ChannelId,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(channel: ChannelId, payload: impl Into<Bytes>) -> Self {
        Self {
            channel,
            payload: payload.into(),
        }
    }

    /// Serialize header + payload into a single buffer.
    pub fn encode(&self) -> Result<Bytes, WireError> {
        if self.payload.len() > MAX_PAYLOAD {
            return Err(WireError::PacketTooLarge(self.payload.len()));
        }
        let header = PacketHeader {
            length: U16::new((self.payload.len() + PACKET_HEADER_SIZE) as u16),
            channel: U16::new(self.channel),
        };
        let mut buf = BytesMut::with_capacity(PACKET_HEADER_SIZE + self.payload.len());
        buf.put_slice(header.as_bytes());
        buf.put_slice(&self.payload);
        Ok(buf.freeze())
    }

    /// Parse one packet from the front of `buf`.
    ///
    /// Returns `Ok(None)` when `buf` does not yet hold a complete packet, and
    /// the number of bytes consumed otherwise.
    pub fn decode(buf: &[u8]) -> Result<Option<(Frame, usize)>, WireError> {
        let header = match PacketHeader::read_from_prefix(buf) {
            Some(h) => h,
            None => return Ok(None),
        };
        let length = header.length.get() as usize;
        if length < PACKET_HEADER_SIZE {
            return Err(WireError::BadLength(header.length.get()));
        }
        if buf.len() < length {
            return Ok(None);
        }
        let frame = Frame {
            channel: header.channel.get(),
            payload: Bytes::copy_from_slice(&buf[PACKET_HEADER_SIZE..length]),
        };
        Ok(Some((frame, length)))
    }
}

// ── Channel direction ─────────────────────────────────────────────────────────

/// Which side opened a channel, from the local point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Opened by the peer.
    Inbound,
    /// Opened by us.
    Outbound,
}

// ── Envelopes ─────────────────────────────────────────────────────────────────

/// JSON (de)serialization shared by all channel envelopes.
pub trait Envelope: Serialize + DeserializeOwned {
    fn to_bytes(&self) -> Result<Bytes, WireError> {
        let data = serde_json::to_vec(self).map_err(|e| WireError::Malformed(e.to_string()))?;
        if data.len() > MAX_PAYLOAD {
            return Err(WireError::PacketTooLarge(data.len()));
        }
        Ok(Bytes::from(data))
    }

    fn from_bytes(data: &[u8]) -> Result<Self, WireError> {
        serde_json::from_slice(data).map_err(|e| WireError::Malformed(e.to_string()))
    }
}

/// Packets carried on the control channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ControlPacket {
    OpenChannel(OpenChannel),
    ChannelResult(ChannelResult),
    CloseChannel(CloseChannel),
}

impl Envelope for ControlPacket {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenChannel {
    pub channel_id: ChannelId,
    /// Protocol name, e.g. [`CHAT_PROTOCOL`].
    pub protocol: String,
    /// Direction from the opener's side. Always `Outbound` from a sane peer.
    pub direction: Direction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelResult {
    pub channel_id: ChannelId,
    pub opened: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub common_error: Option<CommonError>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseChannel {
    pub channel_id: ChannelId,
}

/// Reason an open request was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommonError {
    Generic,
    UnknownType,
    Unauthorized,
    BadUsage,
    Failed,
}

/// Packets carried on a chat channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ChatPacket {
    ChatMessage(ChatMessage),
    ChatAck(ChatAck),
}

impl Envelope for ChatPacket {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub text: String,
    /// Unix timestamp in milliseconds, as stamped by the sender.
    pub timestamp: u64,
    pub id: MessageId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatAck {
    pub id: MessageId,
    pub accepted: bool,
}

/// Packets carried on a file-transfer channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum FilePacket {
    FileHeader(FileHeader),
    FileHeaderAck(FileHeaderAck),
    FileChunk(FileChunk),
    FileChunkAck(FileChunkAck),
}

impl Envelope for FilePacket {}

/// Announces a file. Every field except `name` is required for acceptance;
/// they are optional on the wire so the receiver can name what is missing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileHeader {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_id: Option<FileId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "hex_hash_opt")]
    pub content_hash: Option<ContentHash>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileHeaderAck {
    pub file_id: FileId,
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<HeaderRejectReason>,
}

/// Machine-readable reason attached to a refused FileHeader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeaderRejectReason {
    WrongDirection,
    MissingFileId,
    MissingSize,
    MissingChunkCount,
    MissingHash,
    InconsistentSize,
    TooLarge,
    StagingFailed,
    /// The receiver already tried this file and could not reassemble it.
    ReassemblyFailed,
    TooManyTransfers,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChunk {
    pub file_id: FileId,
    pub chunk_id: ChunkId,
    pub chunk_size: u32,
    #[serde(with = "hex_bytes")]
    pub chunk_data: Vec<u8>,
    #[serde(with = "hex_hash")]
    pub content_hash: ContentHash,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChunkAck {
    pub file_id: FileId,
    pub file_chunk_id: ChunkId,
    pub accepted: bool,
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("packet length field {0} is shorter than the header")]
    BadLength(u16),

    #[error("payload length {0} exceeds maximum {}", MAX_PAYLOAD)]
    PacketTooLarge(usize),

    #[error("malformed envelope: {0}")]
    Malformed(String),
}

// ── Hex helpers ───────────────────────────────────────────────────────────────

fn decode_hash<E: serde::de::Error>(s: &str) -> Result<ContentHash, E> {
    let bytes = hex::decode(s).map_err(E::custom)?;
    if bytes.len() != 32 {
        return Err(E::custom("expected 32 bytes"));
    }
    let mut arr = [0u8; 32];
    arr.copy_from_slice(&bytes);
    Ok(arr)
}

mod hex_hash {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<[u8; 32], D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        super::decode_hash(&s)
    }
}

mod hex_hash_opt {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &Option<[u8; 32]>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match bytes {
            Some(b) => serializer.serialize_some(&hex::encode(b)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<[u8; 32]>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<String>::deserialize(deserializer)? {
            Some(s) => super::decode_hash(&s).map(Some),
            None => Ok(None),
        }
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        hex::decode(&s).map_err(serde::de::Error::custom)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
