use crate::TransferManifest;
use crate::error::{DecodeError, TransferError};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::constants::MAX_CONTROL_MSG_SIZE;

/// A single message as carried by the transport.
///
/// Control messages travel as text, chunk payloads as binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    Text(String),
    Binary(Bytes),
}

impl WireMessage {
    pub fn len(&self) -> usize {
        match self {
            WireMessage::Text(text) => text.len(),
            WireMessage::Binary(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            WireMessage::Text(text) => text.as_bytes(),
            WireMessage::Binary(bytes) => bytes,
        }
    }

    pub fn into_bytes(self) -> Bytes {
        match self {
            WireMessage::Text(text) => Bytes::from(text.into_bytes()),
            WireMessage::Binary(bytes) => bytes,
        }
    }
}

/// Header announcing a file body. Carries the digest computed before transmission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStart {
    pub file_id: u32,
    pub name: String,
    pub size: u64,
    pub media_type: String,
    #[serde(default)]
    pub digest: String,
}

/// Chunk header. Exactly `length` payload bytes follow as the next message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkHeader {
    pub file_id: u32,
    pub offset: u64,
    pub length: u32,
}

impl ChunkHeader {
    /// Offset one past the last byte, `None` on overflow
    pub fn end(&self) -> Option<u64> {
        self.offset.checked_add(self.length as u64)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEnd {
    pub file_id: u32,
    #[serde(default)]
    pub digest: String,
}

/// Cancellation notice. `file_id: None` cancels the whole session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelNotice {
    pub file_id: Option<u32>,
    #[serde(default)]
    pub reason: String,
}

/// Control messages, tagged by `type` on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ControlMessage {
    Manifest(TransferManifest),
    FileStart(FileStart),
    Chunk(ChunkHeader),
    FileEnd(FileEnd),
    Complete,
    Cancel(CancelNotice),
}

impl ControlMessage {
    pub fn type_name(&self) -> &'static str {
        match self {
            ControlMessage::Manifest(_) => "manifest",
            ControlMessage::FileStart(_) => "file-start",
            ControlMessage::Chunk(_) => "chunk",
            ControlMessage::FileEnd(_) => "file-end",
            ControlMessage::Complete => "complete",
            ControlMessage::Cancel(_) => "cancel",
        }
    }
}

/// Serialize a control message to its JSON text form
pub fn encode_control(msg: &ControlMessage) -> Result<String, TransferError> {
    Ok(serde_json::to_string(msg)?)
}

/// Parse a control message. Never panics on hostile input.
pub fn decode_control(bytes: &[u8]) -> Result<ControlMessage, DecodeError> {
    if bytes.len() > MAX_CONTROL_MSG_SIZE {
        return Err(DecodeError::new(
            &bytes[..64],
            format!(
                "message too large ({} bytes, max {})",
                bytes.len(),
                MAX_CONTROL_MSG_SIZE
            ),
        ));
    }
    serde_json::from_slice(bytes).map_err(|e| DecodeError::new(bytes, e.to_string()))
}
