//! Error types shared by the transfer engines and the pairing codec.

use std::fmt;
use thiserror::Error;

/// Coarse classification of a failure, carried by terminal events and file states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    Decode,
    ChunkLengthMismatch,
    IntegrityCheckFailed,
    ProtocolViolation,
    Storage,
    TransportClosed,
    Cancelled,
    Io,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureKind::Decode => "decode error",
            FailureKind::ChunkLengthMismatch => "chunk length mismatch",
            FailureKind::IntegrityCheckFailed => "integrity check failed",
            FailureKind::ProtocolViolation => "protocol violation",
            FailureKind::Storage => "storage error",
            FailureKind::TransportClosed => "transport closed",
            FailureKind::Cancelled => "cancelled",
            FailureKind::Io => "I/O error",
        };
        f.write_str(name)
    }
}

/// A control message that could not be parsed.
///
/// Keeps the raw bytes so the offending frame can be logged.
#[derive(Debug, Clone, Error)]
#[error("malformed control message ({reason}): {}", preview(.raw))]
pub struct DecodeError {
    pub raw: Vec<u8>,
    pub reason: String,
}

impl DecodeError {
    pub fn new(raw: &[u8], reason: impl Into<String>) -> Self {
        Self {
            raw: raw.to_vec(),
            reason: reason.into(),
        }
    }
}

fn preview(raw: &[u8]) -> String {
    const LIMIT: usize = 64;
    let text = String::from_utf8_lossy(&raw[..raw.len().min(LIMIT)]);
    if raw.len() > LIMIT {
        format!("{}... ({} bytes)", text, raw.len())
    } else {
        text.into_owned()
    }
}

/// Errors raised by a message transport.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("transport is closed")]
    Closed,
    #[error("transport failure: {0}")]
    Failed(String),
}

/// Errors raised by a storage sink.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("file {0} was not declared in the prepared manifest")]
    UnknownFile(u32),
    #[error("storage has not been prepared")]
    NotPrepared,
}

/// Errors surfaced by the sender and receiver engines.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("transport closed")]
    TransportClosed,

    #[error("transport error: {0}")]
    Transport(String),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("failed to encode control message: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("chunk length mismatch for file {file_id}: header declared {expected} bytes, got {actual}")]
    ChunkLengthMismatch {
        file_id: u32,
        expected: u32,
        actual: usize,
    },

    #[error("integrity check failed for file {file_id}: expected {expected}, computed {actual}")]
    IntegrityCheckFailed {
        file_id: u32,
        expected: String,
        actual: String,
    },

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transfer cancelled")]
    Cancelled,

    #[error("invalid batch: {0}")]
    InvalidBatch(String),

    #[error("no active transfer session")]
    NoActiveSession,
}

impl TransferError {
    pub fn kind(&self) -> FailureKind {
        match self {
            TransferError::TransportClosed | TransferError::Transport(_) => {
                FailureKind::TransportClosed
            }
            TransferError::Decode(_) | TransferError::Encode(_) => FailureKind::Decode,
            TransferError::ChunkLengthMismatch { .. } => FailureKind::ChunkLengthMismatch,
            TransferError::IntegrityCheckFailed { .. } => FailureKind::IntegrityCheckFailed,
            TransferError::ProtocolViolation(_)
            | TransferError::InvalidBatch(_)
            | TransferError::NoActiveSession => FailureKind::ProtocolViolation,
            TransferError::Storage(_) => FailureKind::Storage,
            TransferError::Io(_) => FailureKind::Io,
            TransferError::Cancelled => FailureKind::Cancelled,
        }
    }

    /// File this error is about, when it concerns a single file.
    pub fn file_id(&self) -> Option<u32> {
        match self {
            TransferError::ChunkLengthMismatch { file_id, .. }
            | TransferError::IntegrityCheckFailed { file_id, .. } => Some(*file_id),
            TransferError::Storage(StorageError::UnknownFile(id)) => Some(*id),
            _ => None,
        }
    }
}

impl From<TransportError> for TransferError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Closed => TransferError::TransportClosed,
            TransportError::Failed(msg) => TransferError::Transport(msg),
        }
    }
}

/// Errors from the pairing token codec.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignalingError {
    #[error("malformed pairing token: {0}")]
    Malformed(String),

    #[error("pairing token expired ({age_secs}s old, valid for {validity_secs}s)")]
    Expired { age_secs: u64, validity_secs: u64 },

    #[error("pairing token uses {0} compression, which is not available")]
    UnsupportedCompression(String),

    #[error("failed to encode pairing payload: {0}")]
    Encode(String),

    #[error("pairing token does not fit in a QR code: {0}")]
    QrCode(String),
}
