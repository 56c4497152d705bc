use serde::{Deserialize, Serialize};
use std::time::Instant;

pub mod adaptive;
pub mod config;
pub mod error;
pub mod events;
pub mod pairing;
pub mod transfer;

pub use adaptive::{ConfigHints, LinkQuality, MemoryClass, choose_config};
pub use config::{AppConfig, TransferConfig};
pub use error::{
    DecodeError, FailureKind, SignalingError, StorageError, TransferError, TransportError,
};
pub use events::{EventBus, EventKind, ListenerId, ProgressUpdate, TransferEvent};
pub use pairing::{PairingPayload, PairingRole, SignalingCodec};
pub use transfer::{ReceiverEngine, SenderEngine};

/// Version of the control message wire format.
pub const PROTOCOL_VERSION: u32 = 1;

/// One file declared by a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDescriptor {
    pub id: u32,
    pub name: String,
    pub size: u64,
    pub media_type: String,
    /// Unix timestamp in milliseconds
    pub modified_at: u64,
}

/// Batch-level declaration of every file in a transfer.
///
/// Built once by the sender before any file starts and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferManifest {
    #[serde(default = "default_protocol_version")]
    pub protocol_version: u32,
    #[serde(default)]
    pub session_id: String,
    pub files: Vec<FileDescriptor>,
    pub total_size: u64,
    pub encryption_requested: bool,
    #[serde(default = "default_digest_algorithm")]
    pub digest_algorithm: String,
}

fn default_protocol_version() -> u32 {
    PROTOCOL_VERSION
}

fn default_digest_algorithm() -> String {
    transfer::hash::BLAKE3.to_string()
}

impl TransferManifest {
    pub fn new(files: Vec<FileDescriptor>, encryption_requested: bool, digest_algorithm: &str) -> Self {
        let total_size = files.iter().map(|f| f.size).sum();
        Self {
            protocol_version: PROTOCOL_VERSION,
            session_id: uuid::Uuid::new_v4().to_string(),
            files,
            total_size,
            encryption_requested,
            digest_algorithm: digest_algorithm.to_string(),
        }
    }

    pub fn file(&self, id: u32) -> Option<&FileDescriptor> {
        self.files.iter().find(|f| f.id == id)
    }

    /// Check the manifest is self-consistent before anything is allocated for it.
    pub fn validate(&self) -> Result<(), TransferError> {
        if self.protocol_version != PROTOCOL_VERSION {
            return Err(TransferError::ProtocolViolation(format!(
                "unsupported protocol version {} (expected {})",
                self.protocol_version, PROTOCOL_VERSION
            )));
        }

        let mut seen = std::collections::HashSet::new();
        for file in &self.files {
            if !seen.insert(file.id) {
                return Err(TransferError::ProtocolViolation(format!(
                    "duplicate file id {} in manifest",
                    file.id
                )));
            }
        }

        let declared: u64 = self
            .files
            .iter()
            .try_fold(0u64, |acc, f| acc.checked_add(f.size))
            .ok_or_else(|| TransferError::ProtocolViolation("manifest size overflow".into()))?;
        if declared != self.total_size {
            return Err(TransferError::ProtocolViolation(format!(
                "manifest total_size {} does not match file sizes ({})",
                self.total_size, declared
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileStatus {
    Pending,
    Active,
    Complete,
    Failed,
}

/// Which side of the transfer produced a state or event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Sending,
    Receiving,
}

/// Per-file progress tracked by whichever side created it.
#[derive(Debug, Clone)]
pub struct FileTransferState {
    pub file_id: u32,
    pub total_bytes: u64,
    pub bytes_moved: u64,
    pub started_at: Option<Instant>,
    /// Hex digest, empty until computed or announced
    pub digest: String,
    pub status: FileStatus,
    pub failure: Option<FailureKind>,
    /// Receiver side only: whether the reassembled bytes matched the declared digest
    pub verified: Option<bool>,
}

impl FileTransferState {
    pub fn new(file_id: u32, total_bytes: u64) -> Self {
        Self {
            file_id,
            total_bytes,
            bytes_moved: 0,
            started_at: None,
            digest: String::new(),
            status: FileStatus::Pending,
            failure: None,
            verified: None,
        }
    }

    pub fn activate(&mut self) {
        self.status = FileStatus::Active;
        self.started_at = Some(Instant::now());
    }

    pub fn fail(&mut self, kind: FailureKind) {
        self.status = FileStatus::Failed;
        self.failure = Some(kind);
    }

    pub fn is_settled(&self) -> bool {
        matches!(self.status, FileStatus::Complete | FileStatus::Failed)
    }
}

/// Artifact handed back by a storage sink once a file is finalized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredArtifact {
    pub file_id: u32,
    pub name: String,
    pub size: u64,
    /// On-disk location, `None` for in-memory sinks
    pub location: Option<std::path::PathBuf>,
}
