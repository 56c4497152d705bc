//! File transfer protocol engine.
//!
//! This module provides:
//! - The control message codec and chunk framing
//! - Sender and receiver engines driven over any [`MessageTransport`]
//! - Digest providers and storage sinks
//! - In-memory and QUIC message transports

pub mod constants;
pub mod hash;
pub mod protocol;
pub mod quic;
pub mod receiver;
pub mod sender;
pub mod session;
pub mod source;
pub mod storage;
pub mod transport;
pub mod utils;

// Re-export public API
pub use hash::{Blake3Digest, DigestProvider, IncrementalDigest, Sha256Digest};
pub use protocol::{ChunkHeader, ControlMessage, WireMessage, decode_control, encode_control};
pub use quic::{QuicInbound, QuicTransport, make_client_endpoint, make_server_endpoint};
pub use receiver::{ReceiverEngine, ReceiverState};
pub use sender::{CancelHandle, FileOutcome, SendOptions, SenderEngine};
pub use session::{SessionSummary, TransferSession};
pub use source::SourceFile;
pub use storage::{DirectoryStorage, MemoryStorage, StorageSink};
pub use transport::{InboundMessages, MemoryInbound, MemoryTransport, MessageTransport, memory_channel};
