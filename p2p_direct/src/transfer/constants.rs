/// Largest control message accepted before parsing (1 MiB)
pub const MAX_CONTROL_MSG_SIZE: usize = 1024 * 1024;

/// Largest frame accepted on a QUIC message stream (4 MiB)
pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

/// Read buffer used when hashing files on disk (1 MiB)
pub const HASH_BUFFER_SIZE: usize = 1024 * 1024;

/// Maximum length of a stored file name
pub const MAX_FILENAME_LENGTH: usize = 255;

/// ALPN protocol identifier for the QUIC message stream
pub const ALPN: &[u8] = b"p2p-direct/1";
