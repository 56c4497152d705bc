use sha2::{Digest, Sha256};
use std::path::Path;
use tokio::fs::File;
use tokio::io::AsyncReadExt;

use super::constants::HASH_BUFFER_SIZE;

pub const BLAKE3: &str = "blake3";
pub const SHA256: &str = "sha256";

/// Running digest over bytes fed in order.
pub trait IncrementalDigest: Send {
    fn update(&mut self, bytes: &[u8]);
    fn finalize_hex(self: Box<Self>) -> String;
}

/// Pluggable, deterministic content digest.
pub trait DigestProvider: Send + Sync {
    /// Algorithm name announced in the manifest
    fn name(&self) -> &'static str;

    fn begin(&self) -> Box<dyn IncrementalDigest>;

    fn digest(&self, bytes: &[u8]) -> String {
        let mut hasher = self.begin();
        hasher.update(bytes);
        hasher.finalize_hex()
    }
}

/// BLAKE3, the default provider
#[derive(Debug, Clone, Copy, Default)]
pub struct Blake3Digest;

impl IncrementalDigest for blake3::Hasher {
    fn update(&mut self, bytes: &[u8]) {
        blake3::Hasher::update(self, bytes);
    }

    fn finalize_hex(self: Box<Self>) -> String {
        self.finalize().to_hex().to_string()
    }
}

impl DigestProvider for Blake3Digest {
    fn name(&self) -> &'static str {
        BLAKE3
    }

    fn begin(&self) -> Box<dyn IncrementalDigest> {
        Box::new(blake3::Hasher::new())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Sha256Digest;

struct Sha256State(Sha256);

impl IncrementalDigest for Sha256State {
    fn update(&mut self, bytes: &[u8]) {
        self.0.update(bytes);
    }

    fn finalize_hex(self: Box<Self>) -> String {
        format!("{:x}", self.0.finalize())
    }
}

impl DigestProvider for Sha256Digest {
    fn name(&self) -> &'static str {
        SHA256
    }

    fn begin(&self) -> Box<dyn IncrementalDigest> {
        Box::new(Sha256State(Sha256::new()))
    }
}

/// Provider for an algorithm name announced by a peer
pub fn provider_for(name: &str) -> Option<Box<dyn DigestProvider>> {
    match name {
        BLAKE3 => Some(Box::new(Blake3Digest)),
        SHA256 => Some(Box::new(Sha256Digest)),
        _ => None,
    }
}

/// Compute the digest of a file on disk
pub async fn compute_file_digest(
    file_path: &Path,
    provider: &dyn DigestProvider,
) -> std::io::Result<String> {
    let mut file = File::open(file_path).await?;
    let mut hasher = provider.begin();
    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];

    loop {
        let n = file.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(hasher.finalize_hex())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_input_digests() {
        assert_eq!(
            Blake3Digest.digest(b""),
            "af1349b9f5f9a1a6a0404dea36dcc9499bcb25c9adc112b7cc9a93cae41f3262"
        );
        assert_eq!(
            Sha256Digest.digest(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_incremental_matches_one_shot() {
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        for provider in [&Blake3Digest as &dyn DigestProvider, &Sha256Digest] {
            let mut hasher = provider.begin();
            for piece in data.chunks(777) {
                hasher.update(piece);
            }
            assert_eq!(hasher.finalize_hex(), provider.digest(&data));
        }
    }

    #[test]
    fn test_provider_lookup() {
        assert_eq!(provider_for("blake3").map(|p| p.name()), Some(BLAKE3));
        assert_eq!(provider_for("sha256").map(|p| p.name()), Some(SHA256));
        assert!(provider_for("md5").is_none());
    }

    #[tokio::test]
    async fn test_file_digest_matches_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        let data = vec![42u8; 3 * HASH_BUFFER_SIZE / 2];
        std::fs::write(&path, &data).unwrap();

        let digest = compute_file_digest(&path, &Blake3Digest).await.unwrap();
        assert_eq!(digest, Blake3Digest.digest(&data));
    }
}
