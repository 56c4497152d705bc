use crate::adaptive::{
    self, ConfigHints, LinkQuality, MAX_BUFFER_HIGH_WATER_MARK, MAX_CHUNK_SIZE, MAX_CONCURRENCY,
    MIN_BUFFER_HIGH_WATER_MARK, MIN_CHUNK_SIZE, MIN_CONCURRENCY, MemoryClass,
};
use crate::pairing::{COMPRESSION_THRESHOLD, CompressionMode, DEFAULT_VALIDITY, SignalingCodec};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const APP_QUALIFIER: &str = "com";
const APP_ORGANIZATION: &str = "p2p";
const APP_NAME: &str = "p2p_direct";
const CONFIG_FILE: &str = "config.json";

/// Overrides the config directory (used by tests and portable installs)
pub const CONFIG_DIR_ENV: &str = "P2P_DIRECT_CONFIG_DIR";

/// Per-session transfer parameters.
///
/// Built once per session (usually by [`adaptive::choose_config`]) and passed by value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransferConfig {
    pub chunk_size: usize,
    pub buffer_high_water_mark: u64,
    pub concurrency_hint: usize,
    pub use_compression: bool,
    pub poll_interval: Duration,
}

impl Default for TransferConfig {
    fn default() -> Self {
        adaptive::choose_config(&ConfigHints::default())
    }
}

impl TransferConfig {
    pub fn clamped(mut self) -> Self {
        self.chunk_size = self.chunk_size.clamp(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE);
        self.buffer_high_water_mark = self
            .buffer_high_water_mark
            .clamp(MIN_BUFFER_HIGH_WATER_MARK, MAX_BUFFER_HIGH_WATER_MARK);
        self.concurrency_hint = self.concurrency_hint.clamp(MIN_CONCURRENCY, MAX_CONCURRENCY);
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self.clamped()
    }

    pub fn with_high_water_mark(mut self, mark: u64) -> Self {
        self.buffer_high_water_mark = mark;
        self.clamped()
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Settings persisted between runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub download_path: PathBuf,
    /// How long a pairing token stays valid
    pub pairing_validity_secs: u64,
    /// Serialized payloads above this size are compressed
    pub compression_threshold: usize,
    pub link_quality: Option<LinkQuality>,
    /// Overrides the detected memory class
    pub memory_class: Option<MemoryClass>,
}

impl Default for AppConfig {
    fn default() -> Self {
        let download_path = directories::UserDirs::new()
            .map(|dirs| dirs.home_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."))
            .join("p2p_direct");

        Self {
            download_path,
            pairing_validity_secs: DEFAULT_VALIDITY.as_secs(),
            compression_threshold: COMPRESSION_THRESHOLD,
            link_quality: None,
            memory_class: None,
        }
    }
}

impl AppConfig {
    /// Get the config file path
    pub fn config_path() -> Option<PathBuf> {
        if let Ok(dir) = std::env::var(CONFIG_DIR_ENV) {
            return Some(PathBuf::from(dir).join(CONFIG_FILE));
        }

        ProjectDirs::from(APP_QUALIFIER, APP_ORGANIZATION, APP_NAME)
            .map(|dirs| dirs.config_dir().join(CONFIG_FILE))
    }

    /// Load config from disk or return default
    pub fn load() -> Self {
        match Self::config_path() {
            Some(path) => Self::load_from(&path),
            None => Self::default(),
        }
    }

    pub fn load_from(path: &Path) -> Self {
        match fs::read_to_string(path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                tracing::warn!("Ignoring unreadable config {}: {}", path.display(), e);
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }

    /// Save config to disk
    pub fn save(&self) -> std::io::Result<()> {
        match Self::config_path() {
            Some(path) => self.save_to(&path),
            None => Ok(()),
        }
    }

    pub fn save_to(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)
    }

    /// Stored hints take precedence over what is detected on this machine.
    pub fn hints(&self) -> ConfigHints {
        let detected = ConfigHints::detect();
        ConfigHints {
            link_quality: self.link_quality,
            memory: self.memory_class.or(detected.memory),
            cores: detected.cores,
        }
    }

    pub fn transfer_config(&self) -> TransferConfig {
        adaptive::choose_config(&self.hints())
    }

    pub fn signaling_codec(&self) -> SignalingCodec {
        // Compression off only affects what we emit; peers' GZIP tokens still decode
        let mode = if self.transfer_config().use_compression {
            CompressionMode::Auto
        } else {
            CompressionMode::Never
        };
        SignalingCodec::new()
            .with_validity(Duration::from_secs(self.pairing_validity_secs))
            .with_threshold(self.compression_threshold)
            .with_compression_mode(mode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_chunk_size_clamps() {
        let config = TransferConfig::default().with_chunk_size(1);
        assert_eq!(config.chunk_size, MIN_CHUNK_SIZE);
        let config = TransferConfig::default().with_chunk_size(usize::MAX);
        assert_eq!(config.chunk_size, MAX_CHUNK_SIZE);
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(CONFIG_FILE);

        let config = AppConfig {
            download_path: dir.path().join("downloads"),
            pairing_validity_secs: 120,
            compression_threshold: 64,
            link_quality: Some(LinkQuality::Good),
            memory_class: Some(MemoryClass::Low),
        };
        config.save_to(&path).unwrap();

        assert_eq!(AppConfig::load_from(&path), config);
    }

    #[test]
    fn test_missing_or_corrupt_config_falls_back_to_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        assert_eq!(AppConfig::load_from(&path), AppConfig::default());

        fs::write(&path, "{not json").unwrap();
        assert_eq!(AppConfig::load_from(&path), AppConfig::default());
    }

    #[test]
    fn test_partial_config_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        fs::write(&path, r#"{"link_quality":"poor"}"#).unwrap();

        let config = AppConfig::load_from(&path);
        assert_eq!(config.link_quality, Some(LinkQuality::Poor));
        assert_eq!(config.pairing_validity_secs, DEFAULT_VALIDITY.as_secs());
    }

    #[test]
    fn test_stored_memory_class_overrides_detection() {
        let config = AppConfig {
            memory_class: Some(MemoryClass::Low),
            link_quality: Some(LinkQuality::Poor),
            ..AppConfig::default()
        };
        let transfer = config.transfer_config();
        assert_eq!(transfer.chunk_size, MIN_CHUNK_SIZE);
        assert!(!transfer.use_compression);
    }

    #[cfg(feature = "gzip")]
    #[test]
    fn test_low_memory_codec_emits_raw_but_reads_gzip() {
        use crate::pairing::{GZIP_TAG, PairingPayload, PairingRole};
        use base64::Engine;
        use base64::engine::general_purpose::URL_SAFE_NO_PAD;

        let payload = PairingPayload::new(PairingRole::Offer, "a=candidate:1 udp\r\n".repeat(100));
        let peer_token = SignalingCodec::new().encode(&payload).unwrap();
        assert!(URL_SAFE_NO_PAD.decode(&peer_token).unwrap().starts_with(GZIP_TAG));

        let config = AppConfig {
            memory_class: Some(MemoryClass::Low),
            link_quality: Some(LinkQuality::Poor),
            ..AppConfig::default()
        };
        let codec = config.signaling_codec();
        assert_eq!(codec.decode(&peer_token).unwrap(), payload);

        let own_token = codec.encode(&payload).unwrap();
        assert!(URL_SAFE_NO_PAD.decode(&own_token).unwrap().starts_with(b"RAW"));
    }
}
