//! Out-of-band pairing tokens.
//!
//! A token packs a connection offer or answer into text that survives copy/paste
//! and QR codes: `base64(tag + body)`, where the tag says whether the JSON body
//! was compressed. Tokens expire a fixed time after they were created.

mod compression;
mod qr;

pub use compression::{CompressionPrimitive, GZIP_TAG, default_compression};
#[cfg(feature = "gzip")]
pub use compression::GzipCompression;
pub use qr::render_qr;

use crate::error::SignalingError;
use crate::transfer::utils::now_millis;
use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub const PAIRING_VERSION: &str = "1";

/// Default validity window of a token
pub const DEFAULT_VALIDITY: Duration = Duration::from_secs(10 * 60);

/// JSON bodies longer than this are compressed
pub const COMPRESSION_THRESHOLD: usize = 500;

pub const RAW_TAG: &[u8] = b"RAW";

/// Upper bound on a decoded body, compressed or not
const MAX_PAYLOAD_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PairingRole {
    Offer,
    Answer,
}

impl fmt::Display for PairingRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PairingRole::Offer => f.write_str("offer"),
            PairingRole::Answer => f.write_str("answer"),
        }
    }
}

impl std::str::FromStr for PairingRole {
    type Err = SignalingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "offer" => Ok(PairingRole::Offer),
            "answer" => Ok(PairingRole::Answer),
            other => Err(SignalingError::Malformed(format!("unknown role '{}'", other))),
        }
    }
}

/// Connection description exchanged out of band.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingPayload {
    pub version: String,
    pub role: PairingRole,
    pub connection_description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_key_hint: Option<String>,
    /// Unix timestamp in milliseconds
    pub created_at: u64,
}

impl PairingPayload {
    pub fn new(role: PairingRole, connection_description: impl Into<String>) -> Self {
        Self {
            version: PAIRING_VERSION.to_string(),
            role,
            connection_description: connection_description.into(),
            encryption_key_hint: None,
            created_at: now_millis(),
        }
    }

    pub fn with_key_hint(mut self, hint: impl Into<String>) -> Self {
        self.encryption_key_hint = Some(hint.into());
        self
    }
}

/// Field-by-field view used to report exactly what is missing.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoosePayload {
    version: Option<serde_json::Value>,
    role: Option<String>,
    connection_description: Option<String>,
    encryption_key_hint: Option<String>,
    created_at: Option<u64>,
}

impl LoosePayload {
    fn validate(self) -> Result<PairingPayload, SignalingError> {
        let version = match self.version {
            Some(serde_json::Value::String(v)) => v,
            Some(serde_json::Value::Number(n)) => n.to_string(),
            Some(_) => return Err(SignalingError::Malformed("invalid version".into())),
            None => return Err(SignalingError::Malformed("missing version".into())),
        };
        if version != PAIRING_VERSION {
            return Err(SignalingError::Malformed(format!(
                "unsupported version '{}'",
                version
            )));
        }
        let role = self
            .role
            .ok_or_else(|| SignalingError::Malformed("missing role".into()))?
            .parse()?;
        let connection_description = self
            .connection_description
            .filter(|d| !d.trim().is_empty())
            .ok_or_else(|| SignalingError::Malformed("missing connectionDescription".into()))?;
        let created_at = self
            .created_at
            .ok_or_else(|| SignalingError::Malformed("missing createdAt".into()))?;

        Ok(PairingPayload {
            version,
            role,
            connection_description,
            encryption_key_hint: self.encryption_key_hint,
            created_at,
        })
    }
}

/// Whether `encode_with` compresses the body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionMode {
    /// Compress above the threshold when it makes the token shorter
    #[default]
    Auto,
    Always,
    Never,
}

/// Encodes and decodes pairing tokens.
#[derive(Clone)]
pub struct SignalingCodec {
    validity: Duration,
    threshold: usize,
    mode: CompressionMode,
    compression: Option<Arc<dyn CompressionPrimitive>>,
}

impl fmt::Debug for SignalingCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalingCodec")
            .field("validity", &self.validity)
            .field("threshold", &self.threshold)
            .field("mode", &self.mode)
            .field("compression", &self.compression.is_some())
            .finish()
    }
}

impl Default for SignalingCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalingCodec {
    pub fn new() -> Self {
        Self {
            validity: DEFAULT_VALIDITY,
            threshold: COMPRESSION_THRESHOLD,
            mode: CompressionMode::Auto,
            compression: default_compression(),
        }
    }

    pub fn with_validity(mut self, validity: Duration) -> Self {
        self.validity = validity;
        self
    }

    pub fn with_threshold(mut self, threshold: usize) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn with_compression(mut self, compression: Arc<dyn CompressionPrimitive>) -> Self {
        self.compression = Some(compression);
        self
    }

    /// Mode used by `encode`. Decoding accepts any tag the codec supports regardless.
    pub fn with_compression_mode(mut self, mode: CompressionMode) -> Self {
        self.mode = mode;
        self
    }

    /// Drop the compressor entirely: only `RAW` tokens are emitted or accepted.
    pub fn without_compression(mut self) -> Self {
        self.compression = None;
        self
    }

    pub fn validity(&self) -> Duration {
        self.validity
    }

    pub fn encode(&self, payload: &PairingPayload) -> Result<String, SignalingError> {
        self.encode_with(payload, self.mode)
    }

    pub fn encode_with(
        &self,
        payload: &PairingPayload,
        mode: CompressionMode,
    ) -> Result<String, SignalingError> {
        let json =
            serde_json::to_vec(payload).map_err(|e| SignalingError::Encode(e.to_string()))?;

        let wants_compression = match mode {
            CompressionMode::Always => true,
            CompressionMode::Never => false,
            CompressionMode::Auto => json.len() > self.threshold,
        };
        let compressed = match (&self.compression, wants_compression) {
            (Some(primitive), true) => match primitive.compress(&json) {
                Ok(body) if mode == CompressionMode::Always || body.len() < json.len() => {
                    Some((primitive.tag(), body))
                }
                Ok(_) => None,
                Err(e) => {
                    debug!("Compression failed, falling back to raw token: {}", e);
                    None
                }
            },
            _ => None,
        };

        let (tag, body) = compressed.unwrap_or((RAW_TAG, json));
        let mut packed = Vec::with_capacity(tag.len() + body.len());
        packed.extend_from_slice(tag);
        packed.extend_from_slice(&body);
        Ok(URL_SAFE_NO_PAD.encode(packed))
    }

    pub fn decode(&self, token: &str) -> Result<PairingPayload, SignalingError> {
        self.decode_at(token, now_millis())
    }

    /// Decode against an explicit clock, in Unix milliseconds.
    pub fn decode_at(&self, token: &str, now_ms: u64) -> Result<PairingPayload, SignalingError> {
        let token = token.trim();
        let packed = URL_SAFE_NO_PAD
            .decode(token)
            .or_else(|_| STANDARD.decode(token))
            .map_err(|e| SignalingError::Malformed(format!("invalid base64: {}", e)))?;

        let compressed = self
            .compression
            .as_ref()
            .and_then(|p| packed.strip_prefix(p.tag()).map(|body| (p, body)));
        let json = if let Some(body) = packed.strip_prefix(RAW_TAG) {
            body.to_vec()
        } else if let Some((primitive, body)) = compressed {
            primitive
                .decompress(body, MAX_PAYLOAD_SIZE)
                .map_err(|e| SignalingError::Malformed(format!("corrupt compressed body: {}", e)))?
        } else if packed.starts_with(GZIP_TAG) {
            return Err(SignalingError::UnsupportedCompression("gzip".into()));
        } else {
            return Err(SignalingError::Malformed("unknown token tag".into()));
        };
        if json.len() > MAX_PAYLOAD_SIZE {
            return Err(SignalingError::Malformed("payload too large".into()));
        }

        let loose: LoosePayload = serde_json::from_slice(&json)
            .map_err(|e| SignalingError::Malformed(format!("invalid JSON: {}", e)))?;
        let payload = loose.validate()?;

        let age_ms = now_ms.saturating_sub(payload.created_at);
        let validity_ms = self.validity.as_millis() as u64;
        if age_ms > validity_ms {
            return Err(SignalingError::Expired {
                age_secs: age_ms / 1000,
                validity_secs: self.validity.as_secs(),
            });
        }
        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload() -> PairingPayload {
        PairingPayload::new(PairingRole::Offer, "v=0\r\no=- 1 2 IN IP4 127.0.0.1\r\n")
    }

    #[test]
    fn test_wire_field_names() {
        let json = serde_json::to_value(payload().with_key_hint("k1")).unwrap();
        assert_eq!(json["role"], "offer");
        assert_eq!(json["version"], "1");
        assert!(json.get("connectionDescription").is_some());
        assert!(json.get("createdAt").is_some());
        assert_eq!(json["encryptionKeyHint"], "k1");
    }

    #[test]
    fn test_small_payload_stays_raw() {
        let codec = SignalingCodec::new();
        let token = codec.encode(&payload()).unwrap();
        let packed = URL_SAFE_NO_PAD.decode(&token).unwrap();
        assert!(packed.starts_with(RAW_TAG));
    }

    #[test]
    fn test_unknown_tag_is_malformed() {
        let token = URL_SAFE_NO_PAD.encode(b"ZSTD{}");
        assert!(matches!(
            SignalingCodec::new().decode(&token),
            Err(SignalingError::Malformed(_))
        ));
    }

    #[test]
    fn test_standard_base64_accepted() {
        let codec = SignalingCodec::new();
        let p = payload();
        let mut packed = RAW_TAG.to_vec();
        packed.extend_from_slice(&serde_json::to_vec(&p).unwrap());
        let token = STANDARD.encode(packed);
        assert_eq!(codec.decode(&token).unwrap(), p);
    }

    /// Reverses the body; enough to tell its tokens apart from RAW ones.
    struct Reversed;

    impl CompressionPrimitive for Reversed {
        fn tag(&self) -> &'static [u8] {
            b"REV"
        }

        fn compress(&self, data: &[u8]) -> std::io::Result<Vec<u8>> {
            Ok(data.iter().rev().copied().collect())
        }

        fn decompress(&self, data: &[u8], limit: usize) -> std::io::Result<Vec<u8>> {
            if data.len() > limit {
                return Err(std::io::Error::other("too large"));
            }
            Ok(data.iter().rev().copied().collect())
        }
    }

    #[test]
    fn test_custom_primitive_decodes_its_own_tokens() {
        let codec = SignalingCodec::new().with_compression(Arc::new(Reversed));
        let p = payload();
        let token = codec.encode_with(&p, CompressionMode::Always).unwrap();
        assert!(URL_SAFE_NO_PAD.decode(&token).unwrap().starts_with(b"REV"));
        assert_eq!(codec.decode(&token).unwrap(), p);

        // Another codec without that primitive cannot read it
        assert!(matches!(
            SignalingCodec::new().decode(&token),
            Err(SignalingError::Malformed(_))
        ));
    }

    #[test]
    fn test_never_mode_encodes_raw() {
        let codec = SignalingCodec::new()
            .with_threshold(0)
            .with_compression_mode(CompressionMode::Never);
        let token = codec.encode(&payload()).unwrap();
        assert!(URL_SAFE_NO_PAD.decode(&token).unwrap().starts_with(RAW_TAG));
    }

    #[cfg(feature = "gzip")]
    #[test]
    fn test_compressed_token_needs_compression_support() {
        let codec = SignalingCodec::new();
        let p = payload();
        let token = codec.encode_with(&p, CompressionMode::Always).unwrap();
        let packed = URL_SAFE_NO_PAD.decode(&token).unwrap();
        assert!(packed.starts_with(GZIP_TAG));

        assert!(matches!(
            codec.clone().without_compression().decode(&token),
            Err(SignalingError::UnsupportedCompression(_))
        ));
        assert_eq!(codec.decode(&token).unwrap(), p);
    }
}
