use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{DownloadError, Result};

/// 8-byte magic identifier at the start of every `CryptHeader`.
pub const CRYPT_MAGIC: [u8; 8] = [0x52, 0x43, 0x4c, 0x4f, 0x4e, 0x45, 0x00, 0x00];

/// Length in bytes of the base nonce that follows the magic in a
/// `CryptHeader`, and of the AEAD nonce used per block.
pub const NONCE_LEN: usize = 24;

/// Length in bytes of the data key and of the AEAD authentication tag.
pub const KEY_LEN: usize = 32;
pub const TAG_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncryptionMode {
    Plain,
    Crypt,
}

/// The manifest obtained from the signed-URL endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub remote_url: String,
    /// `true` when `remote_url` is base64-encoded (origin obfuscation).
    #[serde(default)]
    pub remote_url_base64: bool,
    pub method: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    pub total_size: u64,
    pub encryption_mode: EncryptionMode,
    pub file_header_size: u32,
    pub block_header_size: u32,
    pub block_data_size: u32,
    /// Raw 32-byte data key. Empty when `encryption_mode == Plain`.
    #[serde(default)]
    pub data_key: Vec<u8>,
    pub file_name: String,
}

impl Manifest {
    /// Resolves the actual remote URL, undoing base64 obfuscation.
    pub fn resolved_url(&self) -> Result<String> {
        if !self.remote_url_base64 {
            return Ok(self.remote_url.clone());
        }
        let decoded = base64::Engine::decode(
            &base64::engine::general_purpose::STANDARD,
            &self.remote_url,
        )
        .map_err(|e| DownloadError::InvalidManifest(format!("bad urlBase64: {e}")))?;
        String::from_utf8(decoded)
            .map_err(|e| DownloadError::InvalidManifest(format!("urlBase64 not utf-8: {e}")))
    }

    /// Validates internal consistency of a freshly-fetched manifest.
    /// Rejects unknown-mode manifests rather than silently falling back to
    /// plain mode.
    pub fn validate(&self) -> Result<()> {
        if self.total_size == 0 {
            return Err(DownloadError::InvalidManifest("total_size is zero".into()));
        }
        if self.encryption_mode == EncryptionMode::Crypt {
            if self.data_key.len() != KEY_LEN {
                return Err(DownloadError::InvalidManifest(format!(
                    "crypt mode requires a {KEY_LEN}-byte data key, got {}",
                    self.data_key.len()
                )));
            }
            if self.block_data_size == 0 {
                return Err(DownloadError::InvalidManifest(
                    "crypt mode requires a non-zero block_data_size".into(),
                ));
            }
        }
        Ok(())
    }
}

/// Parsed `CryptHeader` — the first `file_header_size` bytes of the
/// ciphertext.
#[derive(Debug, Clone)]
pub struct CryptHeader {
    pub base_nonce: [u8; NONCE_LEN],
}

impl CryptHeader {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < CRYPT_MAGIC.len() + NONCE_LEN {
            return Err(DownloadError::InvalidManifest(
                "crypt header shorter than magic + nonce".into(),
            ));
        }
        if bytes[..CRYPT_MAGIC.len()] != CRYPT_MAGIC {
            return Err(DownloadError::InvalidManifest(
                "crypt header magic mismatch".into(),
            ));
        }
        let mut base_nonce = [0u8; NONCE_LEN];
        base_nonce.copy_from_slice(&bytes[CRYPT_MAGIC.len()..CRYPT_MAGIC.len() + NONCE_LEN]);
        Ok(Self { base_nonce })
    }
}

/// Compact description of a plan's shape. Two plans are interchangeable
/// iff `signature()` and the data key both match.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanMeta {
    pub total_size: u64,
    pub block_data_size: u32,
    pub block_header_size: u32,
    pub file_header_size: u32,
    pub encryption_mode: EncryptionMode,
    pub segment_size_bytes: u64,
}

impl PlanMeta {
    pub fn signature(&self) -> String {
        let mode = match self.encryption_mode {
            EncryptionMode::Plain => "plain",
            EncryptionMode::Crypt => "crypt",
        };
        format!(
            "{}:{}:{}:{}:{}:{}",
            self.total_size,
            self.block_data_size,
            self.block_header_size,
            self.file_header_size,
            mode,
            self.segment_size_bytes
        )
    }
}

/// The ciphertext-range mapping for one segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeMapping {
    pub underlying_offset: u64,
    pub underlying_limit: u64,
    pub discard: u64,
    pub starting_block_index: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SegmentStatus {
    Pending,
    Downloading,
    WaitingRetry,
    Done,
    Failed,
}

/// One contiguous plaintext range processed as a unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Segment {
    pub index: u64,
    pub plaintext_offset: u64,
    pub plaintext_length: u64,
    pub mapping: RangeMapping,
    #[serde(skip)]
    pub ciphertext: Option<Vec<u8>>,
    pub retries: u32,
    pub status: SegmentStatus,
    pub error: Option<String>,
}

impl Segment {
    pub fn new(index: u64, plaintext_offset: u64, plaintext_length: u64, mapping: RangeMapping) -> Self {
        Self {
            index,
            plaintext_offset,
            plaintext_length,
            mapping,
            ciphertext: None,
            retries: 0,
            status: SegmentStatus::Pending,
            error: None,
        }
    }
}

/// Per-request header/auth/proxy bundle threaded through every download
/// task.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub url: String,
    pub method: String,
    pub headers: HashMap<String, String>,
}
