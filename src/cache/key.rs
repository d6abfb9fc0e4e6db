//! Cache keys and source fingerprints.

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::IoError;
use crate::source::{OpenOptions, RenderParams, TileAddress};

/// Stable identity of an opened source.
///
/// SHA-256 over the path, file length, modification time and open options,
/// so a file rewritten in place gets a new fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceFingerprint(Arc<str>);

impl SourceFingerprint {
    /// Fingerprint a file (or directory store) on disk.
    pub async fn for_file(path: &Path, options: &OpenOptions) -> Result<Self, IoError> {
        let display = path.display().to_string();
        let meta = tokio::fs::metadata(path)
            .await
            .map_err(|e| IoError::from_std(display.clone(), e))?;
        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_nanos())
            .unwrap_or(0);

        let mut hasher = Sha256::new();
        hasher.update(display.as_bytes());
        hasher.update([0u8]);
        hasher.update(meta.len().to_le_bytes());
        hasher.update(mtime.to_le_bytes());
        hasher.update(options.canonical().as_bytes());
        Ok(Self(hex::encode(hasher.finalize()).into()))
    }

    /// Fingerprint a source that has no backing file.
    pub fn for_label(label: &str, options: &OpenOptions) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(label.as_bytes());
        hasher.update([0u8]);
        hasher.update(options.canonical().as_bytes());
        Self(hex::encode(hasher.finalize()).into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form is enough for logs.
        f.write_str(&self.0[..self.0.len().min(12)])
    }
}

/// Identity of one cached tile payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub source: SourceFingerprint,
    pub address: TileAddress,
    pub params: RenderParams,
}

impl CacheKey {
    pub fn new(source: SourceFingerprint, address: TileAddress, params: RenderParams) -> Self {
        Self {
            source,
            address,
            params,
        }
    }

    /// Key safe for networked caches: ASCII, no whitespace, bounded length.
    pub fn wire_key(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.source.as_str().as_bytes());
        // serde_json output of these types is deterministic.
        if let Ok(json) = serde_json::to_vec(&(&self.address, &self.params)) {
            hasher.update(json);
        }
        format!("large_image:{}", hex::encode(hasher.finalize()))
    }
}
