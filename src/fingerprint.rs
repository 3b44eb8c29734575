//! Converter executable fingerprints for detecting stale caches.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use crate::error::Result;

/// Suffix of the sidecar file stored next to a cache file.
const SIDECAR_SUFFIX: &str = "fingerprint";

/// Identity of a converter executable at a point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutableFingerprint {
    /// File size in bytes
    pub size: u64,
    /// Modification time, seconds since the Unix epoch
    pub modified: Option<u64>,
    /// Hex-encoded SHA-256 of the file content
    pub sha256: String,
}

impl ExecutableFingerprint {
    /// Fingerprint the file at `path`.
    pub fn compute(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let metadata = fs::metadata(path)?;
        let modified = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs());

        let mut hasher = Sha256::new();
        let mut file = File::open(path)?;
        io::copy(&mut file, &mut hasher)?;
        let sha256 = hasher
            .finalize()
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect();

        Ok(Self {
            size: metadata.len(),
            modified,
            sha256,
        })
    }

    /// Sidecar path used for the cache at `cache_path`.
    pub fn sidecar_path(cache_path: &Path) -> PathBuf {
        let mut name = cache_path.as_os_str().to_owned();
        name.push(".");
        name.push(SIDECAR_SUFFIX);
        PathBuf::from(name)
    }

    /// Load a stored fingerprint.
    ///
    /// Returns `None` if the file doesn't exist.
    pub fn load(path: impl AsRef<Path>) -> Result<Option<Self>> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(path)?;
        let fingerprint: Self = serde_json::from_str(&content)
            .map_err(|e| crate::error::Error::Config(e.to_string()))?;
        Ok(Some(fingerprint))
    }

    /// Save the fingerprint to a file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| crate::error::Error::Config(e.to_string()))?;
        fs::write(path, content)?;
        Ok(())
    }
}
