//! Peer and file identity: integer peer ids, SHA-256 file digests.

use std::fmt;
use std::io;
use std::path::Path;
use std::time::UNIX_EPOCH;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Peer identity within the multicast group. Assigned by the operator at boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(pub u32);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// File identifier: 256-bit digest shared by all chunks of a backed-up file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FileId([u8; 32]);

impl FileId {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        FileId(bytes)
    }

    /// Parse the lowercase hex form produced by `Display`.
    pub fn from_hex(s: &str) -> Option<Self> {
        if s.len() != 64 || !s.is_ascii() {
            return None;
        }
        let mut out = [0u8; 32];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[2 * i..2 * i + 2], 16).ok()?;
        }
        Some(FileId(out))
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

/// Digest a file's identity from its path and metadata. Deterministic for an
/// unchanged file; a different length or mtime moves the digest.
pub fn file_digest(path: &Path) -> io::Result<FileId> {
    let meta = std::fs::metadata(path)?;
    let mut hasher = Sha256::new();
    hasher.update(path.to_string_lossy().as_bytes());
    hasher.update(meta.len().to_le_bytes());
    if let Ok(mtime) = meta.modified() {
        if let Ok(since) = mtime.duration_since(UNIX_EPOCH) {
            hasher.update(since.as_secs().to_le_bytes());
            hasher.update(since.subsec_nanos().to_le_bytes());
        }
    }
    Ok(FileId(hasher.finalize().into()))
}
