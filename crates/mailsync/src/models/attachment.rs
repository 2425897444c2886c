//! Attachment metadata and content identity

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::MessageId;

/// SHA-256 digest of an attachment's raw bytes, hex encoded
///
/// This is the sole identity used for deduplication.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContentHash(String);

impl ContentHash {
    /// Hash raw bytes
    pub fn of(bytes: &[u8]) -> Self {
        Self(hex::encode(Sha256::digest(bytes)))
    }

    /// Accept an already computed hex digest
    ///
    /// Returns None unless the value is 64 lowercase hex characters.
    pub fn from_hex(value: &str) -> Option<Self> {
        let valid = value.len() == 64
            && value
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        valid.then(|| Self(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Two-character shard prefix used by the on-disk index
    pub fn shard(&self) -> &str {
        &self.0[..2]
    }
}

impl std::fmt::Display for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Stored attachment belonging to a message
///
/// Several records may point at the same `storage_path` when their bytes
/// hash identically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentRecord {
    pub message_id: MessageId,
    /// Sanitized filename, safe for display and path derivation
    pub filename: String,
    /// Content type as declared by the message
    pub content_type: String,
    pub size: u64,
    pub content_hash: ContentHash,
    /// Path of the blob relative to the attachment store root
    pub storage_path: String,
}
