//! Content-addressed attachment storage
//!
//! Directory structure:
//! ```text
//! attachments/
//!   blobs/
//!     2024/03/q3-report_firm.com/
//!       2cf24dba5fb0-report.pdf     # <hash12>-<sanitized filename>
//!   index/
//!     2c/
//!       2cf24dba5fb0a30e...         # relative blob path for this hash
//!   .staging/                       # in-flight writes, never read
//! ```
//!
//! The index is the only way in: a blob becomes visible once its index
//! entry exists, and an index entry is only published after the blob has
//! been fsynced and renamed into place.

use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Datelike, FixedOffset};
use log::{debug, warn};

use crate::models::{AttachmentRecord, ContentHash, MessageId};

const BLOBS_DIR: &str = "blobs";
const INDEX_DIR: &str = "index";
const STAGING_DIR: &str = ".staging";

const FALLBACK_FILENAME: &str = "attachment";
const MAX_FILENAME_BYTES: usize = 255;
const MAX_EXTENSION_BYTES: usize = 16;
/// `<hash12>-` in front of the filename inside `blobs/`
const BLOB_PREFIX_BYTES: usize = 13;
const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Blob count and total size on disk
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlobStats {
    pub blobs: u64,
    pub bytes: u64,
}

/// Deduplicating attachment store rooted at one directory
pub struct AttachmentStore {
    root: PathBuf,
}

impl AttachmentStore {
    /// Open (or create) the store at `root`
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        for dir in [BLOBS_DIR, INDEX_DIR, STAGING_DIR] {
            fs::create_dir_all(root.join(dir))
                .with_context(|| format!("Failed to create {:?}", root.join(dir)))?;
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Store attachment bytes for `owner` and return its record
    ///
    /// Bytes already present under the same hash are not written again; the
    /// returned record points at the existing blob.
    pub fn put(
        &self,
        owner: &MessageId,
        date: DateTime<FixedOffset>,
        bytes: &[u8],
        declared_filename: &str,
        declared_type: &str,
    ) -> Result<AttachmentRecord> {
        let hash = ContentHash::of(bytes);
        let filename = sanitize_filename(declared_filename);
        let record = |storage_path: String| AttachmentRecord {
            message_id: owner.clone(),
            filename: filename.clone(),
            content_type: normalize_content_type(declared_type),
            size: bytes.len() as u64,
            content_hash: hash.clone(),
            storage_path,
        };

        if let Some(existing) = self.lookup(&hash)? {
            debug!("[BLOB] Reusing {} for {}", existing, owner);
            return Ok(record(existing));
        }

        let relative = format!(
            "{}/{:04}/{:02}/{}/{}-{}",
            BLOBS_DIR,
            date.year(),
            date.month(),
            sanitize_filename(owner.as_str()),
            &hash.as_str()[..12],
            sanitize_filename_with_limit(&filename, MAX_FILENAME_BYTES - BLOB_PREFIX_BYTES)
        );
        let blob_path = self.root.join(&relative);
        if let Some(parent) = blob_path.parent() {
            fs::create_dir_all(parent)?;
        }

        // Blob first: staged, fsynced, renamed into place
        let staged_blob = self.stage(&hash, bytes)?;
        if let Err(e) = fs::rename(&staged_blob, &blob_path) {
            let _ = fs::remove_file(&staged_blob);
            return Err(e).with_context(|| format!("Failed to move blob into {:?}", blob_path));
        }

        let winner = self.publish(&hash, &relative)?;
        if winner != relative {
            // Lost the race: another put indexed the same bytes first
            if let Err(e) = fs::remove_file(&blob_path) {
                warn!("[BLOB] Failed to remove duplicate {:?}: {}", blob_path, e);
            }
            debug!("[BLOB] Adopted {} for {}", winner, owner);
            return Ok(record(winner));
        }

        debug!("[BLOB] Stored {} ({} bytes)", relative, bytes.len());
        Ok(record(relative))
    }

    /// Read the bytes stored under `hash`
    pub fn get(&self, hash: &ContentHash) -> Result<Option<Vec<u8>>> {
        let Some(relative) = self.lookup(hash)? else {
            return Ok(None);
        };
        let path = self.root.join(&relative);
        let bytes = fs::read(&path).with_context(|| format!("Failed to read blob {:?}", path))?;
        Ok(Some(bytes))
    }

    pub fn exists(&self, hash: &ContentHash) -> Result<bool> {
        Ok(self.lookup(hash)?.is_some())
    }

    /// Re-hash the stored bytes and compare with `hash`
    ///
    /// Returns false for a missing or corrupted blob.
    pub fn verify(&self, hash: &ContentHash) -> Result<bool> {
        match self.get(hash) {
            Ok(Some(bytes)) => Ok(&ContentHash::of(&bytes) == hash),
            Ok(None) => Ok(false),
            Err(e) => {
                warn!("[BLOB] Verification of {} failed: {:#}", hash, e);
                Ok(false)
            }
        }
    }

    /// Count indexed blobs and their total size
    pub fn stats(&self) -> Result<BlobStats> {
        let mut stats = BlobStats::default();
        for shard in fs::read_dir(self.root.join(INDEX_DIR))? {
            let shard = shard?;
            if !shard.file_type()?.is_dir() {
                continue;
            }
            for entry in fs::read_dir(shard.path())? {
                let entry = entry?;
                let Some(hash) = entry.file_name().to_str().and_then(ContentHash::from_hex) else {
                    continue;
                };
                if let Some(relative) = self.lookup(&hash)?
                    && let Ok(meta) = fs::metadata(self.root.join(relative))
                {
                    stats.blobs += 1;
                    stats.bytes += meta.len();
                }
            }
        }
        Ok(stats)
    }

    fn index_path(&self, hash: &ContentHash) -> PathBuf {
        self.root
            .join(INDEX_DIR)
            .join(hash.shard())
            .join(hash.as_str())
    }

    /// Resolve a hash to its blob path, relative to the root
    fn lookup(&self, hash: &ContentHash) -> Result<Option<String>> {
        let contents = match fs::read_to_string(self.index_path(hash)) {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).context("Failed to read attachment index"),
        };
        let relative = contents.trim().to_string();
        if !is_contained(&relative) {
            bail!("Index entry for {} escapes the store: {:?}", hash, relative);
        }
        Ok(Some(relative))
    }

    /// Write `bytes` to a fresh staging file and fsync it
    fn stage(&self, hash: &ContentHash, bytes: &[u8]) -> Result<PathBuf> {
        let path = self.root.join(STAGING_DIR).join(format!(
            "{}.{}.{:016x}",
            hash,
            std::process::id(),
            rand::random::<u64>()
        ));
        let mut file =
            File::create(&path).with_context(|| format!("Failed to create {:?}", path))?;
        file.write_all(bytes)?;
        file.sync_all()?;
        Ok(path)
    }

    /// Publish the index entry for `hash`, create-if-absent
    ///
    /// Returns the path recorded by whichever writer got there first.
    fn publish(&self, hash: &ContentHash, relative: &str) -> Result<String> {
        let index_path = self.index_path(hash);
        if let Some(parent) = index_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let staged = self.stage(hash, relative.as_bytes())?;
        let linked = fs::hard_link(&staged, &index_path);
        let _ = fs::remove_file(&staged);

        match linked {
            Ok(()) => Ok(relative.to_string()),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => self
                .lookup(hash)?
                .with_context(|| format!("Index entry for {} vanished", hash)),
            Err(e) => Err(e).with_context(|| format!("Failed to publish index {:?}", index_path)),
        }
    }
}

fn is_contained(relative: &str) -> bool {
    !relative.is_empty()
        && Path::new(relative)
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
}

fn normalize_content_type(declared: &str) -> String {
    let bare = declared.split(';').next().unwrap_or("").trim();
    if bare.is_empty() {
        DEFAULT_CONTENT_TYPE.to_string()
    } else {
        bare.to_ascii_lowercase()
    }
}

/// Reduce an untrusted filename to a safe single path component
///
/// Directory parts are dropped, control characters removed and anything
/// outside `[A-Za-z0-9._ -]` replaced with `_`. The result never starts with
/// a dot, is never empty and fits in 255 bytes with its extension kept.
pub fn sanitize_filename(name: &str) -> String {
    sanitize_filename_with_limit(name, MAX_FILENAME_BYTES)
}

/// Like [`sanitize_filename`], truncated to `limit` bytes instead
pub fn sanitize_filename_with_limit(name: &str, limit: usize) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or("");

    let cleaned: String = base
        .chars()
        .filter(|c| !c.is_control())
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | ' ' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();

    let trimmed = cleaned
        .trim_start_matches(|c: char| c == '.' || c.is_whitespace())
        .trim_end();

    if trimmed.is_empty() || trimmed == "." || trimmed == ".." {
        return FALLBACK_FILENAME.to_string();
    }
    let limit = limit.max(MAX_EXTENSION_BYTES + 1);
    if trimmed.len() <= limit {
        return trimmed.to_string();
    }

    // Only ASCII survives the mapping above, so byte slicing is safe
    match trimmed.rfind('.') {
        Some(dot) if dot > 0 && trimmed.len() - dot <= MAX_EXTENSION_BYTES => {
            let extension = &trimmed[dot..];
            let stem = &trimmed[..limit - extension.len()];
            format!("{}{}", stem, extension)
        }
        _ => trimmed[..limit].to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn create_test_store() -> (AttachmentStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = AttachmentStore::open(dir.path().join("attachments")).unwrap();
        (store, dir)
    }

    fn date() -> DateTime<FixedOffset> {
        DateTime::parse_from_rfc3339("2024-03-05T09:15:00+01:00").unwrap()
    }

    fn count_files(dir: &Path) -> usize {
        let Ok(entries) = fs::read_dir(dir) else {
            return 0;
        };
        entries
            .map(|e| e.unwrap().path())
            .map(|p| if p.is_dir() { count_files(&p) } else { 1 })
            .sum()
    }

    #[test]
    fn test_put_and_get() {
        let (store, _dir) = create_test_store();
        let owner = MessageId::new("q3-report@firm.com");
        let record = store
            .put(&owner, date(), b"%PDF-1.4\n", "report.pdf", "Application/PDF; name=report.pdf")
            .unwrap();

        assert_eq!(record.message_id, owner);
        assert_eq!(record.filename, "report.pdf");
        assert_eq!(record.content_type, "application/pdf");
        assert_eq!(record.size, 9);
        assert!(record.storage_path.starts_with("blobs/2024/03/q3-report_firm.com/"));
        assert!(record.storage_path.ends_with("-report.pdf"));

        assert!(store.exists(&record.content_hash).unwrap());
        assert_eq!(store.get(&record.content_hash).unwrap().unwrap(), b"%PDF-1.4\n");
        assert!(store.verify(&record.content_hash).unwrap());
        assert!(store.get(&ContentHash::of(b"missing")).unwrap().is_none());
    }

    #[test]
    fn test_identical_bytes_share_one_blob() {
        let (store, _dir) = create_test_store();
        let first = store
            .put(&MessageId::new("a@x"), date(), b"same bytes", "one.txt", "text/plain")
            .unwrap();
        let second = store
            .put(&MessageId::new("b@x"), date(), b"same bytes", "two.txt", "text/plain")
            .unwrap();

        assert_eq!(first.content_hash, second.content_hash);
        assert_eq!(first.storage_path, second.storage_path);
        assert_eq!(second.filename, "two.txt");
        assert_eq!(count_files(&store.root().join(BLOBS_DIR)), 1);
        assert_eq!(
            store.stats().unwrap(),
            BlobStats {
                blobs: 1,
                bytes: 10
            }
        );
    }

    #[test]
    fn test_concurrent_put_same_bytes() {
        let (store, _dir) = create_test_store();
        let store = Arc::new(store);
        let payload = vec![7u8; 64 * 1024];

        let records: Vec<AttachmentRecord> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|i| {
                    let store = Arc::clone(&store);
                    let payload = &payload;
                    s.spawn(move || {
                        let owner = MessageId::new(format!("m{}@x", i));
                        store.put(&owner, date(), payload, "data.bin", "").unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let path = &records[0].storage_path;
        assert!(records.iter().all(|r| &r.storage_path == path));
        assert_eq!(count_files(&store.root().join(BLOBS_DIR)), 1);
        assert_eq!(count_files(&store.root().join(STAGING_DIR)), 0);
        assert_eq!(store.get(&records[0].content_hash).unwrap().unwrap(), payload);
        assert_eq!(records[0].content_type, DEFAULT_CONTENT_TYPE);
    }

    #[test]
    fn test_traversal_filename_is_contained() {
        let (store, dir) = create_test_store();
        let record = store
            .put(&MessageId::new("evil@x"), date(), b"root:x:0:0", "../../etc/passwd", "text/plain")
            .unwrap();

        assert_eq!(record.filename, "passwd");
        let full = store.root().join(&record.storage_path);
        assert!(full.starts_with(store.root()));
        assert!(!dir.path().join("etc").exists());
        assert_eq!(store.get(&record.content_hash).unwrap().unwrap(), b"root:x:0:0");
    }

    #[test]
    fn test_verify_detects_corruption() {
        let (store, _dir) = create_test_store();
        let record = store
            .put(&MessageId::new("c@x"), date(), b"original", "a.txt", "text/plain")
            .unwrap();
        fs::write(store.root().join(&record.storage_path), b"tampered").unwrap();
        assert!(!store.verify(&record.content_hash).unwrap());
        assert!(!store.verify(&ContentHash::of(b"never stored")).unwrap());
    }

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_filename("C:\\Users\\me\\report.pdf"), "report.pdf");
        assert_eq!(sanitize_filename("..."), FALLBACK_FILENAME);
        assert_eq!(sanitize_filename(""), FALLBACK_FILENAME);
        assert_eq!(sanitize_filename(".."), FALLBACK_FILENAME);
        assert_eq!(sanitize_filename(".hidden"), "hidden");
        assert_eq!(sanitize_filename("a\u{0}b\nc.txt"), "abc.txt");
        assert_eq!(sanitize_filename("Q3 <final>?.pdf"), "Q3 _final__.pdf");
        assert_eq!(sanitize_filename("  spaced.txt  "), "spaced.txt");

        let long = format!("{}.pdf", "x".repeat(400));
        let sanitized = sanitize_filename(&long);
        assert_eq!(sanitized.len(), MAX_FILENAME_BYTES);
        assert!(sanitized.ends_with(".pdf"));

        let bounded = sanitize_filename_with_limit(&long, 100);
        assert_eq!(bounded.len(), 100);
        assert!(bounded.ends_with(".pdf"));
    }

    #[test]
    fn test_long_filename_fits_on_disk() {
        let (store, _dir) = create_test_store();
        let declared = format!("{}.pdf", "x".repeat(300));
        let record = store
            .put(&MessageId::new("long@x"), date(), b"%PDF-1.7", &declared, "application/pdf")
            .unwrap();

        assert_eq!(record.filename.len(), MAX_FILENAME_BYTES);
        let blob_name = Path::new(&record.storage_path).file_name().unwrap();
        assert_eq!(blob_name.len(), MAX_FILENAME_BYTES);
        assert!(record.storage_path.ends_with(".pdf"));
        assert_eq!(store.get(&record.content_hash).unwrap().unwrap(), b"%PDF-1.7");
        assert_eq!(count_files(&store.root().join(STAGING_DIR)), 0);
    }

    #[test]
    fn test_failed_move_leaves_no_staged_file() {
        let (store, _dir) = create_test_store();
        let owner = MessageId::new("blocked@x");
        // A non-empty directory already sits where the blob should land
        let hash = ContentHash::of(b"bytes");
        let occupied = store
            .root()
            .join(BLOBS_DIR)
            .join("2024/03/blocked_x")
            .join(format!("{}-a.txt", &hash.as_str()[..12]));
        fs::create_dir_all(&occupied).unwrap();
        fs::write(occupied.join("keep"), b"").unwrap();

        let result = store.put(&owner, date(), b"bytes", "a.txt", "text/plain");
        assert!(result.is_err());
        assert_eq!(count_files(&store.root().join(STAGING_DIR)), 0);
        assert!(!store.exists(&hash).unwrap());
    }
}
