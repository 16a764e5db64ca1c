use std::fmt;

use quarry_core::FileStamp;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A stable SHA-256 fingerprint stored as a lowercase hex string.
///
/// Two equal fingerprints mean the indexable content is assumed unchanged.
/// Within one process lifetime a fingerprint never reports "unchanged" for
/// content that actually changed (hash collisions aside); the metadata-only
/// mode trades that guarantee for speed when a host cannot afford hashing.
#[derive(
    Clone,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    rkyv::Archive,
    rkyv::Serialize,
    rkyv::Deserialize,
)]
#[archive(check_bytes)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Fingerprint of a file's stamp plus its full content.
    pub fn of_content(stamp: FileStamp, content: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(stamp.len.to_le_bytes());
        hasher.update(stamp.mtime_nanos.to_le_bytes());
        hasher.update(content);
        Self(hex::encode(hasher.finalize()))
    }

    /// Fingerprint of a file's stamp only (size + mtime).
    ///
    /// Avoids hashing file contents; modifications that preserve both size
    /// and mtime are missed, which the host accepts by picking
    /// [`FingerprintMode::MetadataOnly`].
    pub fn of_metadata(stamp: FileStamp) -> Self {
        let mut bytes = Vec::with_capacity(16);
        bytes.extend_from_slice(&stamp.len.to_le_bytes());
        bytes.extend_from_slice(&stamp.mtime_nanos.to_le_bytes());
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl ArchivedFingerprint {
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// How the oracle derives fingerprints from host-supplied file state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FingerprintMode {
    /// Stamp plus content hash. The default: cheap enough for indexing-sized
    /// files and immune to mtime-preserving edits.
    #[default]
    Content,
    /// Stamp only. O(file metadata) per file regardless of size.
    MetadataOnly,
}

impl FingerprintMode {
    pub fn fingerprint(self, stamp: FileStamp, content: &[u8]) -> Fingerprint {
        match self {
            FingerprintMode::Content => Fingerprint::of_content(stamp, content),
            FingerprintMode::MetadataOnly => Fingerprint::of_metadata(stamp),
        }
    }
}

/// Decides whether a file needs re-extraction.
///
/// `current` is `None` when the file could not be read (e.g. deleted between
/// enumeration and read); that reports "changed" so downstream deletion logic
/// runs instead of trusting stale facts.
pub fn is_changed(current: Option<&Fingerprint>, last_known: &Fingerprint) -> bool {
    match current {
        None => true,
        Some(fingerprint) => fingerprint != last_known,
    }
}
