use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use quarry_core::{FileId, FileMeta, FileStamp};

/// A file's current bytes plus the metadata stamp they were read under.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileContent {
    pub stamp: FileStamp,
    pub bytes: Vec<u8>,
}

/// Host-supplied content access. The engine never walks the file system
/// itself; everything it reads comes through this trait.
///
/// Return values:
/// - `Ok(Some(..))` — current content.
/// - `Ok(None)` — the file is definitively gone; the scheduler runs deletion
///   logic for it.
/// - `Err(..)` — transient I/O trouble; the scheduler leaves the file queued
///   and retries on the next drain.
pub trait ContentSource: Send + Sync {
    fn read(&self, meta: &FileMeta) -> io::Result<Option<FileContent>>;
}

/// An in-memory [`ContentSource`] for tests and hosts that buffer documents
/// themselves (e.g. editor overlays).
///
/// Writes bump a monotonic mtime so metadata-only fingerprints still observe
/// every change.
#[derive(Debug, Default)]
pub struct MemorySource {
    files: RwLock<HashMap<FileId, FileContent>>,
    clock: AtomicU64,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write(&self, id: FileId, bytes: impl Into<Vec<u8>>) -> FileStamp {
        let bytes = bytes.into();
        let stamp = FileStamp {
            len: bytes.len() as u64,
            mtime_nanos: self.clock.fetch_add(1, Ordering::Relaxed) + 1,
        };
        self.files.write().insert(id, FileContent { stamp, bytes });
        stamp
    }

    pub fn delete(&self, id: FileId) {
        self.files.write().remove(&id);
    }

    pub fn stamp_of(&self, id: FileId) -> Option<FileStamp> {
        self.files.read().get(&id).map(|content| content.stamp)
    }
}

impl ContentSource for MemorySource {
    fn read(&self, meta: &FileMeta) -> io::Result<Option<FileContent>> {
        Ok(self.files.read().get(&meta.id).cloned())
    }
}
