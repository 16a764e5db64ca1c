use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A stable, opaque identifier for a source file within one project.
///
/// Ids are assigned by the host (or via [`FileTable`]); the engine never
/// derives them from paths. An id survives a rename only if the host reports
/// the rename as a move rather than delete + create.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct FileId(u32);

impl FileId {
    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn to_raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "file({})", self.0)
    }
}

/// Cheap filesystem metadata for a file, supplied by the host.
///
/// The fingerprint oracle folds this into content fingerprints; on its own it
/// backs the metadata-only fingerprint mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileStamp {
    /// File length in bytes.
    pub len: u64,
    /// Last-modified time in nanoseconds since the UNIX epoch (0 when the
    /// host cannot provide one).
    pub mtime_nanos: u64,
}

/// Identity + metadata for one candidate file, as supplied by the host's
/// enumeration and change notifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMeta {
    pub id: FileId,
    /// Project-relative path with `/` separators. Used by applicability
    /// filters and diagnostics; never used as the file's identity.
    pub path: String,
    pub stamp: FileStamp,
}

impl FileMeta {
    pub fn new(id: FileId, path: impl Into<String>, stamp: FileStamp) -> Self {
        Self {
            id,
            path: path.into(),
            stamp,
        }
    }

    /// File-name extension (without the dot), if any.
    pub fn extension(&self) -> Option<&str> {
        let name = self.path.rsplit('/').next()?;
        let (stem, ext) = name.rsplit_once('.')?;
        if stem.is_empty() {
            return None;
        }
        Some(ext)
    }
}

/// Allocates stable [`FileId`]s for paths and supports reverse lookup.
///
/// Hosts that already have their own file identities do not need this; it is
/// provided for hosts (and tests) that want simple interning.
#[derive(Debug, Default)]
pub struct FileTable {
    path_to_id: HashMap<String, FileId>,
    id_to_path: Vec<String>,
}

impl FileTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the stable id for `path`, allocating a new one if necessary.
    pub fn file_id(&mut self, path: impl Into<String>) -> FileId {
        let path = path.into();
        if let Some(&id) = self.path_to_id.get(&path) {
            return id;
        }

        let raw = u32::try_from(self.id_to_path.len()).expect("too many file ids allocated");
        let id = FileId::from_raw(raw);
        self.id_to_path.push(path.clone());
        self.path_to_id.insert(path, id);
        id
    }

    /// Returns the id for `path` if it has been interned.
    pub fn get_id(&self, path: &str) -> Option<FileId> {
        self.path_to_id.get(path).copied()
    }

    /// Returns the path for `id`.
    pub fn get_path(&self, id: FileId) -> Option<&str> {
        self.id_to_path.get(id.to_raw() as usize).map(String::as_str)
    }

    /// Re-points `id` at `new_path`, keeping the id stable across a move.
    pub fn rename(&mut self, id: FileId, new_path: impl Into<String>) {
        let new_path = new_path.into();
        if let Some(old) = self.id_to_path.get_mut(id.to_raw() as usize) {
            self.path_to_id.remove(old);
            *old = new_path.clone();
            self.path_to_id.insert(new_path, id);
        }
    }
}
