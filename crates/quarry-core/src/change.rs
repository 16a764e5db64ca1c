use serde::{Deserialize, Serialize};

use crate::file::FileMeta;

/// Why the host delivered a change notification for a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Created,
    Modified,
    Deleted,
    /// The file moved; `FileMeta::path` carries the new path and the id is
    /// unchanged.
    Moved,
    /// The file still exists but no longer belongs to the indexed set (e.g.
    /// it left the project or an exclusion rule now matches it).
    Irrelevant,
}

impl ChangeKind {
    /// True when the change removes the file's contributions from indexes.
    #[inline]
    pub fn is_removal(self) -> bool {
        matches!(self, ChangeKind::Deleted | ChangeKind::Irrelevant)
    }
}

/// A change notification delivered by the host.
///
/// `content` is optional: hosts that already hold the new bytes (e.g. editor
/// overlays) can attach them, but the scheduler prefers re-reading through
/// its `ContentSource` at extraction time so deferred work never indexes
/// stale bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEvent {
    pub meta: FileMeta,
    pub kind: ChangeKind,
    pub content: Option<Vec<u8>>,
}

impl FileEvent {
    pub fn new(meta: FileMeta, kind: ChangeKind) -> Self {
        Self {
            meta,
            kind,
            content: None,
        }
    }

    pub fn with_content(mut self, content: impl Into<Vec<u8>>) -> Self {
        self.content = Some(content.into());
        self
    }
}
