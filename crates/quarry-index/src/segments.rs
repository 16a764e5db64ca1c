use std::path::{Path, PathBuf};

use quarry_cache::CacheError;
use serde::{Deserialize, Serialize};

use crate::error::IndexError;
use crate::store::STORE_FORMAT_VERSION;

pub(crate) const SEGMENTS_DIR: &str = "segments";
const MANIFEST_FILE: &str = "manifest.json";

/// Describes one delta segment on disk. Ordered by `id`, oldest first; a
/// file's newest covering segment supersedes its base entry and any older
/// segments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct SegmentEntry {
    pub id: u64,
    pub file_name: String,
    /// Store generation at the time the segment was written. Must match the
    /// generation recorded inside the segment archive.
    pub generation: u64,
    /// Raw file ids whose base contribution this segment supersedes. Files
    /// listed here but absent from the segment's entries are tombstones
    /// (deleted or no longer applicable).
    pub covered: Vec<u32>,
    pub bytes: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct SegmentManifest {
    pub format_version: u32,
    /// Generation after the newest segment was applied.
    pub last_generation: u64,
    next_segment_id: u64,
    pub segments: Vec<SegmentEntry>,
}

impl SegmentManifest {
    pub(crate) fn new() -> Self {
        Self {
            format_version: STORE_FORMAT_VERSION,
            last_generation: 0,
            next_segment_id: 1,
            segments: Vec::new(),
        }
    }

    pub(crate) fn is_compatible(&self) -> bool {
        self.format_version == STORE_FORMAT_VERSION
    }

    pub(crate) fn allocate_segment_id(&mut self) -> u64 {
        let id = self.next_segment_id;
        self.next_segment_id += 1;
        id
    }
}

pub(crate) fn segment_file_name(id: u64) -> String {
    format!("seg-{id:06}.idx")
}

pub(crate) fn segments_dir(index_dir: &Path) -> PathBuf {
    index_dir.join(SEGMENTS_DIR)
}

pub(crate) fn segment_path(index_dir: &Path, file_name: &str) -> PathBuf {
    segments_dir(index_dir).join(file_name)
}

fn manifest_path(index_dir: &Path) -> PathBuf {
    segments_dir(index_dir).join(MANIFEST_FILE)
}

/// Loads the segment manifest; `Ok(None)` when no segments were ever written.
pub(crate) fn load_manifest(index_dir: &Path) -> Result<Option<SegmentManifest>, IndexError> {
    let path = manifest_path(index_dir);
    let json = match std::fs::read_to_string(&path) {
        Ok(json) => json,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let manifest: SegmentManifest = serde_json::from_str(&json).map_err(CacheError::from)?;
    Ok(Some(manifest))
}

/// Persists the manifest atomically (temp file + rename): a crash leaves
/// either the previous manifest or the new one, so an already-written segment
/// file the manifest does not reference is simply ignored on the next open.
pub(crate) fn save_manifest(
    index_dir: &Path,
    manifest: &SegmentManifest,
) -> Result<(), IndexError> {
    let dir = segments_dir(index_dir);
    std::fs::create_dir_all(&dir)?;

    let json = serde_json::to_string_pretty(manifest).map_err(CacheError::from)?;
    let tmp = dir.join(format!("{MANIFEST_FILE}.tmp.{}", std::process::id()));
    std::fs::write(&tmp, json)?;
    match std::fs::rename(&tmp, manifest_path(index_dir)) {
        Ok(()) => Ok(()),
        Err(err) => {
            let _ = std::fs::remove_file(&tmp);
            Err(err.into())
        }
    }
}

/// Removes the segment directory wholesale (after compaction or wipe).
pub(crate) fn clear_segments(index_dir: &Path) -> Result<(), IndexError> {
    let dir = segments_dir(index_dir);
    match std::fs::remove_dir_all(&dir) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_file_names_sort_in_id_order() {
        let names: Vec<String> = [1u64, 2, 10, 99999].iter().map(|&id| segment_file_name(id)).collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
    }

    #[test]
    fn manifest_round_trips() {
        let dir = tempfile::TempDir::new().unwrap();

        let mut manifest = SegmentManifest::new();
        let id = manifest.allocate_segment_id();
        manifest.segments.push(SegmentEntry {
            id,
            file_name: segment_file_name(id),
            generation: 3,
            covered: vec![0, 2],
            bytes: Some(128),
        });
        manifest.last_generation = 3;
        save_manifest(dir.path(), &manifest).unwrap();

        let loaded = load_manifest(dir.path()).unwrap().unwrap();
        assert!(loaded.is_compatible());
        assert_eq!(loaded.last_generation, 3);
        assert_eq!(loaded.segments.len(), 1);
        assert_eq!(loaded.segments[0].covered, vec![0, 2]);
    }

    #[test]
    fn missing_manifest_is_none() {
        let dir = tempfile::TempDir::new().unwrap();
        assert!(load_manifest(dir.path()).unwrap().is_none());
    }
}
