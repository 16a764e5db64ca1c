use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::error::CacheError;

const MAX_READABLE_PREFIX: usize = 40;

/// On-disk layout for one engine's persisted indexes.
///
/// ```text
/// <root>/
///   .lock                       process-exclusive store lock
///   <index-dir>/                one directory per registered index
///     stamp.json                version stamp record
///     base.idx                  full snapshot archive
///     segments/
///       manifest.json
///       seg-000001.idx          delta segments, oldest first
/// ```
///
/// Index directory names are derived from the index id: a sanitized readable
/// prefix plus a short hash so arbitrary ids never escape the root or
/// collide after sanitization.
#[derive(Clone, Debug)]
pub struct StoreDir {
    root: PathBuf,
}

impl StoreDir {
    pub fn new(root: impl AsRef<Path>) -> Result<Self, CacheError> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn lock_path(&self) -> PathBuf {
        self.root.join(".lock")
    }

    pub fn index_dir(&self, index_id: &str) -> PathBuf {
        self.root.join(dir_name_for(index_id))
    }
}

fn dir_name_for(index_id: &str) -> String {
    let mut readable: String = index_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '-'
            }
        })
        .take(MAX_READABLE_PREFIX)
        .collect();
    if readable.is_empty() {
        readable.push_str("index");
    }

    let digest = Sha256::digest(index_id.as_bytes());
    format!("{readable}-{}", &hex::encode(digest)[..8])
}
