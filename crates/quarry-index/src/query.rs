use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use quarry_core::FileId;

/// A caller-supplied filter over which files' contributions are visible in a
/// query result (e.g. "this project" vs "this project + libraries").
///
/// Scopes are applied to reverse-bucket results after the store lookup; the
/// engine never stores scope-filtered views. The same scope also bounds how
/// much backlog `ensure_up_to_date` drains before answering, which is what
/// keeps lazily-updated indexes cheap to query narrowly.
#[derive(Clone)]
pub enum Scope {
    Everything,
    Files(Arc<BTreeSet<FileId>>),
    Predicate(Arc<dyn Fn(FileId) -> bool + Send + Sync>),
}

impl Scope {
    pub fn everything() -> Self {
        Scope::Everything
    }

    pub fn files(files: impl IntoIterator<Item = FileId>) -> Self {
        Scope::Files(Arc::new(files.into_iter().collect()))
    }

    pub fn predicate(predicate: impl Fn(FileId) -> bool + Send + Sync + 'static) -> Self {
        Scope::Predicate(Arc::new(predicate))
    }

    pub fn contains(&self, file: FileId) -> bool {
        match self {
            Scope::Everything => true,
            Scope::Files(files) => files.contains(&file),
            Scope::Predicate(predicate) => predicate(file),
        }
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Everything => f.write_str("Scope::Everything"),
            Scope::Files(files) => f.debug_tuple("Scope::Files").field(files).finish(),
            Scope::Predicate(_) => f.write_str("Scope::Predicate(..)"),
        }
    }
}
