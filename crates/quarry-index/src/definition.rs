use std::fmt;
use std::sync::Arc;

use quarry_core::{FileId, FileMeta};
use serde::{Deserialize, Serialize};

/// Globally unique name of one index, e.g. `"angularjs.directives"`.
#[derive(
    Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct IndexId(String);

impl IndexId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IndexId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for IndexId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Index-specific per-fact data, opaque to the engine.
///
/// Extractors own the encoding and must keep it deterministic: the store
/// compares fact sets byte-for-byte to detect no-op re-extractions. Empty
/// payloads are the common case for pure set-membership indexes; a little-
/// endian `u32` byte offset is common enough to get helpers.
#[derive(
    Clone,
    Debug,
    Default,
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
pub struct Payload(Vec<u8>);

impl Payload {
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn from_offset(offset: u32) -> Self {
        Self(offset.to_le_bytes().to_vec())
    }

    pub fn as_offset(&self) -> Option<u32> {
        let bytes: [u8; 4] = self.0.as_slice().try_into().ok()?;
        Some(u32::from_le_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// One (key, payload) pair produced by an extractor for one file.
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
pub struct Fact {
    pub key: String,
    pub payload: Payload,
}

impl Fact {
    pub fn new(key: impl Into<String>, payload: Payload) -> Self {
        Self {
            key: key.into(),
            payload,
        }
    }

    /// A pure set-membership fact with an empty payload.
    pub fn key_only(key: impl Into<String>) -> Self {
        Self::new(key, Payload::empty())
    }
}

/// Sorts and deduplicates a fact list into the canonical form the store
/// compares against.
pub(crate) fn normalize_facts(facts: &mut Vec<Fact>) {
    facts.sort();
    facts.dedup();
}

/// The outcome of running an extractor over one file's content.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Extraction {
    pub facts: Vec<Fact>,
    /// Set when the content was malformed and extraction bailed out. The file
    /// is still marked indexed (with whatever facts were produced, usually
    /// none) so it is not retried until its content changes; the recovery
    /// controller keeps the failure for diagnostics.
    pub soft_failure: bool,
}

impl Extraction {
    pub fn from_facts(mut facts: Vec<Fact>) -> Self {
        normalize_facts(&mut facts);
        Self {
            facts,
            soft_failure: false,
        }
    }

    pub fn soft_failure() -> Self {
        Self {
            facts: Vec::new(),
            soft_failure: true,
        }
    }
}

/// Applicability filter: which files an index wants to see.
pub type FileFilter = Arc<dyn Fn(&FileMeta) -> bool + Send + Sync>;

/// The extraction function: pure over `(file id, content bytes)`.
///
/// Must be deterministic (its output is cached keyed on the content
/// fingerprint and reused across sessions) and must not share mutable state
/// across invocations (extraction runs concurrently for independent files).
pub type ExtractFn = Arc<dyn Fn(FileId, &[u8]) -> Extraction + Send + Sync>;

/// Matches files whose name ends with one of `extensions` (without dots).
pub fn extension_filter(extensions: &[&str]) -> FileFilter {
    let extensions: Vec<String> = extensions.iter().map(|e| e.to_string()).collect();
    Arc::new(move |meta: &FileMeta| {
        meta.extension()
            .is_some_and(|ext| extensions.iter().any(|e| e == ext))
    })
}

/// Everything a plugin registers for one index: identity, extractor version,
/// applicability filter, and the extractor itself.
///
/// Registered once per process into an [`crate::IndexCatalog`]; immutable
/// thereafter. Any change to extraction semantics requires bumping `version`,
/// which invalidates the persisted store and forces a rebuild instead of
/// silently mixing fact formats.
#[derive(Clone)]
pub struct IndexDefinition {
    id: IndexId,
    version: u32,
    filter: FileFilter,
    extract: ExtractFn,
}

impl IndexDefinition {
    pub fn new(
        id: impl Into<IndexId>,
        version: u32,
        filter: FileFilter,
        extract: ExtractFn,
    ) -> Self {
        Self {
            id: id.into(),
            version,
            filter,
            extract,
        }
    }

    pub fn id(&self) -> &IndexId {
        &self.id
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn applies_to(&self, meta: &FileMeta) -> bool {
        (self.filter)(meta)
    }

    /// Runs the extractor, containing panics as soft failures so malformed
    /// content can never take down the scheduler.
    pub fn extract(&self, file: FileId, content: &[u8]) -> Extraction {
        match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            (self.extract)(file, content)
        })) {
            Ok(mut extraction) => {
                normalize_facts(&mut extraction.facts);
                extraction
            }
            Err(panic) => {
                tracing::warn!(
                    target = "quarry.index",
                    index = %self.id,
                    %file,
                    panic = %panic_payload_to_str(&*panic),
                    "extractor panicked; treating as soft failure"
                );
                Extraction::soft_failure()
            }
        }
    }
}

impl fmt::Debug for IndexDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexDefinition")
            .field("id", &self.id)
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

fn panic_payload_to_str(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "<non-string panic payload>"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_core::FileStamp;

    fn meta(path: &str) -> FileMeta {
        FileMeta::new(FileId::from_raw(0), path, FileStamp::default())
    }

    #[test]
    fn extraction_normalizes_facts() {
        let extraction = Extraction::from_facts(vec![
            Fact::key_only("b"),
            Fact::key_only("a"),
            Fact::key_only("b"),
        ]);
        assert_eq!(
            extraction.facts,
            vec![Fact::key_only("a"), Fact::key_only("b")]
        );
    }

    #[test]
    fn extension_filter_matches() {
        let filter = extension_filter(&["js", "ts"]);
        assert!(filter(&meta("src/app.js")));
        assert!(filter(&meta("src/app.ts")));
        assert!(!filter(&meta("src/app.rs")));
        assert!(!filter(&meta("Makefile")));
    }

    #[test]
    fn panicking_extractor_becomes_soft_failure() {
        let def = IndexDefinition::new(
            "panicky",
            1,
            Arc::new(|_: &FileMeta| true),
            Arc::new(|_, _: &[u8]| panic!("malformed")),
        );

        let extraction = def.extract(FileId::from_raw(1), b"x");
        assert!(extraction.soft_failure);
        assert!(extraction.facts.is_empty());
    }

    #[test]
    fn offset_payload_round_trips() {
        let payload = Payload::from_offset(12);
        assert_eq!(payload.as_offset(), Some(12));
        assert_eq!(Payload::empty().as_offset(), None);
    }
}
