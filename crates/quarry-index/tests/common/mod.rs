use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use quarry_core::{ChangeKind, FileEvent, FileId, FileMeta, FileStamp};
use quarry_index::{
    extension_filter, EngineConfig, Extraction, Fact, IndexDefinition, IndexEngine, MemorySource,
    Payload, UpdatePolicy,
};

/// Counts extractor invocations so tests can observe when extraction is
/// skipped (fingerprint unchanged) vs re-run.
#[derive(Debug, Default)]
pub struct ExtractCounter(AtomicU32);

impl ExtractCounter {
    pub fn get(&self) -> u32 {
        self.0.load(Ordering::SeqCst)
    }

    pub fn bump(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

/// An index of `ng*` identifiers → their byte offsets, in the spirit of a
/// directive-declaration index. Content containing the token `BROKEN`
/// simulates malformed source and soft-fails.
pub fn directives_index(version: u32, counter: Arc<ExtractCounter>) -> IndexDefinition {
    IndexDefinition::new(
        "directives",
        version,
        extension_filter(&["js"]),
        Arc::new(move |_file, content: &[u8]| {
            counter.bump();
            let Ok(text) = std::str::from_utf8(content) else {
                return Extraction::soft_failure();
            };
            if text.contains("BROKEN") {
                return Extraction::soft_failure();
            }

            let mut facts = Vec::new();
            for (offset, token) in identifiers(text) {
                if token.starts_with("ng") {
                    facts.push(Fact::new(token, Payload::from_offset(offset as u32)));
                }
            }
            Extraction::from_facts(facts)
        }),
    )
}

/// A pure set-membership index: every identifier in a `.js` file is a key.
pub fn words_index(version: u32) -> IndexDefinition {
    IndexDefinition::new(
        "words",
        version,
        extension_filter(&["js"]),
        Arc::new(|_file, content: &[u8]| {
            let Ok(text) = std::str::from_utf8(content) else {
                return Extraction::soft_failure();
            };
            let facts = identifiers(text)
                .map(|(_, token)| Fact::key_only(token))
                .collect();
            Extraction::from_facts(facts)
        }),
    )
}

fn identifiers(text: &str) -> impl Iterator<Item = (usize, &str)> {
    let mut chars = text.char_indices().peekable();
    std::iter::from_fn(move || {
        while let Some((start, c)) = chars.next() {
            if !(c.is_ascii_alphanumeric() || c == '_') {
                continue;
            }
            let mut end = start + c.len_utf8();
            while let Some(&(idx, next)) = chars.peek() {
                if next.is_ascii_alphanumeric() || next == '_' {
                    chars.next();
                    end = idx + next.len_utf8();
                } else {
                    break;
                }
            }
            return Some((start, &text[start..end]));
        }
        None
    })
}

/// A throwaway engine plus its content source and store root. `restart`
/// reopens the same store root with a fresh engine, as after a process
/// restart; the in-memory source survives so "unchanged files" stay
/// readable.
pub struct Fixture {
    pub source: Arc<MemorySource>,
    pub engine: IndexEngine,
    root: PathBuf,
    _dir: Arc<tempfile::TempDir>,
}

impl Fixture {
    pub fn new(definitions: Vec<IndexDefinition>) -> Self {
        Self::with_policy(definitions, UpdatePolicy::Lazy)
    }

    pub fn with_policy(definitions: Vec<IndexDefinition>, policy: UpdatePolicy) -> Self {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();

        let dir = Arc::new(tempfile::TempDir::new().unwrap());
        let root = dir.path().join("store");
        let source = Arc::new(MemorySource::new());
        let engine = IndexEngine::new(
            EngineConfig::new(&root).with_update_policy(policy),
            source.clone(),
            definitions,
        )
        .unwrap();
        Self {
            source,
            engine,
            root,
            _dir: dir,
        }
    }

    pub fn root(&self) -> &std::path::Path {
        &self.root
    }

    pub fn restart(self, definitions: Vec<IndexDefinition>, policy: UpdatePolicy) -> Self {
        let Fixture {
            source,
            engine,
            root,
            _dir,
        } = self;
        drop(engine);

        let engine = IndexEngine::new(
            EngineConfig::new(&root).with_update_policy(policy),
            source.clone(),
            definitions,
        )
        .unwrap();
        Self {
            source,
            engine,
            root,
            _dir,
        }
    }

    /// Writes content into the source and returns the matching `FileMeta`.
    pub fn file(&self, id: u32, path: &str, content: &str) -> FileMeta {
        let id = FileId::from_raw(id);
        let stamp = self.source.write(id, content);
        FileMeta::new(id, path, stamp)
    }

    pub fn modify(&self, meta: &FileMeta, content: &str) -> FileMeta {
        let stamp = self.source.write(meta.id, content);
        let meta = FileMeta::new(meta.id, meta.path.clone(), stamp);
        self.engine
            .apply_event(FileEvent::new(meta.clone(), ChangeKind::Modified))
            .unwrap();
        meta
    }

    pub fn delete(&self, meta: &FileMeta) {
        self.source.delete(meta.id);
        let mut meta = meta.clone();
        meta.stamp = FileStamp::default();
        self.engine
            .apply_event(FileEvent::new(meta, ChangeKind::Deleted))
            .unwrap();
    }
}
