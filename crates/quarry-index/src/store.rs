use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use parking_lot::RwLock;
use quarry_cache::{CacheError, Fingerprint};
use quarry_core::FileId;
use quarry_storage::{write_archive_atomic, ArtifactKind, Compression, PersistedArchive};
use serde::{Deserialize, Serialize};

use crate::definition::{normalize_facts, Fact, IndexId, Payload};
use crate::error::IndexError;
use crate::recovery::RebuildReason;
use crate::segments::{
    clear_segments, load_manifest, save_manifest, segment_file_name, segment_path, SegmentEntry,
    SegmentManifest,
};

// Bump whenever the on-disk format or its interpretation changes. This
// intentionally invalidates existing persisted indexes so Quarry rebuilds
// them instead of attempting a migration.
pub(crate) const STORE_FORMAT_VERSION: u32 = 1;

const STAMP_FILE: &str = "stamp.json";
const BASE_FILE: &str = "base.idx";

const MAX_SEGMENTS_BEFORE_COMPACTION: usize = 32;
const MAX_SEGMENT_BYTES_BEFORE_COMPACTION: u64 = 64 * 1024 * 1024;

/// The per-index version stamp record, compared on every open. Any mismatch
/// means the persisted data is discarded wholesale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct VersionStamp {
    format_version: u32,
    extractor_version: u32,
    quarry_version: String,
}

impl VersionStamp {
    fn current(extractor_version: u32) -> Self {
        Self {
            format_version: STORE_FORMAT_VERSION,
            extractor_version,
            quarry_version: quarry_core::QUARRY_VERSION.to_string(),
        }
    }
}

/// Facts one file contributed, plus the fingerprint its content had when
/// they were extracted.
#[derive(
    Clone,
    Debug,
    PartialEq,
    Eq,
    rkyv::Archive,
    rkyv::Serialize,
    rkyv::Deserialize,
)]
#[archive(check_bytes)]
pub(crate) struct FileFacts {
    pub fingerprint: Fingerprint,
    pub facts: Vec<Fact>,
}

/// The archived forward index: file → (fingerprint, facts). Used both for
/// the base snapshot and for delta segments (where it holds only the files a
/// flush touched). The reverse index is derived from this on load and never
/// persisted, so forward and reverse state cannot disagree on disk.
#[derive(
    Clone,
    Debug,
    Default,
    PartialEq,
    Eq,
    rkyv::Archive,
    rkyv::Serialize,
    rkyv::Deserialize,
)]
#[archive(check_bytes)]
pub(crate) struct IndexSnapshot {
    pub generation: u64,
    pub entries: BTreeMap<u32, FileFacts>,
}

#[derive(Debug, Default)]
struct Loaded {
    /// Bumped on every mutation that changed observable state. A `put` with
    /// an identical fingerprint + fact set leaves it untouched.
    generation: u64,
    entries: BTreeMap<FileId, FileFacts>,
    reverse: BTreeMap<String, Vec<(FileId, Payload)>>,
    /// Files mutated since the last flush; the next flush writes exactly
    /// these as one delta segment (tombstones included).
    dirty: BTreeSet<FileId>,
}

impl Loaded {
    fn from_snapshot(snapshot: IndexSnapshot) -> Self {
        let entries: BTreeMap<FileId, FileFacts> = snapshot
            .entries
            .into_iter()
            .map(|(raw, facts)| (FileId::from_raw(raw), facts))
            .collect();

        let mut reverse: BTreeMap<String, Vec<(FileId, Payload)>> = BTreeMap::new();
        for (&file, entry) in &entries {
            for fact in &entry.facts {
                reverse
                    .entry(fact.key.clone())
                    .or_default()
                    .push((file, fact.payload.clone()));
            }
        }
        for bucket in reverse.values_mut() {
            bucket.sort();
        }

        Self {
            generation: snapshot.generation,
            entries,
            reverse,
            dirty: BTreeSet::new(),
        }
    }

    fn insert_reverse(&mut self, file: FileId, facts: &[Fact]) {
        for fact in facts {
            let bucket = self.reverse.entry(fact.key.clone()).or_default();
            let item = (file, fact.payload.clone());
            if let Err(pos) = bucket.binary_search(&item) {
                bucket.insert(pos, item);
            }
        }
    }

    fn remove_reverse(&mut self, file: FileId, facts: &[Fact]) {
        for fact in facts {
            if let Some(bucket) = self.reverse.get_mut(&fact.key) {
                bucket.retain(|(f, payload)| *f != file || payload != &fact.payload);
                if bucket.is_empty() {
                    self.reverse.remove(&fact.key);
                }
            }
        }
    }
}

/// What `IndexStore::open` found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenOutcome {
    /// The persisted stamp matches; stored entries are trusted, though files
    /// still go through fingerprint validation before being believed fresh.
    Trusted,
    /// The persisted store (if any) was discarded; every applicable file
    /// needs extraction from scratch.
    NeedsRebuild(RebuildReason),
}

/// Whether a `put` changed anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Updated,
    /// Fingerprint and facts were identical to the stored entry; nothing
    /// moved, the generation counter is untouched.
    Unchanged,
}

/// The durable multimap behind one index: file → (fingerprint, facts) plus
/// the derived key → (file, payload) reverse buckets.
///
/// Writes are serialized by the scheduler (one logical writer per index);
/// reads are concurrent and return owned copies, so readers never observe a
/// torn mutation. Opening is cheap: entries are materialized lazily on first
/// access.
#[derive(Debug)]
pub struct IndexStore {
    id: IndexId,
    dir: PathBuf,
    extractor_version: u32,
    state: RwLock<Option<Loaded>>,
}

impl IndexStore {
    /// Opens (or initializes) the persisted store for `id` at `dir`.
    ///
    /// Version-stamp comparison happens here; on any mismatch the persisted
    /// data is dropped immediately and the outcome reports the rebuild.
    pub fn open(
        dir: impl Into<PathBuf>,
        id: IndexId,
        extractor_version: u32,
    ) -> Result<(Self, OpenOutcome), IndexError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;

        let store = Self {
            id,
            dir,
            extractor_version,
            state: RwLock::new(None),
        };

        let outcome = match store.read_stamp() {
            Ok(Some(stamp)) if stamp == VersionStamp::current(extractor_version) => {
                OpenOutcome::Trusted
            }
            Ok(Some(stamp)) => {
                let reason = if stamp.format_version != STORE_FORMAT_VERSION
                    || stamp.quarry_version != quarry_core::QUARRY_VERSION
                {
                    RebuildReason::Corruption(format!(
                        "incompatible store format (persisted format {} by quarry {})",
                        stamp.format_version, stamp.quarry_version
                    ))
                } else {
                    RebuildReason::VersionSkew {
                        persisted: stamp.extractor_version,
                        registered: extractor_version,
                    }
                };
                store.wipe()?;
                OpenOutcome::NeedsRebuild(reason)
            }
            Ok(None) => {
                store.wipe()?;
                OpenOutcome::NeedsRebuild(RebuildReason::Fresh)
            }
            Err(err) => {
                tracing::warn!(
                    target = "quarry.store",
                    index = %store.id,
                    error = %err,
                    "unreadable version stamp; discarding persisted index"
                );
                store.wipe()?;
                OpenOutcome::NeedsRebuild(RebuildReason::Corruption(format!(
                    "unreadable version stamp: {err}"
                )))
            }
        };

        Ok((store, outcome))
    }

    pub fn id(&self) -> &IndexId {
        &self.id
    }

    /// Atomically replaces the file's entry: the previous entry's facts leave
    /// every reverse bucket, the new facts enter, and the new fingerprint is
    /// recorded. Re-putting an identical entry is a no-op.
    pub fn put(
        &self,
        file: FileId,
        fingerprint: Fingerprint,
        mut facts: Vec<Fact>,
    ) -> Result<PutOutcome, IndexError> {
        self.ensure_loaded()?;
        normalize_facts(&mut facts);

        let mut guard = self.state.write();
        let loaded = guard.as_mut().expect("store loaded");

        if let Some(existing) = loaded.entries.get(&file) {
            if existing.fingerprint == fingerprint && existing.facts == facts {
                return Ok(PutOutcome::Unchanged);
            }
        }

        if let Some(old) = loaded.entries.remove(&file) {
            let old_facts = old.facts;
            loaded.remove_reverse(file, &old_facts);
        }
        loaded.insert_reverse(file, &facts);
        loaded.entries.insert(file, FileFacts { fingerprint, facts });
        loaded.generation += 1;
        loaded.dirty.insert(file);

        Ok(PutOutcome::Updated)
    }

    /// Removes the file's entry and all of its reverse-bucket contributions.
    /// Returns `false` when the file had no entry.
    pub fn remove(&self, file: FileId) -> Result<bool, IndexError> {
        self.ensure_loaded()?;

        let mut guard = self.state.write();
        let loaded = guard.as_mut().expect("store loaded");

        let Some(old) = loaded.entries.remove(&file) else {
            return Ok(false);
        };
        let old_facts = old.facts;
        loaded.remove_reverse(file, &old_facts);
        loaded.generation += 1;
        loaded.dirty.insert(file);
        Ok(true)
    }

    pub fn all_keys(&self) -> Result<BTreeSet<String>, IndexError> {
        self.ensure_loaded()?;
        let guard = self.state.read();
        let loaded = guard.as_ref().expect("store loaded");
        Ok(loaded.reverse.keys().cloned().collect())
    }

    pub fn files_for_key(&self, key: &str) -> Result<BTreeSet<FileId>, IndexError> {
        self.ensure_loaded()?;
        let guard = self.state.read();
        let loaded = guard.as_ref().expect("store loaded");
        Ok(loaded
            .reverse
            .get(key)
            .map(|bucket| bucket.iter().map(|(file, _)| *file).collect())
            .unwrap_or_default())
    }

    /// The full reverse bucket for `key`: every (file, payload) pair.
    pub fn find(&self, key: &str) -> Result<Vec<(FileId, Payload)>, IndexError> {
        self.ensure_loaded()?;
        let guard = self.state.read();
        let loaded = guard.as_ref().expect("store loaded");
        Ok(loaded.reverse.get(key).cloned().unwrap_or_default())
    }

    pub fn values_for_key_in_file(
        &self,
        key: &str,
        file: FileId,
    ) -> Result<Vec<Payload>, IndexError> {
        self.ensure_loaded()?;
        let guard = self.state.read();
        let loaded = guard.as_ref().expect("store loaded");
        Ok(loaded
            .reverse
            .get(key)
            .map(|bucket| {
                bucket
                    .iter()
                    .filter(|(f, _)| *f == file)
                    .map(|(_, payload)| payload.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    /// The fingerprint recorded when `file` was last extracted, if any. The
    /// scheduler compares this against the oracle's current fingerprint to
    /// decide whether re-extraction is needed.
    pub fn fingerprint_of(&self, file: FileId) -> Result<Option<Fingerprint>, IndexError> {
        self.ensure_loaded()?;
        let guard = self.state.read();
        let loaded = guard.as_ref().expect("store loaded");
        Ok(loaded.entries.get(&file).map(|entry| entry.fingerprint.clone()))
    }

    /// Files that currently have an entry in this index.
    pub fn indexed_files(&self) -> Result<BTreeSet<FileId>, IndexError> {
        self.ensure_loaded()?;
        let guard = self.state.read();
        let loaded = guard.as_ref().expect("store loaded");
        Ok(loaded.entries.keys().copied().collect())
    }

    /// Observable mutation counter; unchanged by no-op puts.
    pub fn generation(&self) -> Result<u64, IndexError> {
        self.ensure_loaded()?;
        let guard = self.state.read();
        let loaded = guard.as_ref().expect("store loaded");
        Ok(loaded.generation)
    }

    /// Durably persists everything mutated since the last flush as one delta
    /// segment. Returns `false` when there was nothing to write.
    ///
    /// The segment file lands via temp-file + rename before the manifest is
    /// updated, so a crash between the two leaves an orphan file the next
    /// open never reads — the store shows either the pre-flush or the
    /// post-flush state, never a mix.
    pub fn flush(&self) -> Result<bool, IndexError> {
        self.ensure_loaded()?;

        let mut guard = self.state.write();
        let loaded = guard.as_mut().expect("store loaded");
        if loaded.dirty.is_empty() {
            return Ok(false);
        }

        let covered: Vec<u32> = loaded.dirty.iter().map(|file| file.to_raw()).collect();
        let mut delta = IndexSnapshot {
            generation: loaded.generation,
            entries: BTreeMap::new(),
        };
        for file in &loaded.dirty {
            if let Some(entry) = loaded.entries.get(file) {
                delta.entries.insert(file.to_raw(), entry.clone());
            }
        }

        let mut manifest = match load_manifest(&self.dir)? {
            Some(manifest) if manifest.is_compatible() => manifest,
            Some(_) => {
                clear_segments(&self.dir)?;
                SegmentManifest::new()
            }
            None => SegmentManifest::new(),
        };

        let segment_id = manifest.allocate_segment_id();
        let file_name = segment_file_name(segment_id);
        let path = segment_path(&self.dir, &file_name);
        write_archive_atomic(
            &path,
            ArtifactKind::IndexSegment,
            STORE_FORMAT_VERSION,
            &delta,
            Compression::None,
        )?;
        let bytes = std::fs::metadata(&path).ok().map(|m| m.len());

        manifest.segments.push(SegmentEntry {
            id: segment_id,
            file_name,
            generation: loaded.generation,
            covered,
            bytes,
        });
        manifest.last_generation = loaded.generation;
        save_manifest(&self.dir, &manifest)?;

        loaded.dirty.clear();

        tracing::debug!(
            target = "quarry.store",
            index = %self.id,
            segment = segment_id,
            files = manifest.segments.last().map(|s| s.covered.len()).unwrap_or(0),
            "flushed delta segment"
        );

        let total_bytes: u64 = manifest
            .segments
            .iter()
            .map(|segment| segment.bytes.unwrap_or(0))
            .sum();
        if manifest.segments.len() > MAX_SEGMENTS_BEFORE_COMPACTION
            || total_bytes > MAX_SEGMENT_BYTES_BEFORE_COMPACTION
        {
            self.compact_locked(loaded)?;
        }

        Ok(true)
    }

    /// Folds the base and all segments into a fresh base snapshot and clears
    /// the segment directory. Equivalent state, fewer files to open.
    pub fn compact(&self) -> Result<(), IndexError> {
        self.ensure_loaded()?;
        let mut guard = self.state.write();
        let loaded = guard.as_mut().expect("store loaded");
        self.compact_locked(loaded)
    }

    fn compact_locked(&self, loaded: &Loaded) -> Result<(), IndexError> {
        let snapshot = IndexSnapshot {
            generation: loaded.generation,
            entries: loaded
                .entries
                .iter()
                .map(|(file, entry)| (file.to_raw(), entry.clone()))
                .collect(),
        };
        write_archive_atomic(
            &self.dir.join(BASE_FILE),
            ArtifactKind::IndexBase,
            STORE_FORMAT_VERSION,
            &snapshot,
            Compression::Zstd,
        )?;
        clear_segments(&self.dir)?;
        tracing::debug!(
            target = "quarry.store",
            index = %self.id,
            files = snapshot.entries.len(),
            "compacted segments into base snapshot"
        );
        Ok(())
    }

    /// Discards everything persisted and in memory for this index and writes
    /// a fresh version stamp. The store comes back empty at generation 0.
    pub fn wipe(&self) -> Result<(), IndexError> {
        let mut guard = self.state.write();

        if self.dir.exists() {
            std::fs::remove_dir_all(&self.dir)?;
        }
        std::fs::create_dir_all(&self.dir)?;
        self.write_stamp()?;

        *guard = Some(Loaded::default());
        Ok(())
    }

    fn ensure_loaded(&self) -> Result<(), IndexError> {
        if self.state.read().is_some() {
            return Ok(());
        }

        let mut guard = self.state.write();
        if guard.is_some() {
            return Ok(());
        }
        *guard = Some(self.load_from_disk()?);
        Ok(())
    }

    fn load_from_disk(&self) -> Result<Loaded, IndexError> {
        let base = PersistedArchive::<IndexSnapshot>::open_optional(
            &self.dir.join(BASE_FILE),
            ArtifactKind::IndexBase,
            STORE_FORMAT_VERSION,
        )?;
        let mut snapshot = match base {
            Some(archive) => archive.to_owned()?,
            None => IndexSnapshot::default(),
        };

        if let Some(manifest) = load_manifest(&self.dir)? {
            if !manifest.is_compatible() {
                return Err(IndexError::Corrupt {
                    message: format!(
                        "segment manifest format {} is incompatible",
                        manifest.format_version
                    ),
                });
            }
            if manifest.last_generation < snapshot.generation {
                return Err(IndexError::Corrupt {
                    message: "segment manifest is older than the base snapshot".to_string(),
                });
            }

            let mut last_segment_generation = None;
            for entry in &manifest.segments {
                let archive = PersistedArchive::<IndexSnapshot>::open(
                    &segment_path(&self.dir, &entry.file_name),
                    ArtifactKind::IndexSegment,
                    STORE_FORMAT_VERSION,
                )?;
                let delta = archive.to_owned()?;
                if delta.generation != entry.generation {
                    return Err(IndexError::Corrupt {
                        message: format!(
                            "segment {} disagrees with the manifest about its generation",
                            entry.id
                        ),
                    });
                }

                for raw in &entry.covered {
                    snapshot.entries.remove(raw);
                }
                snapshot.entries.extend(delta.entries);
                last_segment_generation = Some(delta.generation);
            }

            if let Some(last) = last_segment_generation {
                if last != manifest.last_generation {
                    return Err(IndexError::Corrupt {
                        message: "segment manifest disagrees with the newest segment".to_string(),
                    });
                }
            }
            snapshot.generation = snapshot.generation.max(manifest.last_generation);
        }

        Ok(Loaded::from_snapshot(snapshot))
    }

    fn read_stamp(&self) -> Result<Option<VersionStamp>, IndexError> {
        let path = self.dir.join(STAMP_FILE);
        let json = match std::fs::read_to_string(&path) {
            Ok(json) => json,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let stamp: VersionStamp = serde_json::from_str(&json).map_err(CacheError::from)?;
        Ok(Some(stamp))
    }

    fn write_stamp(&self) -> Result<(), IndexError> {
        let stamp = VersionStamp::current(self.extractor_version);
        let json = serde_json::to_string_pretty(&stamp).map_err(CacheError::from)?;
        let tmp = self
            .dir
            .join(format!("{STAMP_FILE}.tmp.{}", std::process::id()));
        std::fs::write(&tmp, json)?;
        match std::fs::rename(&tmp, self.dir.join(STAMP_FILE)) {
            Ok(()) => Ok(()),
            Err(err) => {
                let _ = std::fs::remove_file(&tmp);
                Err(err.into())
            }
        }
    }
}
