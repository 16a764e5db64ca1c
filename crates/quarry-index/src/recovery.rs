use std::collections::{BTreeMap, VecDeque};
use std::fmt;

use parking_lot::Mutex;
use quarry_core::FileId;

use crate::catalog::{IndexSlot, IndexState};
use crate::definition::IndexId;
use crate::error::IndexError;

const RECENT_SOFT_FAILURES: usize = 32;

/// Why a persisted index is being discarded and rebuilt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RebuildReason {
    /// No persisted data existed yet.
    Fresh,
    /// The persisted extractor version does not match the registered one.
    VersionSkew { persisted: u32, registered: u32 },
    /// The persisted data failed a structural check (header, hash, framing).
    Corruption(String),
    /// An explicit rebuild request.
    Forced,
}

impl fmt::Display for RebuildReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RebuildReason::Fresh => write!(f, "no persisted index"),
            RebuildReason::VersionSkew {
                persisted,
                registered,
            } => write!(
                f,
                "extractor version skew (persisted {persisted}, registered {registered})"
            ),
            RebuildReason::Corruption(message) => write!(f, "corruption: {message}"),
            RebuildReason::Forced => write!(f, "forced rebuild"),
        }
    }
}

/// Soft-failure diagnostics for one index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SoftFailureReport {
    /// Total soft failures observed since process start.
    pub count: u64,
    /// The most recently affected files, newest last (bounded).
    pub recent: Vec<FileId>,
}

#[derive(Debug, Default)]
struct SoftFailures {
    count: u64,
    recent: VecDeque<FileId>,
}

/// Handles the cases where a persisted index can no longer be trusted, and
/// keeps diagnostics about extractor soft failures.
///
/// Recovery is always wholesale: the affected store is discarded entirely and
/// re-extracted from current content. Partial repair risks silently wrong
/// query results, which is strictly worse than a visible rebuild.
#[derive(Debug, Default)]
pub(crate) struct RecoveryController {
    soft_failures: Mutex<BTreeMap<IndexId, SoftFailures>>,
}

impl RecoveryController {
    /// Record an extractor soft failure (malformed content). The file stays
    /// marked as indexed so there is no retry storm; this is diagnostics
    /// only.
    pub(crate) fn note_soft_failure(&self, id: &IndexId, file: FileId) {
        tracing::warn!(
            target = "quarry.recovery",
            index = %id,
            %file,
            "extractor soft failure; file indexed with empty fact set"
        );

        let mut map = self.soft_failures.lock();
        let entry = map.entry(id.clone()).or_default();
        entry.count += 1;
        entry.recent.push_back(file);
        while entry.recent.len() > RECENT_SOFT_FAILURES {
            entry.recent.pop_front();
        }
    }

    pub(crate) fn soft_failures(&self, id: &IndexId) -> SoftFailureReport {
        let map = self.soft_failures.lock();
        map.get(id)
            .map(|entry| SoftFailureReport {
                count: entry.count,
                recent: entry.recent.iter().copied().collect(),
            })
            .unwrap_or_default()
    }

    /// Discard `slot`'s persisted store and move it to `Rebuilding`.
    ///
    /// The caller re-enqueues every applicable file afterwards; until the
    /// backlog drains, queries against this index block in
    /// `ensure_up_to_date`.
    pub(crate) fn begin_rebuild(
        &self,
        slot: &IndexSlot,
        reason: &RebuildReason,
    ) -> Result<(), IndexError> {
        tracing::warn!(
            target = "quarry.recovery",
            index = %slot.definition.id(),
            %reason,
            "discarding persisted index for rebuild"
        );

        slot.store.wipe()?;
        slot.set_state(IndexState::Rebuilding);
        Ok(())
    }
}
