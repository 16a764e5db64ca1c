use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use quarry_core::{ChangeKind, FileId, FileMeta};
use quarry_cache::FingerprintMode;

use crate::catalog::IndexSlot;
use crate::definition::IndexId;
use crate::error::IndexError;
use crate::query::Scope;
use crate::recovery::RecoveryController;
use crate::source::{ContentSource, FileContent};

/// When index updates are applied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UpdatePolicy {
    /// Process changes as they arrive. Keeps queries instant at the cost of
    /// extracting on every change, even for indexes nobody is querying.
    Eager,
    /// Defer work until a query needs the index, then drain only the files
    /// in that query's scope. The default: most indexes are queried far less
    /// often than files change.
    #[default]
    Lazy,
}

/// One coalesced pending change for one file.
#[derive(Debug, Clone)]
pub(crate) struct PendingChange {
    pub meta: FileMeta,
    pub kind: ChangeKind,
    pub content: Option<Vec<u8>>,
}

/// Per-index queue of pending changes, coalesced per file.
///
/// A later event for a file replaces its pending entry in place, keeping the
/// file's original queue position: per-file application order equals
/// observation order, while unrelated files may drain in any order.
#[derive(Debug, Default)]
pub(crate) struct Backlog {
    order: VecDeque<FileId>,
    pending: HashMap<FileId, PendingChange>,
}

impl Backlog {
    fn push(&mut self, change: PendingChange) {
        let file = change.meta.id;
        if self.pending.insert(file, change).is_none() {
            self.order.push_back(file);
        }
    }

    fn push_front(&mut self, change: PendingChange) {
        let file = change.meta.id;
        if self.pending.insert(file, change).is_none() {
            self.order.push_front(file);
        }
    }

    fn take_matching(&mut self, scope: &Scope) -> Vec<PendingChange> {
        let mut taken = Vec::new();
        let mut remaining = VecDeque::new();
        while let Some(file) = self.order.pop_front() {
            if scope.contains(file) {
                if let Some(change) = self.pending.remove(&file) {
                    taken.push(change);
                }
            } else {
                remaining.push_back(file);
            }
        }
        self.order = remaining;
        taken
    }

    fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Drives re-extraction and store mutation.
///
/// The scheduler is the only writer: for each index, drains run under the
/// slot's write lock, so mutation is logically single-threaded per index no
/// matter how many query threads trigger catch-up concurrently.
pub(crate) struct UpdateScheduler {
    source: Arc<dyn ContentSource>,
    fingerprint_mode: FingerprintMode,
    recovery: Arc<RecoveryController>,
    backlogs: Mutex<BTreeMap<IndexId, Backlog>>,
}

impl UpdateScheduler {
    pub(crate) fn new(
        source: Arc<dyn ContentSource>,
        fingerprint_mode: FingerprintMode,
        recovery: Arc<RecoveryController>,
    ) -> Self {
        Self {
            source,
            fingerprint_mode,
            recovery,
            backlogs: Mutex::new(BTreeMap::new()),
        }
    }

    pub(crate) fn enqueue(&self, id: &IndexId, change: PendingChange) {
        self.backlogs
            .lock()
            .entry(id.clone())
            .or_default()
            .push(change);
    }

    pub(crate) fn backlog_is_empty(&self, id: &IndexId) -> bool {
        self.backlogs
            .lock()
            .get(id)
            .map(Backlog::is_empty)
            .unwrap_or(true)
    }

    /// Forget every pending change for `id` (used when a rebuild re-enqueues
    /// the full applicable file set anyway).
    pub(crate) fn clear_backlog(&self, id: &IndexId) {
        self.backlogs.lock().remove(id);
    }

    /// Applies every pending change for `slot` whose file lies in `scope`,
    /// then durably flushes the store.
    ///
    /// Changes outside the scope stay queued. Transient read failures leave
    /// the affected file queued for the next drain; they never fail the
    /// drain.
    pub(crate) fn drain(&self, slot: &IndexSlot, scope: &Scope) -> Result<(), IndexError> {
        let id = slot.definition.id();
        let batch = {
            let mut backlogs = self.backlogs.lock();
            match backlogs.get_mut(id) {
                Some(backlog) => backlog.take_matching(scope),
                None => return Ok(()),
            }
        };
        if batch.is_empty() {
            return Ok(());
        }

        let _writer = slot.write_lock.lock();
        for change in batch {
            if let Some(requeue) = self.apply(slot, change)? {
                self.backlogs
                    .lock()
                    .entry(id.clone())
                    .or_default()
                    .push_front(requeue);
            }
        }
        slot.store.flush()?;
        Ok(())
    }

    /// Applies one change. Returns the change back when it must be retried
    /// later (transient read failure).
    fn apply(
        &self,
        slot: &IndexSlot,
        change: PendingChange,
    ) -> Result<Option<PendingChange>, IndexError> {
        let file = change.meta.id;

        if change.kind.is_removal() {
            slot.store.remove(file)?;
            return Ok(None);
        }

        let content = match self.source.read(&change.meta) {
            Ok(Some(content)) => content,
            Ok(None) => {
                // Gone between notification and read: the oracle reports
                // "changed", so deletion logic runs rather than trusting
                // stale facts.
                slot.store.remove(file)?;
                return Ok(None);
            }
            Err(err) => match change.content.clone() {
                Some(bytes) => FileContent {
                    stamp: change.meta.stamp,
                    bytes,
                },
                None => {
                    tracing::debug!(
                        target = "quarry.scheduler",
                        index = %slot.definition.id(),
                        %file,
                        error = %err,
                        "transient read failure; keeping file queued"
                    );
                    return Ok(Some(change));
                }
            },
        };

        let fingerprint = self
            .fingerprint_mode
            .fingerprint(content.stamp, &content.bytes);
        if let Some(previous) = slot.store.fingerprint_of(file)? {
            if !quarry_cache::is_changed(Some(&fingerprint), &previous) {
                return Ok(None);
            }
        }

        let extraction = slot.definition.extract(file, &content.bytes);
        if extraction.soft_failure {
            self.recovery.note_soft_failure(slot.definition.id(), file);
        }
        slot.store.put(file, fingerprint, extraction.facts)?;
        Ok(None)
    }
}
