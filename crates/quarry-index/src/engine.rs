use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::RwLock;
use quarry_cache::{FingerprintMode, StoreDir, StoreLock};
use quarry_core::{ChangeKind, FileEvent, FileId, FileMeta};

use crate::catalog::{IndexCatalog, IndexSlot, IndexState};
use crate::definition::{IndexDefinition, IndexId, Payload};
use crate::error::IndexError;
use crate::query::Scope;
use crate::recovery::{RebuildReason, RecoveryController, SoftFailureReport};
use crate::scheduler::{PendingChange, UpdatePolicy, UpdateScheduler};
use crate::source::ContentSource;

/// Engine construction knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Root directory for all persisted indexes of this engine. Exclusively
    /// owned by one process at a time (enforced with a file lock).
    pub store_root: PathBuf,
    pub fingerprint_mode: FingerprintMode,
    pub update_policy: UpdatePolicy,
}

impl EngineConfig {
    pub fn new(store_root: impl Into<PathBuf>) -> Self {
        Self {
            store_root: store_root.into(),
            fingerprint_mode: FingerprintMode::default(),
            update_policy: UpdatePolicy::default(),
        }
    }

    pub fn with_fingerprint_mode(mut self, mode: FingerprintMode) -> Self {
        self.fingerprint_mode = mode;
        self
    }

    pub fn with_update_policy(mut self, policy: UpdatePolicy) -> Self {
        self.update_policy = policy;
        self
    }
}

/// The incremental symbol index engine: catalog + scheduler + recovery +
/// query surface behind one facade.
///
/// Hosts construct one engine per project context (several isolated engines
/// per process are fine), register every index definition up front, feed the
/// initial enumeration through [`IndexEngine::initialize`], and then deliver
/// change notifications either directly ([`IndexEngine::apply_event`]) or
/// through the channel returned by [`IndexEngine::event_sender`].
///
/// Reads ([`IndexEngine::find`], [`IndexEngine::all_keys`]) first catch the
/// index up for the files in the query's scope, so results reflect every
/// change delivered before the call; changes racing with the call may or may
/// not be reflected, but a result is never torn. A caller that abandons a
/// query simply drops the result — work already applied stays applied.
pub struct IndexEngine {
    catalog: IndexCatalog,
    scheduler: UpdateScheduler,
    recovery: Arc<RecoveryController>,
    policy: UpdatePolicy,
    files: RwLock<BTreeMap<FileId, FileMeta>>,
    event_tx: Sender<FileEvent>,
    event_rx: Receiver<FileEvent>,
    _lock: StoreLock,
}

impl IndexEngine {
    /// Opens every registered index's persisted store under
    /// `config.store_root` and wires the engine together.
    ///
    /// Indexes whose store is missing, version-skewed, or corrupt start in
    /// [`IndexState::Rebuilding`]; the rest start in
    /// [`IndexState::Validating`]. Actual extraction work begins once
    /// [`IndexEngine::initialize`] supplies the file enumeration.
    pub fn new(
        config: EngineConfig,
        source: Arc<dyn ContentSource>,
        definitions: Vec<IndexDefinition>,
    ) -> Result<Self, IndexError> {
        let store_dir = StoreDir::new(&config.store_root)?;
        let lock = StoreLock::lock_exclusive(&store_dir.lock_path())?;

        let recovery = Arc::new(RecoveryController::default());
        let (catalog, rebuilds) = IndexCatalog::open(&store_dir, definitions)?;
        for (slot, reason) in &rebuilds {
            tracing::info!(
                target = "quarry.engine",
                index = %slot.definition.id(),
                %reason,
                "index will be rebuilt from scratch"
            );
        }

        let scheduler = UpdateScheduler::new(source, config.fingerprint_mode, recovery.clone());
        let (event_tx, event_rx) = crossbeam_channel::unbounded();

        Ok(Self {
            catalog,
            scheduler,
            recovery,
            policy: config.update_policy,
            files: RwLock::new(BTreeMap::new()),
            event_tx,
            event_rx,
            _lock: lock,
        })
    }

    /// Supplies the initial project-wide file enumeration and queues every
    /// applicable file for validation (or extraction, for rebuilding
    /// indexes). Under [`UpdatePolicy::Eager`] the queue drains before this
    /// returns; under lazy the work waits for the first query.
    pub fn initialize(&self, enumeration: Vec<FileMeta>) -> Result<(), IndexError> {
        {
            let mut files = self.files.write();
            files.clear();
            for meta in enumeration {
                files.insert(meta.id, meta);
            }
        }

        for slot in self.catalog.slots() {
            self.enqueue_all_applicable(slot);
        }

        if self.policy == UpdatePolicy::Eager {
            self.flush()?;
        }
        Ok(())
    }

    /// A clonable sender for change notifications. Events queue here and are
    /// absorbed at the next query/flush, which lets filesystem watcher
    /// threads feed the engine without holding any engine lock.
    pub fn event_sender(&self) -> Sender<FileEvent> {
        self.event_tx.clone()
    }

    /// Applies one change notification now.
    pub fn apply_event(&self, event: FileEvent) -> Result<(), IndexError> {
        self.absorb_events();
        self.apply_event_inner(event);
        if self.policy == UpdatePolicy::Eager {
            self.catch_up_all()?;
        }
        Ok(())
    }

    pub fn index_ids(&self) -> Vec<IndexId> {
        self.catalog.ids()
    }

    pub fn state(&self, id: &IndexId) -> Result<IndexState, IndexError> {
        Ok(self.catalog.slot(id)?.state())
    }

    /// Soft-failure diagnostics recorded for `id` since process start.
    pub fn soft_failures(&self, id: &IndexId) -> Result<SoftFailureReport, IndexError> {
        self.catalog.slot(id)?;
        Ok(self.recovery.soft_failures(id))
    }

    /// Blocks until `id` reflects every change delivered before this call,
    /// restricted to files in `scope` (the whole backlog while the index is
    /// rebuilding). This is the suspension point queries run through.
    pub fn ensure_up_to_date(&self, id: &IndexId, scope: &Scope) -> Result<(), IndexError> {
        self.absorb_events();
        let slot = Arc::clone(self.catalog.slot(id)?);
        self.catch_up(&slot, scope)
    }

    /// All keys with at least one contribution from a file in `scope`.
    pub fn all_keys(&self, id: &IndexId, scope: &Scope) -> Result<BTreeSet<String>, IndexError> {
        self.ensure_up_to_date(id, scope)?;
        let slot = self.catalog.slot(id)?;

        if matches!(scope, Scope::Everything) {
            return slot.store.all_keys();
        }
        let mut keys = BTreeSet::new();
        for key in slot.store.all_keys()? {
            let files = slot.store.files_for_key(&key)?;
            if files.iter().any(|&file| scope.contains(file)) {
                keys.insert(key);
            }
        }
        Ok(keys)
    }

    /// Every (file, payload) pair declaring `key`, filtered to `scope`.
    pub fn find(
        &self,
        id: &IndexId,
        key: &str,
        scope: &Scope,
    ) -> Result<Vec<(FileId, Payload)>, IndexError> {
        self.ensure_up_to_date(id, scope)?;
        let slot = self.catalog.slot(id)?;
        Ok(slot
            .store
            .find(key)?
            .into_iter()
            .filter(|&(file, _)| scope.contains(file))
            .collect())
    }

    /// The files in `scope` declaring `key`.
    pub fn files_for_key(
        &self,
        id: &IndexId,
        key: &str,
        scope: &Scope,
    ) -> Result<BTreeSet<FileId>, IndexError> {
        self.ensure_up_to_date(id, scope)?;
        let slot = self.catalog.slot(id)?;
        Ok(slot
            .store
            .files_for_key(key)?
            .into_iter()
            .filter(|&file| scope.contains(file))
            .collect())
    }

    /// Drains every backlog and durably flushes every store.
    pub fn flush(&self) -> Result<(), IndexError> {
        self.absorb_events();
        self.catch_up_all()
    }

    /// Administrative command: discard and re-extract one index (or all of
    /// them for `None`).
    pub fn force_rebuild(&self, target: Option<&IndexId>) -> Result<(), IndexError> {
        self.absorb_events();

        let slots: Vec<Arc<IndexSlot>> = match target {
            Some(id) => vec![Arc::clone(self.catalog.slot(id)?)],
            None => self.catalog.slots().cloned().collect(),
        };

        for slot in &slots {
            {
                let _writer = slot.write_lock.lock();
                self.recovery.begin_rebuild(slot, &RebuildReason::Forced)?;
            }
            self.scheduler.clear_backlog(slot.definition.id());
            self.enqueue_all_applicable(slot);
        }

        if self.policy == UpdatePolicy::Eager {
            for slot in &slots {
                self.catch_up(slot, &Scope::everything())?;
            }
        }
        Ok(())
    }

    /// Flushes and tears down the engine, releasing the store lock.
    pub fn shutdown(self) -> Result<(), IndexError> {
        self.flush()
    }

    fn absorb_events(&self) {
        for event in self.event_rx.try_iter().collect::<Vec<_>>() {
            self.apply_event_inner(event);
        }
    }

    fn apply_event_inner(&self, event: FileEvent) {
        let FileEvent {
            meta,
            kind,
            content,
        } = event;

        match kind {
            ChangeKind::Created | ChangeKind::Modified | ChangeKind::Moved => {
                self.files.write().insert(meta.id, meta.clone());
            }
            ChangeKind::Deleted | ChangeKind::Irrelevant => {
                self.files.write().remove(&meta.id);
            }
        }

        for slot in self.catalog.slots() {
            // A file an index's filter no longer matches (after a move, say)
            // must lose its prior contributions, so non-matching files are
            // queued as removals. Removing a never-indexed file is a no-op.
            let effective_kind = if kind.is_removal() || slot.definition.applies_to(&meta) {
                kind
            } else {
                ChangeKind::Irrelevant
            };
            self.scheduler.enqueue(
                slot.definition.id(),
                PendingChange {
                    meta: meta.clone(),
                    kind: effective_kind,
                    content: content.clone(),
                },
            );
        }
    }

    fn catch_up_all(&self) -> Result<(), IndexError> {
        for slot in self.catalog.slots().cloned().collect::<Vec<_>>() {
            self.catch_up(&slot, &Scope::everything())?;
        }
        Ok(())
    }

    /// Drains `slot`'s backlog for `scope`, escalating corruption to a full
    /// rebuild, and advances the slot's state.
    fn catch_up(&self, slot: &Arc<IndexSlot>, scope: &Scope) -> Result<(), IndexError> {
        let everything = Scope::Everything;
        let drain_scope = if slot.state() == IndexState::Rebuilding {
            &everything
        } else {
            scope
        };

        // `generation()` forces lazy materialization of the persisted store,
        // so corruption discovered on first touch takes the rebuild path here
        // instead of leaking out of a later read.
        let result = self
            .scheduler
            .drain(slot, drain_scope)
            .and_then(|()| slot.store.generation().map(|_| ()));
        match result {
            Ok(()) => {}
            Err(err) if err.requires_rebuild() => {
                // Never attempt partial repair: discard, re-extract, answer
                // from the rebuilt store.
                {
                    let _writer = slot.write_lock.lock();
                    self.recovery
                        .begin_rebuild(slot, &RebuildReason::Corruption(err.to_string()))?;
                }
                self.scheduler.clear_backlog(slot.definition.id());
                self.enqueue_all_applicable(slot);
                self.scheduler.drain(slot, &Scope::everything())?;
                slot.set_state(IndexState::Ready);
                return Ok(());
            }
            Err(err) => return Err(err),
        }

        match slot.state() {
            IndexState::Rebuilding => slot.set_state(IndexState::Ready),
            IndexState::Validating | IndexState::Uninitialized
                if self.scheduler.backlog_is_empty(slot.definition.id()) =>
            {
                slot.set_state(IndexState::Ready)
            }
            _ => {}
        }
        Ok(())
    }

    fn enqueue_all_applicable(&self, slot: &Arc<IndexSlot>) {
        let files = self.files.read();
        for meta in files.values() {
            if slot.definition.applies_to(meta) {
                self.scheduler.enqueue(
                    slot.definition.id(),
                    PendingChange {
                        meta: meta.clone(),
                        kind: ChangeKind::Modified,
                        content: None,
                    },
                );
            }
        }
    }
}

impl std::fmt::Debug for IndexEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexEngine")
            .field("indexes", &self.catalog.ids())
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}
