use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use quarry_cache::StoreDir;

use crate::definition::{IndexDefinition, IndexId};
use crate::error::IndexError;
use crate::recovery::RebuildReason;
use crate::store::{IndexStore, OpenOutcome};

/// Whether an index is usable right now.
///
/// `Uninitialized → Validating → {Rebuilding, Ready} → Ready`, with
/// `Ready → Rebuilding` on detected version skew or corruption and any state
/// `→ Rebuilding` on an explicit forced rebuild.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexState {
    /// Registered but not yet opened.
    Uninitialized,
    /// The persisted store is trusted, but individual files still need
    /// fingerprint checks before their entries are believed fresh.
    Validating,
    /// The persisted store was discarded; every applicable file is being
    /// re-extracted. Queries block until the backlog drains.
    Rebuilding,
    Ready,
}

/// One registered index: its definition, its store, its usability state, and
/// the lock that serializes its single logical writer.
pub(crate) struct IndexSlot {
    pub definition: IndexDefinition,
    pub store: IndexStore,
    state: RwLock<IndexState>,
    /// Held for the duration of any mutation batch. Readers do not take it;
    /// the store's own locking keeps reads consistent.
    pub write_lock: Mutex<()>,
}

impl IndexSlot {
    fn new(definition: IndexDefinition, store: IndexStore) -> Self {
        Self {
            definition,
            store,
            state: RwLock::new(IndexState::Uninitialized),
            write_lock: Mutex::new(()),
        }
    }

    pub fn state(&self) -> IndexState {
        *self.state.read()
    }

    pub fn set_state(&self, state: IndexState) {
        *self.state.write() = state;
    }
}

impl std::fmt::Debug for IndexSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexSlot")
            .field("definition", &self.definition)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Owns the id → (definition, store, state) mapping for one engine.
///
/// There are no global registries: each catalog is an explicit instance, so a
/// process can host several isolated engines (tests do exactly this).
#[derive(Debug, Default)]
pub(crate) struct IndexCatalog {
    slots: BTreeMap<IndexId, Arc<IndexSlot>>,
}

impl IndexCatalog {
    /// Opens the persisted store of every definition and derives each
    /// index's initial state. Returns the catalog plus the slots whose store
    /// was discarded (fresh, skewed, or corrupt) and therefore start in
    /// `Rebuilding`.
    pub fn open(
        store_dir: &StoreDir,
        definitions: Vec<IndexDefinition>,
    ) -> Result<(Self, Vec<(Arc<IndexSlot>, RebuildReason)>), IndexError> {
        let mut slots = BTreeMap::new();
        let mut rebuilds = Vec::new();

        for definition in definitions {
            let id = definition.id().clone();
            if slots.contains_key(&id) {
                return Err(IndexError::DuplicateIndex { id });
            }

            let (store, outcome) = IndexStore::open(
                store_dir.index_dir(id.as_str()),
                id.clone(),
                definition.version(),
            )?;
            let slot = Arc::new(IndexSlot::new(definition, store));

            match outcome {
                OpenOutcome::Trusted => {
                    slot.set_state(IndexState::Validating);
                    tracing::debug!(
                        target = "quarry.catalog",
                        index = %id,
                        "persisted index trusted; validating file fingerprints"
                    );
                }
                OpenOutcome::NeedsRebuild(reason) => {
                    slot.set_state(IndexState::Rebuilding);
                    tracing::info!(
                        target = "quarry.catalog",
                        index = %id,
                        %reason,
                        "index requires rebuild"
                    );
                    rebuilds.push((Arc::clone(&slot), reason));
                }
            }

            slots.insert(id, slot);
        }

        Ok((Self { slots }, rebuilds))
    }

    pub fn slot(&self, id: &IndexId) -> Result<&Arc<IndexSlot>, IndexError> {
        self.slots
            .get(id)
            .ok_or_else(|| IndexError::UnknownIndex { id: id.clone() })
    }

    pub fn slots(&self) -> impl Iterator<Item = &Arc<IndexSlot>> {
        self.slots.values()
    }

    pub fn ids(&self) -> Vec<IndexId> {
        self.slots.keys().cloned().collect()
    }
}
