//! In-memory context and transaction implementations.

use crate::store::{MemStore, Record, StagedOp};
use ambientdb_core::{
    ContextKind, DbContext, DbTransaction, EntityKey, EntryState, IsolationLevel, Mode,
    PendingCounts, SharedTransaction, UowError, UowResult, ValidationFailure,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

struct TxState {
    staged: Vec<StagedOp>,
    open: bool,
}

type TxHandle = Arc<Mutex<TxState>>;

/// An in-memory transaction. Persisted changes stay staged inside it
/// and only reach the [`MemStore`] on commit.
pub struct MemTransaction {
    store: Arc<MemStore>,
    state: TxHandle,
    isolation: IsolationLevel,
}

impl MemTransaction {
    /// Starts a standalone transaction on `store`, for the
    /// external-transaction acquisition pattern.
    #[must_use]
    pub fn begin(store: Arc<MemStore>) -> Self {
        Self::begin_with(store, IsolationLevel::default())
    }

    /// Starts a standalone transaction at an explicit isolation level.
    #[must_use]
    pub fn begin_with(store: Arc<MemStore>, isolation: IsolationLevel) -> Self {
        Self {
            store,
            state: Arc::new(Mutex::new(TxState {
                staged: Vec::new(),
                open: true,
            })),
            isolation,
        }
    }

    /// Isolation level this transaction was started at.
    #[must_use]
    pub fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    fn handle(&self) -> TxHandle {
        Arc::clone(&self.state)
    }
}

impl DbTransaction for MemTransaction {
    fn commit(&mut self) -> UowResult<()> {
        let mut state = self.state.lock();
        if !state.open {
            return Err(UowError::backend("transaction is no longer open"));
        }
        self.store.apply(&state.staged);
        state.staged.clear();
        state.open = false;
        Ok(())
    }

    fn rollback(&mut self) -> UowResult<()> {
        let mut state = self.state.lock();
        state.staged.clear();
        state.open = false;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.state.lock().open
    }

    fn dispose(&mut self) {
        let mut state = self.state.lock();
        if state.open {
            state.staged.clear();
            state.open = false;
        }
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

struct CacheEntry {
    record: Record,
    state: EntryState,
}

/// An in-memory [`DbContext`] tracking entities per [`EntityKey`].
///
/// `insert`/`update`/`delete` only touch the local cache; `persist`
/// validates and stages the pending entries into the current
/// transaction. A field with an empty value fails validation.
pub struct MemDbContext {
    kind: ContextKind,
    mode: Mode,
    store: Arc<MemStore>,
    txn: Option<TxHandle>,
    cache: HashMap<EntityKey, CacheEntry>,
    disposed: bool,
}

impl MemDbContext {
    /// Creates a context of `kind` over the shared store.
    #[must_use]
    pub fn new(kind: ContextKind, store: Arc<MemStore>) -> Self {
        Self {
            kind,
            mode: Mode::Read,
            store,
            txn: None,
            cache: HashMap::new(),
            disposed: false,
        }
    }

    /// Tracks a new entity built from `fields` and returns its key.
    pub fn insert<'a>(
        &mut self,
        table: &str,
        fields: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> EntityKey {
        let record: Record = fields
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let key = EntityKey::new(table, Uuid::new_v4());
        self.cache.insert(
            key.clone(),
            CacheEntry {
                record,
                state: EntryState::Added,
            },
        );
        key
    }

    /// Loads the entity into the cache in `Unchanged` state. Reads
    /// through this context's cache, then its transaction's staged
    /// changes, then the committed store.
    pub fn load(&mut self, key: &EntityKey) -> Option<Record> {
        if let Some(entry) = self.cache.get(key) {
            if entry.state == EntryState::Deleted {
                return None;
            }
            return Some(entry.record.clone());
        }
        let record = self.visible_record(key)?;
        self.cache.insert(
            key.clone(),
            CacheEntry {
                record: record.clone(),
                state: EntryState::Unchanged,
            },
        );
        Some(record)
    }

    /// Current field value without changing tracking state.
    #[must_use]
    pub fn get_field(&self, key: &EntityKey, field: &str) -> Option<String> {
        if let Some(entry) = self.cache.get(key) {
            if entry.state == EntryState::Deleted {
                return None;
            }
            return entry.record.get(field).cloned();
        }
        self.visible_record(key)?.get(field).cloned()
    }

    /// Sets a field on a tracked entity. Returns false when the key is
    /// not tracked or already deleted.
    pub fn update(&mut self, key: &EntityKey, field: &str, value: &str) -> bool {
        match self.cache.get_mut(key) {
            Some(entry) if entry.state != EntryState::Deleted => {
                entry.record.insert(field.to_string(), value.to_string());
                if entry.state == EntryState::Unchanged {
                    entry.state = EntryState::Modified;
                }
                true
            }
            _ => false,
        }
    }

    /// Marks a tracked entity deleted. A never-persisted `Added` entry
    /// is simply dropped.
    pub fn delete(&mut self, key: &EntityKey) -> bool {
        match self.cache.get_mut(key) {
            Some(entry) if entry.state == EntryState::Added => {
                self.cache.remove(key);
                true
            }
            Some(entry) if entry.state != EntryState::Deleted => {
                entry.state = EntryState::Deleted;
                true
            }
            _ => false,
        }
    }

    fn visible_record(&self, key: &EntityKey) -> Option<Record> {
        if let Some(txn) = &self.txn {
            let state = txn.lock();
            let mut staged: Option<Option<Record>> = None;
            for op in &state.staged {
                match op {
                    StagedOp::Upsert { table, id, record }
                        if table == &key.collection && *id == key.id =>
                    {
                        staged = Some(Some(record.clone()));
                    }
                    StagedOp::Delete { table, id }
                        if table == &key.collection && *id == key.id =>
                    {
                        staged = Some(None);
                    }
                    _ => {}
                }
            }
            if let Some(outcome) = staged {
                return outcome;
            }
        }
        self.store.get(&key.collection, key.id)
    }

    fn validate(&self) -> Vec<ValidationFailure> {
        let mut failures = Vec::new();
        for (key, entry) in &self.cache {
            if entry.state == EntryState::Unchanged || entry.state == EntryState::Deleted {
                continue;
            }
            for (field, value) in &entry.record {
                if value.is_empty() {
                    failures.push(ValidationFailure {
                        entity: key.clone(),
                        field: field.clone(),
                        message: "field value must not be empty".to_string(),
                    });
                }
            }
        }
        failures
    }
}

#[async_trait]
impl DbContext for MemDbContext {
    fn kind(&self) -> ContextKind {
        self.kind
    }

    fn mode(&self) -> Mode {
        self.mode
    }

    fn set_mode(&mut self, mode: Mode) {
        self.mode = mode;
    }

    fn pending_counts(&self) -> PendingCounts {
        let mut counts = PendingCounts::default();
        for entry in self.cache.values() {
            match entry.state {
                EntryState::Added => counts.added += 1,
                EntryState::Modified => counts.modified += 1,
                EntryState::Deleted => counts.removed += 1,
                EntryState::Unchanged => {}
            }
        }
        counts
    }

    fn persist(&mut self) -> UowResult<usize> {
        if self.disposed {
            return Err(UowError::Disposed);
        }
        let failures = self.validate();
        if !failures.is_empty() {
            return Err(UowError::validation(failures));
        }
        let Some(txn) = self.txn.as_ref().map(Arc::clone) else {
            return Err(UowError::backend("no transaction to persist into"));
        };
        let mut state = txn.lock();
        if !state.open {
            return Err(UowError::backend("transaction is no longer open"));
        }

        let mut persisted = 0;
        let mut dropped = Vec::new();
        for (key, entry) in &mut self.cache {
            match entry.state {
                EntryState::Added | EntryState::Modified => {
                    state.staged.push(StagedOp::Upsert {
                        table: key.collection.clone(),
                        id: key.id,
                        record: entry.record.clone(),
                    });
                    entry.state = EntryState::Unchanged;
                    persisted += 1;
                }
                EntryState::Deleted => {
                    state.staged.push(StagedOp::Delete {
                        table: key.collection.clone(),
                        id: key.id,
                    });
                    dropped.push(key.clone());
                    persisted += 1;
                }
                EntryState::Unchanged => {}
            }
        }
        drop(state);
        for key in dropped {
            self.cache.remove(&key);
        }
        Ok(persisted)
    }

    async fn persist_async(&mut self, cancel: &CancellationToken) -> UowResult<usize> {
        if cancel.is_cancelled() {
            return Err(UowError::Cancelled);
        }
        // Force a suspension point so resumption-on-another-worker
        // behavior is exercised by multi-threaded tests.
        tokio::task::yield_now().await;
        if cancel.is_cancelled() {
            return Err(UowError::Cancelled);
        }
        self.persist()
    }

    fn begin_transaction(
        &mut self,
        isolation: IsolationLevel,
    ) -> UowResult<Box<dyn DbTransaction>> {
        let txn = MemTransaction::begin_with(Arc::clone(&self.store), isolation);
        self.txn = Some(txn.handle());
        Ok(Box::new(txn))
    }

    fn adopt_transaction(&mut self, transaction: SharedTransaction) -> UowResult<()> {
        let mut guard = transaction.lock();
        let Some(mem) = guard.as_any_mut().downcast_mut::<MemTransaction>() else {
            return Err(UowError::backend(
                "adopted transaction is not a MemTransaction",
            ));
        };
        self.txn = Some(mem.handle());
        Ok(())
    }

    fn pending_keys(&self) -> Vec<EntityKey> {
        self.cache
            .iter()
            .filter(|(_, entry)| entry.state != EntryState::Unchanged)
            .map(|(key, _)| key.clone())
            .collect()
    }

    fn discard_entry(&mut self, key: &EntityKey) {
        if self
            .cache
            .get(key)
            .is_some_and(|entry| entry.state != EntryState::Unchanged)
        {
            self.cache.remove(key);
        }
    }

    fn entry_state(&self, key: &EntityKey) -> Option<EntryState> {
        self.cache.get(key).map(|entry| entry.state)
    }

    fn refresh_from_store(&mut self, key: &EntityKey) -> UowResult<bool> {
        let Some(entry) = self.cache.get_mut(key) else {
            return Ok(false);
        };
        match self.store.get(&key.collection, key.id) {
            Some(record) => {
                entry.record = record;
                entry.state = EntryState::Unchanged;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn dispose(&mut self) {
        self.cache.clear();
        self.txn = None;
        self.disposed = true;
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl std::fmt::Debug for MemDbContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemDbContext")
            .field("kind", &self.kind)
            .field("mode", &self.mode)
            .field("tracked", &self.cache.len())
            .field("pending", &self.pending_counts())
            .finish()
    }
}
