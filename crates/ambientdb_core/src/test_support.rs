//! Minimal stub context and transaction for in-crate tests.
//!
//! The integration tests exercise the machinery end to end against the
//! in-memory testkit; these stubs exist so unit tests of crate-private
//! surfaces stay free of cross-crate types. Observable effects are
//! counted in a [`StubProbe`] the test captures before the context
//! moves into a set.

use crate::context::{DbContext, DbTransaction, SharedTransaction};
use crate::error::{UowError, UowResult, ValidationFailure};
use crate::types::{ContextKind, EntityKey, EntryState, IsolationLevel, Mode, PendingCounts};
use async_trait::async_trait;
use std::any::Any;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub(crate) const STUB: ContextKind = ContextKind::new(90, "stub");
pub(crate) const OTHER: ContextKind = ContextKind::new(91, "other");

/// Counters shared between a stub and the test observing it.
#[derive(Default)]
pub(crate) struct StubProbe {
    pub(crate) persists: AtomicUsize,
    pub(crate) commits: AtomicUsize,
    pub(crate) rollbacks: AtomicUsize,
}

pub(crate) struct StubTransaction {
    probe: Arc<StubProbe>,
    open: bool,
}

impl DbTransaction for StubTransaction {
    fn commit(&mut self) -> UowResult<()> {
        if !self.open {
            return Err(UowError::backend("transaction is no longer open"));
        }
        self.open = false;
        self.probe.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn rollback(&mut self) -> UowResult<()> {
        if self.open {
            self.probe.rollbacks.fetch_add(1, Ordering::SeqCst);
        }
        self.open = false;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn dispose(&mut self) {
        self.open = false;
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// A context that tracks pending entity keys and nothing else.
pub(crate) struct StubContext {
    kind: ContextKind,
    mode: Mode,
    pending: Vec<EntityKey>,
    fail_validation: bool,
    fail_begin: bool,
    probe: Arc<StubProbe>,
}

impl StubContext {
    pub(crate) fn new(kind: ContextKind) -> Self {
        Self::with_probe(kind, Arc::new(StubProbe::default()))
    }

    pub(crate) fn with_probe(kind: ContextKind, probe: Arc<StubProbe>) -> Self {
        Self {
            kind,
            mode: Mode::Read,
            pending: Vec::new(),
            fail_validation: false,
            fail_begin: false,
            probe,
        }
    }

    pub(crate) fn with_pending(mut self, entities: usize) -> Self {
        for _ in 0..entities {
            self.pending.push(EntityKey::new("stubs", Uuid::new_v4()));
        }
        self
    }

    pub(crate) fn failing_validation(mut self) -> Self {
        self.fail_validation = true;
        self
    }

    pub(crate) fn failing_begin(mut self) -> Self {
        self.fail_begin = true;
        self
    }

    pub(crate) fn probe(&self) -> Arc<StubProbe> {
        Arc::clone(&self.probe)
    }

    /// Tracks one more pending entity, as an insert would.
    pub(crate) fn track(&mut self) -> EntityKey {
        let key = EntityKey::new("stubs", Uuid::new_v4());
        self.pending.push(key.clone());
        key
    }
}

#[async_trait]
impl DbContext for StubContext {
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
        PendingCounts {
            added: self.pending.len(),
            ..Default::default()
        }
    }

    fn persist(&mut self) -> UowResult<usize> {
        if self.fail_validation {
            return Err(UowError::validation(vec![ValidationFailure {
                entity: EntityKey::new("stubs", Uuid::nil()),
                field: "value".to_string(),
                message: "rejected by stub".to_string(),
            }]));
        }
        let persisted = self.pending.len();
        self.pending.clear();
        self.probe.persists.fetch_add(persisted, Ordering::SeqCst);
        Ok(persisted)
    }

    async fn persist_async(&mut self, cancel: &CancellationToken) -> UowResult<usize> {
        if cancel.is_cancelled() {
            return Err(UowError::Cancelled);
        }
        self.persist()
    }

    fn begin_transaction(
        &mut self,
        _isolation: IsolationLevel,
    ) -> UowResult<Box<dyn DbTransaction>> {
        if self.fail_begin {
            return Err(UowError::backend("stub refuses to begin a transaction"));
        }
        Ok(Box::new(StubTransaction {
            probe: Arc::clone(&self.probe),
            open: true,
        }))
    }

    fn adopt_transaction(&mut self, _transaction: SharedTransaction) -> UowResult<()> {
        Ok(())
    }

    fn pending_keys(&self) -> Vec<EntityKey> {
        self.pending.clone()
    }

    fn discard_entry(&mut self, key: &EntityKey) {
        self.pending.retain(|k| k != key);
    }

    fn entry_state(&self, key: &EntityKey) -> Option<EntryState> {
        self.pending.contains(key).then_some(EntryState::Added)
    }

    fn refresh_from_store(&mut self, _key: &EntityKey) -> UowResult<bool> {
        Ok(false)
    }

    fn dispose(&mut self) {
        self.pending.clear();
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Builder producing stubs of `kind` that all report into `probe`.
pub(crate) fn probed_builder(
    kind: ContextKind,
    probe: &Arc<StubProbe>,
) -> impl Fn() -> Box<dyn DbContext> {
    let probe = Arc::clone(probe);
    move || Box::new(StubContext::with_probe(kind, Arc::clone(&probe))) as Box<dyn DbContext>
}
