//! Resource set: the contexts and transactions owned by one scope chain.
//!
//! A [`ContextSet`] holds at most one context per [`ContextKind`], each
//! paired with the transaction it was opened under. The set is shared
//! (`Arc`) between the owning scope, any nested child scopes, and the
//! ambient registry; identity between those references is always
//! checked with `Arc::ptr_eq`, never by value.

use crate::context::{DbContext, DbTransaction, GuardedContext, SharedTransaction};
use crate::error::{UowError, UowResult};
use crate::types::{ContextKind, EntityKey, IsolationLevel, Mode};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio_util::sync::CancellationToken;

/// Per-kind pending entity keys at one point in time. Taken when a
/// write child joins a set, so its later detach can be scoped to work
/// that appeared during its own window.
pub(crate) type PendingSnapshot = HashMap<ContextKind, HashSet<EntityKey>>;

struct ContextEntry {
    context: GuardedContext,
    /// Transaction owned by the set; `None` when the context adopted an
    /// external transaction the caller finalizes itself.
    transaction: Option<Box<dyn DbTransaction>>,
}

/// Contexts in insertion order. Save, commit and rollback walk this
/// order; a set never holds two contexts of the same kind.
#[derive(Default)]
struct ContextCollection {
    entries: Vec<ContextEntry>,
}

impl ContextCollection {
    fn find_mut(&mut self, kind: ContextKind) -> Option<&mut ContextEntry> {
        self.entries.iter_mut().find(|e| e.context.kind() == kind)
    }

    fn contains(&self, kind: ContextKind) -> bool {
        self.entries.iter().any(|e| e.context.kind() == kind)
    }
}

/// The resource set owned by one ambient chain or one non-ambient scope.
pub struct ContextSet {
    inner: Mutex<ContextCollection>,
    isolation: Mutex<Option<IsolationLevel>>,
    disposed: AtomicBool,
}

impl ContextSet {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(ContextCollection::default()),
            isolation: Mutex::new(None),
            disposed: AtomicBool::new(false),
        }
    }

    /// Adds a context of a kind not yet present, putting it into the
    /// requested mode and opening its transaction (unless an external
    /// transaction is adopted instead).
    pub(crate) fn add_context(
        &self,
        mut context: Box<dyn DbContext>,
        mode: Mode,
        isolation: Option<IsolationLevel>,
        external: Option<SharedTransaction>,
    ) -> UowResult<()> {
        self.ensure_live()?;
        let kind = context.kind();
        let mut inner = self.inner.lock();
        if inner.contains(kind) {
            return Err(UowError::DuplicateContext { kind });
        }

        context.set_mode(mode);
        let transaction = match external {
            Some(shared) => {
                // Caller owns the transaction; the set never finalizes it.
                context.adopt_transaction(shared)?;
                None
            }
            None => {
                let txn = context.begin_transaction(isolation.unwrap_or_default())?;
                if isolation.is_some() {
                    *self.isolation.lock() = isolation;
                }
                Some(txn)
            }
        };

        inner.entries.push(ContextEntry {
            context: GuardedContext::new(context),
            transaction,
        });
        Ok(())
    }

    /// Isolation level the set's transactions were established with, if
    /// one was requested explicitly.
    #[must_use]
    pub fn isolation(&self) -> Option<IsolationLevel> {
        *self.isolation.lock()
    }

    /// True once [`dispose`](ContextSet::dispose) has run.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Number of contexts in the set.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// True when the set holds no contexts.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True when a context of `kind` is present.
    #[must_use]
    pub fn has_context(&self, kind: ContextKind) -> bool {
        self.inner.lock().contains(kind)
    }

    /// Kinds of the contexts held, in insertion order.
    #[must_use]
    pub fn kinds(&self) -> Vec<ContextKind> {
        self.inner
            .lock()
            .entries
            .iter()
            .map(|e| e.context.kind())
            .collect()
    }

    /// Mode of the context of `kind`, if present.
    #[must_use]
    pub fn mode_of(&self, kind: ContextKind) -> Option<Mode> {
        let mut inner = self.inner.lock();
        inner.find_mut(kind).map(|e| e.context.mode())
    }

    /// Runs `f` with the guarded handle of `kind`.
    pub fn with_context<R>(
        &self,
        kind: ContextKind,
        f: impl FnOnce(&mut GuardedContext) -> R,
    ) -> UowResult<R> {
        self.ensure_live()?;
        let mut inner = self.inner.lock();
        let entry = inner
            .find_mut(kind)
            .ok_or(UowError::UnknownContext { kind })?;
        Ok(f(&mut entry.context))
    }

    /// Runs `f` with the concrete context of `kind`, downcast to `T`.
    pub fn with_context_as<T: DbContext + 'static, R>(
        &self,
        kind: ContextKind,
        f: impl FnOnce(&mut T) -> R,
    ) -> UowResult<R> {
        self.with_context(kind, |guarded| {
            guarded
                .downcast_mut::<T>()
                .map(f)
                .ok_or(UowError::UnknownContext { kind })
        })?
    }

    /// Persists pending changes on every context, in insertion order.
    ///
    /// A read-only context with pending changes fails the whole save
    /// immediately; a persistence failure aborts the remaining contexts
    /// and propagates. Transactions are not committed.
    pub fn save_changes(&self) -> UowResult<usize> {
        self.ensure_live()?;
        let mut inner = self.inner.lock();
        let mut persisted = 0;
        for entry in &mut inner.entries {
            Self::check_read_only(&entry.context)?;
            persisted += entry.context.persist_for_save().map_err(Self::log_save_failure)?;
        }
        Ok(persisted)
    }

    /// Asynchronous form of [`save_changes`](ContextSet::save_changes).
    ///
    /// Cancellation leaves the set as if [`rollback`](ContextSet::rollback)
    /// had been invoked: nothing is committed, staged changes are
    /// discarded.
    pub async fn save_changes_async(&self, cancel: &CancellationToken) -> UowResult<usize> {
        self.ensure_live()?;
        // The entries leave the set for the duration of the awaits so
        // the lock is not held across suspension points.
        let mut entries = std::mem::take(&mut self.inner.lock().entries);
        let result = Self::persist_all_async(&mut entries, cancel).await;
        self.inner.lock().entries = entries;

        match result {
            Err(err @ UowError::Cancelled) => {
                self.rollback_best_effort();
                Err(err)
            }
            other => other,
        }
    }

    async fn persist_all_async(
        entries: &mut [ContextEntry],
        cancel: &CancellationToken,
    ) -> UowResult<usize> {
        let mut persisted = 0;
        for entry in entries.iter_mut() {
            Self::check_read_only(&entry.context)?;
            persisted += entry
                .context
                .persist_for_save_async(cancel)
                .await
                .map_err(Self::log_save_failure)?;
        }
        Ok(persisted)
    }

    /// Commits every transaction the set owns, in insertion order.
    pub fn commit(&self) -> UowResult<()> {
        self.ensure_live()?;
        let mut inner = self.inner.lock();
        for entry in &mut inner.entries {
            if let Some(txn) = entry.transaction.as_mut() {
                txn.commit()?;
            }
        }
        Ok(())
    }

    /// Rolls back every transaction the set owns. Tolerant of being
    /// called when nothing is pending.
    pub fn rollback(&self) -> UowResult<()> {
        self.ensure_live()?;
        let mut inner = self.inner.lock();
        for entry in &mut inner.entries {
            if let Some(txn) = entry.transaction.as_mut() {
                txn.rollback()?;
            }
        }
        Ok(())
    }

    /// Saves all contexts, then commits all transactions. On any
    /// failure every transaction is rolled back instead and the
    /// original error is returned unchanged.
    pub fn save_and_commit(&self) -> UowResult<usize> {
        match self.save_changes() {
            Ok(persisted) => {
                self.commit()?;
                Ok(persisted)
            }
            Err(err) => {
                self.rollback_best_effort();
                Err(err)
            }
        }
    }

    /// Asynchronous form of [`save_and_commit`](ContextSet::save_and_commit).
    pub async fn save_and_commit_async(&self, cancel: &CancellationToken) -> UowResult<usize> {
        self.ensure_live()?;
        let mut entries = std::mem::take(&mut self.inner.lock().entries);
        let result = Self::persist_all_async(&mut entries, cancel).await;
        self.inner.lock().entries = entries;

        match result {
            Ok(persisted) => {
                self.commit()?;
                Ok(persisted)
            }
            Err(err) => {
                self.rollback_best_effort();
                Err(err)
            }
        }
    }

    /// Disposes every transaction and context and clears the set.
    /// Idempotent.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut inner = self.inner.lock();
        for entry in &mut inner.entries {
            if let Some(txn) = entry.transaction.as_mut() {
                txn.dispose();
            }
            entry.context.inner_mut().dispose();
        }
        inner.entries.clear();
    }

    /// Records which entities are pending in every context right now.
    pub(crate) fn pending_snapshot(&self) -> PendingSnapshot {
        let mut inner = self.inner.lock();
        inner
            .entries
            .iter_mut()
            .map(|entry| {
                let keys = entry.context.inner_mut().pending_keys();
                (entry.context.kind(), keys.into_iter().collect())
            })
            .collect()
    }

    /// Drops unpersisted cache changes that appeared after `snapshot`
    /// was taken. Used when an abandoned child scope detaches: work
    /// from the child's window never rides along with the owner's
    /// later save, while pending state that predates the child stays
    /// untouched.
    pub(crate) fn discard_pending_since(&self, snapshot: &PendingSnapshot) {
        let mut inner = self.inner.lock();
        for entry in &mut inner.entries {
            let baseline = snapshot.get(&entry.context.kind());
            let context = entry.context.inner_mut();
            for key in context.pending_keys() {
                let predates = baseline.is_some_and(|kept| kept.contains(&key));
                if !predates {
                    context.discard_entry(&key);
                }
            }
        }
    }

    pub(crate) fn rollback_best_effort(&self) {
        if let Err(err) = self.rollback() {
            tracing::error!(%err, "rollback after failed save also failed");
        }
    }

    fn ensure_live(&self) -> UowResult<()> {
        if self.is_disposed() {
            return Err(UowError::Disposed);
        }
        Ok(())
    }

    fn check_read_only(context: &GuardedContext) -> UowResult<()> {
        if context.mode() == Mode::Read && context.has_pending_changes() {
            return Err(UowError::ReadOnlyDirty {
                kind: context.kind(),
                pending: context.pending_counts(),
            });
        }
        Ok(())
    }

    fn log_save_failure(err: UowError) -> UowError {
        if let UowError::Validation { failures } = &err {
            for failure in failures {
                tracing::warn!(
                    entity = %failure.entity,
                    field = %failure.field,
                    error = %failure.message,
                    "entity validation error",
                );
            }
        }
        err
    }
}

impl std::fmt::Debug for ContextSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextSet")
            .field("contexts", &self.len())
            .field("isolation", &self.isolation())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{StubContext, StubProbe, STUB};
    use std::sync::Arc;

    fn writable_set(context: StubContext) -> (ContextSet, Arc<StubProbe>) {
        let probe = context.probe();
        let set = ContextSet::new();
        set.add_context(
            Box::new(context),
            Mode::Write,
            Some(IsolationLevel::Serializable),
            None,
        )
        .unwrap();
        (set, probe)
    }

    #[test]
    fn duplicate_kind_rejected() {
        let (set, _probe) = writable_set(StubContext::new(STUB));
        let result = set.add_context(Box::new(StubContext::new(STUB)), Mode::Write, None, None);
        assert!(matches!(result, Err(UowError::DuplicateContext { .. })));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn records_requested_isolation() {
        let (set, _probe) = writable_set(StubContext::new(STUB));
        assert_eq!(set.isolation(), Some(IsolationLevel::Serializable));
    }

    #[test]
    fn direct_persist_is_guarded() {
        let (set, _probe) = writable_set(StubContext::new(STUB));
        let result = set.with_context(STUB, |cx| cx.persist()).unwrap();
        assert!(matches!(result, Err(UowError::DirectSave { .. })));
    }

    #[test]
    fn read_only_context_with_pending_changes_fails_save() {
        let context = StubContext::new(STUB).with_pending(1);
        let set = ContextSet::new();
        set.add_context(Box::new(context), Mode::Read, None, None)
            .unwrap();

        let result = set.save_changes();
        assert!(matches!(result, Err(UowError::ReadOnlyDirty { .. })));
    }

    #[test]
    fn save_persists_without_committing() {
        let (set, probe) = writable_set(StubContext::new(STUB).with_pending(2));

        let persisted = set.save_changes().unwrap();
        assert_eq!(persisted, 2);
        assert_eq!(probe.persists.load(Ordering::SeqCst), 2);
        assert_eq!(probe.commits.load(Ordering::SeqCst), 0);

        set.commit().unwrap();
        assert_eq!(probe.commits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn save_and_commit_rolls_back_on_validation_failure() {
        let (set, probe) = writable_set(StubContext::new(STUB).with_pending(1).failing_validation());

        let err = set.save_and_commit().unwrap_err();
        match err {
            UowError::Validation { failures } => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].field, "value");
            }
            other => panic!("expected validation error, got {other}"),
        }
        assert_eq!(probe.commits.load(Ordering::SeqCst), 0);
        assert_eq!(probe.rollbacks.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn rollback_is_tolerant_when_nothing_pending() {
        let (set, _probe) = writable_set(StubContext::new(STUB));
        set.rollback().unwrap();
        set.rollback().unwrap();
    }

    #[test]
    fn discard_since_snapshot_keeps_prior_pending_work() {
        let (set, _probe) = writable_set(StubContext::new(STUB).with_pending(1));

        let snapshot = set.pending_snapshot();
        set.with_context_as::<StubContext, _>(STUB, |cx| {
            cx.track();
        })
        .unwrap();
        set.discard_pending_since(&snapshot);

        // Only the post-snapshot entry is gone.
        let pending = set
            .with_context(STUB, |cx| cx.pending_counts().total())
            .unwrap();
        assert_eq!(pending, 1);
    }

    #[test]
    fn dispose_is_idempotent_and_rejects_further_use() {
        let (set, _probe) = writable_set(StubContext::new(STUB));
        set.dispose();
        set.dispose();
        assert!(set.is_disposed());
        assert!(matches!(set.save_changes(), Err(UowError::Disposed)));
        assert!(matches!(
            set.with_context(STUB, |_| ()),
            Err(UowError::Disposed)
        ));
    }
}
