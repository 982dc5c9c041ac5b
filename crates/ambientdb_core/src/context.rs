//! Capability traits for database contexts and their transactions.
//!
//! The scope machinery never talks to a concrete database. It consumes
//! two trait objects: [`DbContext`] (a session that tracks pending
//! changes and can persist them) and [`DbTransaction`] (the transaction
//! the session's persists run under). Concrete implementations live
//! outside this crate; `ambientdb_testkit` provides an in-memory pair.

use crate::error::{UowError, UowResult};
use crate::types::{ContextKind, EntityKey, EntryState, IsolationLevel, Mode, PendingCounts};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::any::Any;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// A transaction handle owned by a resource set (or by the caller, for
/// the external-transaction form).
pub trait DbTransaction: Send {
    /// Commits the transaction, publishing staged changes.
    fn commit(&mut self) -> UowResult<()>;

    /// Rolls back the transaction. Must be tolerant of being called
    /// when nothing is pending or the transaction already completed.
    fn rollback(&mut self) -> UowResult<()>;

    /// Returns true while the transaction is neither committed nor
    /// rolled back.
    fn is_open(&self) -> bool;

    /// Releases the transaction; rolls back first if still open.
    fn dispose(&mut self);

    /// Mutable `Any` access for implementation-specific adoption.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// A transaction shared between the caller and a context that adopted it.
///
/// The caller keeps one clone and remains solely responsible for
/// committing or rolling it back; the resource set never finalizes an
/// adopted transaction.
pub type SharedTransaction = Arc<Mutex<Box<dyn DbTransaction>>>;

/// Wraps a transaction for sharing with an adopting context.
#[must_use]
pub fn share_transaction(txn: Box<dyn DbTransaction>) -> SharedTransaction {
    Arc::new(Mutex::new(txn))
}

/// A transactional database session.
///
/// One handle exists per resource kind per resource set. The handle
/// tracks unpersisted changes and persists them on demand; persistence
/// must only ever be driven by the owning resource set's save path,
/// which is enforced by [`GuardedContext`].
#[async_trait]
pub trait DbContext: Send {
    /// The compile-time resource-type tag of this context.
    fn kind(&self) -> ContextKind;

    /// Current access mode.
    fn mode(&self) -> Mode;

    /// Places the context into read-only or write mode.
    fn set_mode(&mut self, mode: Mode);

    /// Counts of unpersisted changes currently tracked.
    fn pending_counts(&self) -> PendingCounts;

    /// True when any change is pending.
    fn has_pending_changes(&self) -> bool {
        !self.pending_counts().is_empty()
    }

    /// Persists pending changes into the current transaction.
    ///
    /// Returns the number of changes persisted. Changes are staged in
    /// the transaction; nothing is visible outside it until commit.
    fn persist(&mut self) -> UowResult<usize>;

    /// Asynchronous form of [`persist`](DbContext::persist).
    ///
    /// On cancellation the implementation must return
    /// [`UowError::Cancelled`] without staging a partial write.
    async fn persist_async(&mut self, cancel: &CancellationToken) -> UowResult<usize>;

    /// Begins a transaction at the given isolation level.
    fn begin_transaction(&mut self, isolation: IsolationLevel) -> UowResult<Box<dyn DbTransaction>>;

    /// Adopts a transaction the caller already opened. Subsequent
    /// persists stage into it; the caller finalizes it.
    fn adopt_transaction(&mut self, transaction: SharedTransaction) -> UowResult<()>;

    /// Keys of the entities with unpersisted changes.
    fn pending_keys(&self) -> Vec<EntityKey>;

    /// Drops one unpersisted entry from the tracking cache. An entry
    /// in `Unchanged` state is left alone.
    fn discard_entry(&mut self, key: &EntityKey);

    /// Tracking state of an entity in this context's cache, if tracked.
    fn entry_state(&self, key: &EntityKey) -> Option<EntryState>;

    /// Reloads a tracked entity from the committed store state.
    ///
    /// Returns true when the entity was tracked and refreshed.
    fn refresh_from_store(&mut self, key: &EntityKey) -> UowResult<bool>;

    /// Releases the session and everything it tracks.
    fn dispose(&mut self);

    /// `Any` access for locator downcasts.
    fn as_any(&self) -> &dyn Any;

    /// Mutable `Any` access for locator downcasts.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Decorator that owns the only callable persistence path.
///
/// Application code reaches a context through this wrapper; its public
/// [`persist`](GuardedContext::persist) always fails, so the only way
/// changes reach the store is the resource set's internal save path.
/// This replaces an event-subscription guard with a capability that
/// simply does not hand out raw persist.
pub struct GuardedContext {
    inner: Box<dyn DbContext>,
}

impl GuardedContext {
    pub(crate) fn new(inner: Box<dyn DbContext>) -> Self {
        Self { inner }
    }

    /// The wrapped context's resource-type tag.
    #[must_use]
    pub fn kind(&self) -> ContextKind {
        self.inner.kind()
    }

    /// Current access mode of the wrapped context.
    #[must_use]
    pub fn mode(&self) -> Mode {
        self.inner.mode()
    }

    /// Counts of unpersisted changes.
    #[must_use]
    pub fn pending_counts(&self) -> PendingCounts {
        self.inner.pending_counts()
    }

    /// True when any change is pending.
    #[must_use]
    pub fn has_pending_changes(&self) -> bool {
        self.inner.has_pending_changes()
    }

    /// Tracking state of an entity, if tracked.
    #[must_use]
    pub fn entry_state(&self, key: &EntityKey) -> Option<EntryState> {
        self.inner.entry_state(key)
    }

    /// Always fails with [`UowError::DirectSave`].
    ///
    /// Persistence belongs to the owning scope's save path; call
    /// `save_changes` on the scope instead.
    pub fn persist(&mut self) -> UowResult<usize> {
        Err(UowError::direct_save(self.inner.kind()))
    }

    /// Downcasts to the concrete context type for domain access.
    #[must_use]
    pub fn downcast_ref<T: DbContext + 'static>(&self) -> Option<&T> {
        self.inner.as_any().downcast_ref::<T>()
    }

    /// Mutable downcast to the concrete context type.
    #[must_use]
    pub fn downcast_mut<T: DbContext + 'static>(&mut self) -> Option<&mut T> {
        self.inner.as_any_mut().downcast_mut::<T>()
    }

    // Internal bypass used by the resource set's save path.
    pub(crate) fn persist_for_save(&mut self) -> UowResult<usize> {
        self.inner.persist()
    }

    pub(crate) async fn persist_for_save_async(
        &mut self,
        cancel: &CancellationToken,
    ) -> UowResult<usize> {
        self.inner.persist_async(cancel).await
    }

    pub(crate) fn inner_mut(&mut self) -> &mut dyn DbContext {
        self.inner.as_mut()
    }
}

impl std::fmt::Debug for GuardedContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuardedContext")
            .field("kind", &self.inner.kind())
            .field("mode", &self.inner.mode())
            .field("pending", &self.inner.pending_counts())
            .finish()
    }
}
