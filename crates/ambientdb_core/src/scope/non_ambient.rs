//! Non-ambient unit-of-work scope.

use crate::collection::ContextSet;
use crate::context::{DbContext, GuardedContext};
use crate::error::{UowError, UowResult};
use crate::registry::{AmbientEntry, CallChain};
use crate::types::{ContextKind, EntityKey, EntryState, IsolationLevel, Mode, ScopeKey};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// A scope whose resource set is private and invisible to the chain.
///
/// On construction the chain's ambient entry is captured into a memento
/// and the registry slot cleared, so nothing running under this scope
/// can observe (or disturb) the enclosing transaction. The private set
/// is never published; callers reach its context through
/// [`with_context`](NonAmbientDbContextScope::with_context) or the
/// locator's explicit non-ambient accessor. On disposal the memento is
/// reinstated verbatim as the final step on every exit path, including
/// the `Drop` path.
///
/// Used for side transactions such as recording a failure counter that
/// must commit even when the enclosing transaction rolls back.
pub struct NonAmbientDbContextScope {
    chain: CallChain,
    memento: Option<AmbientEntry>,
    set: Arc<ContextSet>,
    key: ScopeKey,
    mode: Mode,
    completed: bool,
    disposed: bool,
}

impl NonAmbientDbContextScope {
    /// Detach-and-create initialization. Called by the scope factory.
    pub(crate) fn open(
        chain: &CallChain,
        mode: Mode,
        isolation: Option<IsolationLevel>,
        build: &dyn Fn() -> Box<dyn DbContext>,
    ) -> UowResult<Self> {
        // Capture whatever is ambient before anything can fail, so the
        // error path below can restore it.
        let memento = chain.take_entry();

        let set = Arc::new(ContextSet::new());
        if let Err(err) = set.add_context(build(), mode, isolation, None) {
            chain.restore(memento);
            return Err(err);
        }

        Ok(Self {
            chain: chain.clone(),
            memento,
            set,
            key: ScopeKey::new(),
            mode,
            completed: false,
            disposed: false,
        })
    }

    /// True once a save call has completed this scope.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.completed
    }

    /// Runs `f` with the guarded handle of `kind` from the private set.
    pub fn with_context<R>(
        &self,
        kind: ContextKind,
        f: impl FnOnce(&mut GuardedContext) -> R,
    ) -> UowResult<R> {
        self.set.with_context(kind, f)
    }

    /// Runs `f` with the private set's concrete context, downcast to `T`.
    pub fn with_context_as<T: DbContext + 'static, R>(
        &self,
        kind: ContextKind,
        f: impl FnOnce(&mut T) -> R,
    ) -> UowResult<R> {
        self.set.with_context_as(kind, f)
    }

    /// Persists pending changes into the private set's transactions
    /// without committing.
    pub fn save_changes(&mut self) -> UowResult<usize> {
        self.ensure_live()?;
        let persisted = self.set.save_changes()?;
        self.completed = true;
        Ok(persisted)
    }

    /// Commits the private set's transactions.
    pub fn commit(&mut self) -> UowResult<()> {
        self.ensure_live()?;
        self.set.commit()
    }

    /// Saves and commits the private set; rolls back on failure and
    /// returns the original error unchanged.
    pub fn save_and_commit(&mut self) -> UowResult<usize> {
        self.ensure_live()?;
        let persisted = self.set.save_and_commit()?;
        self.completed = true;
        Ok(persisted)
    }

    /// Asynchronous form of [`save_and_commit`](NonAmbientDbContextScope::save_and_commit).
    pub async fn save_and_commit_async(&mut self, cancel: &CancellationToken) -> UowResult<usize> {
        self.ensure_live()?;
        let persisted = self.set.save_and_commit_async(cancel).await?;
        self.completed = true;
        Ok(persisted)
    }

    /// Refreshes entities this scope modified in the detached ambient
    /// set's caches, so the enclosing scope does not keep working from
    /// stale copies after this scope commits.
    ///
    /// Only ambient copies in `Unchanged` state are refreshed from the
    /// store; an ambient copy with its own pending modification is left
    /// alone, letting the database arbitrate that conflict at commit
    /// time. Returns the number of entities refreshed.
    pub fn refresh_parent_cache(&self, entities: &[EntityKey]) -> UowResult<usize> {
        let Some(parent) = self.memento.as_ref().map(|e| Arc::clone(&e.set)) else {
            return Ok(0);
        };

        let mut refreshed = 0;
        for kind in self.set.kinds() {
            if !parent.has_context(kind) {
                continue;
            }
            for key in entities {
                let tracked_here = self
                    .set
                    .with_context(kind, |cx| cx.entry_state(key).is_some())?;
                if !tracked_here {
                    continue;
                }
                let did_refresh = parent.with_context(kind, |cx| -> UowResult<bool> {
                    if cx.entry_state(key) == Some(EntryState::Unchanged) {
                        cx.inner_mut().refresh_from_store(key)
                    } else {
                        Ok(false)
                    }
                })??;
                if did_refresh {
                    refreshed += 1;
                }
            }
        }
        Ok(refreshed)
    }

    /// Disposes the scope, reporting cleanup failures.
    ///
    /// Rolls back an incomplete write set, disposes it, and restores
    /// the captured ambient state regardless of what happened before.
    pub fn dispose(mut self) -> UowResult<()> {
        self.dispose_inner()
    }

    fn dispose_inner(&mut self) -> UowResult<()> {
        if self.disposed {
            return Ok(());
        }
        self.disposed = true;

        let mut result = Ok(());
        if !self.set.is_disposed() {
            if !self.completed && self.mode == Mode::Write {
                if let Err(err) = self.set.rollback() {
                    result = Err(err);
                }
            }
            self.set.dispose();
        }
        // Restoration is the last unconditional step on every path.
        self.chain.restore(self.memento.take());
        result
    }

    fn ensure_live(&self) -> UowResult<()> {
        if self.disposed || self.set.is_disposed() {
            return Err(UowError::Disposed);
        }
        Ok(())
    }
}

impl Drop for NonAmbientDbContextScope {
    fn drop(&mut self) {
        if let Err(err) = self.dispose_inner() {
            tracing::error!(key = %self.key, %err, "non-ambient scope disposal failed");
        }
    }
}

impl std::fmt::Debug for NonAmbientDbContextScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NonAmbientDbContextScope")
            .field("key", &self.key)
            .field("mode", &self.mode)
            .field("completed", &self.completed)
            .field("detached_ambient", &self.memento.is_some())
            .finish()
    }
}
