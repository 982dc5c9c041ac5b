//! Ambient unit-of-work scope.

use crate::collection::{ContextSet, PendingSnapshot};
use crate::context::{DbContext, SharedTransaction};
use crate::error::{UowError, UowResult};
use crate::registry::CallChain;
use crate::types::{ContextKind, IsolationLevel, Mode, ScopeKey};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Guard object representing one request for a database context.
///
/// On creation the scope either becomes the owner of a fresh resource
/// set published to its [`CallChain`], or joins the chain's existing
/// set as a non-owning child. Only the owner ever finalizes the set:
/// a child's save and dispose calls complete the child without
/// touching transaction state.
///
/// The save/commit protocol is the explicit two-step form:
/// [`save_changes`](DbContextScope::save_changes) persists pending
/// changes into the open transactions, [`commit`](DbContextScope::commit)
/// publishes them, and [`save_and_commit`](DbContextScope::save_and_commit)
/// combines both with rollback-on-failure.
///
/// Dropping the scope is the guaranteed-cleanup path: an owner dropped
/// without completing a write scope rolls everything back. Use
/// [`dispose`](DbContextScope::dispose) where the cleanup outcome
/// matters.
pub struct DbContextScope {
    chain: CallChain,
    set: Arc<ContextSet>,
    key: ScopeKey,
    mode: Mode,
    is_parent: bool,
    /// Pending work present when a write child joined; its detach may
    /// only discard entries that appeared after this point.
    pending_at_join: Option<PendingSnapshot>,
    completed: bool,
    disposed: bool,
}

impl DbContextScope {
    /// Join-or-create initialization. Called by the scope factory.
    pub(crate) fn open(
        chain: &CallChain,
        kind: ContextKind,
        mode: Mode,
        isolation: Option<IsolationLevel>,
        external: Option<SharedTransaction>,
        build: &dyn Fn() -> Box<dyn DbContext>,
    ) -> UowResult<Self> {
        let key = ScopeKey::new();

        let (set, is_parent, pending_at_join) = match chain.current() {
            None => {
                let set = Arc::new(ContextSet::new());
                set.add_context(build(), mode, isolation, external)?;
                chain.publish(key, Arc::clone(&set));
                (set, true, None)
            }
            Some(set) => {
                if set.is_disposed() {
                    return Err(UowError::Disposed);
                }
                if set.has_context(kind) {
                    // Joining an established handle: the child may not
                    // override its isolation level or escalate a
                    // read-only handle to writable.
                    if let Some(requested) = isolation {
                        if requested != IsolationLevel::default()
                            && set.isolation() != Some(requested)
                        {
                            return Err(UowError::IsolationOverride {
                                requested,
                                ambient: set.isolation(),
                            });
                        }
                    }
                    if set.mode_of(kind) == Some(Mode::Read) && mode == Mode::Write {
                        return Err(UowError::ReadWriteEscalation { kind });
                    }
                } else {
                    set.add_context(build(), mode, isolation, external)?;
                }
                let snapshot = (mode == Mode::Write).then(|| set.pending_snapshot());
                (set, false, snapshot)
            }
        };

        Ok(Self {
            chain: chain.clone(),
            set,
            key,
            mode,
            is_parent,
            pending_at_join,
            completed: false,
            disposed: false,
        })
    }

    /// True when this scope owns (created) the resource set.
    #[must_use]
    pub fn is_owner(&self) -> bool {
        self.is_parent
    }

    /// True once a save call has completed this scope.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.completed
    }

    /// The resource set this scope joined or created.
    #[must_use]
    pub fn context_set(&self) -> &Arc<ContextSet> {
        &self.set
    }

    /// Persists pending changes on every context in the set without
    /// committing. Returns the number of changes persisted.
    ///
    /// For a child scope this only marks the child completed; the
    /// owner is responsible for the real save.
    pub fn save_changes(&mut self) -> UowResult<usize> {
        self.check_consistency()?;
        if !self.is_parent {
            self.completed = true;
            return Ok(0);
        }
        let persisted = self.set.save_changes()?;
        self.completed = true;
        Ok(persisted)
    }

    /// Asynchronous form of [`save_changes`](DbContextScope::save_changes).
    ///
    /// The ambient registry resolves identically before and after the
    /// await, including when the task resumes on a different worker;
    /// cancellation leaves the set rolled back.
    pub async fn save_changes_async(&mut self, cancel: &CancellationToken) -> UowResult<usize> {
        self.check_consistency()?;
        if !self.is_parent {
            self.completed = true;
            return Ok(0);
        }
        let persisted = self.set.save_changes_async(cancel).await?;
        self.completed = true;
        Ok(persisted)
    }

    /// Commits every transaction the set owns. A no-op for child scopes.
    pub fn commit(&mut self) -> UowResult<()> {
        self.check_consistency()?;
        if !self.is_parent {
            return Ok(());
        }
        self.set.commit()
    }

    /// Saves and commits in one call; on any failure the set is rolled
    /// back and the original error propagates unchanged.
    pub fn save_and_commit(&mut self) -> UowResult<usize> {
        self.check_consistency()?;
        if !self.is_parent {
            self.completed = true;
            return Ok(0);
        }
        let persisted = self.set.save_and_commit()?;
        self.completed = true;
        Ok(persisted)
    }

    /// Asynchronous form of [`save_and_commit`](DbContextScope::save_and_commit).
    pub async fn save_and_commit_async(&mut self, cancel: &CancellationToken) -> UowResult<usize> {
        self.check_consistency()?;
        if !self.is_parent {
            self.completed = true;
            return Ok(0);
        }
        let persisted = self.set.save_and_commit_async(cancel).await?;
        self.completed = true;
        Ok(persisted)
    }

    /// Disposes the scope, reporting cleanup failures.
    ///
    /// For an owner this finalizes the resource set: an incomplete
    /// write scope is rolled back first, then everything is disposed
    /// and the registry entry removed. A child detaches, discarding
    /// its unpersisted changes if it never completed a save.
    pub fn dispose(mut self) -> UowResult<()> {
        self.dispose_inner()
    }

    fn dispose_inner(&mut self) -> UowResult<()> {
        if self.disposed {
            return Ok(());
        }
        self.disposed = true;

        if self.set.is_disposed() {
            // Too late to do anything useful.
            return Ok(());
        }
        if !self.is_parent {
            // An abandoned write child must not leave work from its
            // own window behind for the owner to commit unknowingly.
            // Pending state that predates the child is the owner's.
            if !self.completed && self.mode == Mode::Write {
                if let Some(snapshot) = self.pending_at_join.take() {
                    self.set.discard_pending_since(&snapshot);
                }
            }
            return Ok(());
        }

        let registry_matches = self
            .chain
            .current()
            .is_some_and(|current| Arc::ptr_eq(&current, &self.set));
        if !registry_matches {
            // Another chain created a conflicting set. Fatal; clean up
            // our own set but leave the foreign registry entry alone.
            self.set.rollback_best_effort();
            self.set.dispose();
            return Err(UowError::consistency(
                "ambient registry holds a different resource set than this owner scope created",
            ));
        }

        let mut result = Ok(());
        if !self.completed && self.mode == Mode::Write {
            // Abandoned write scope: reclaim as much as possible.
            if let Err(err) = self.set.rollback() {
                result = Err(err);
            }
        }
        self.set.dispose();
        self.chain.clear();
        result
    }

    fn check_consistency(&self) -> UowResult<()> {
        if self.disposed || self.set.is_disposed() {
            return Err(UowError::Disposed);
        }
        let matches = self
            .chain
            .current()
            .is_some_and(|current| Arc::ptr_eq(&current, &self.set));
        if !matches {
            // Two chains decided "no ambient set exists" and each
            // created one. Programming error; do not touch either set.
            return Err(UowError::consistency(
                "ambient registry does not hold the resource set this scope joined",
            ));
        }
        Ok(())
    }
}

impl Drop for DbContextScope {
    fn drop(&mut self) {
        if let Err(err) = self.dispose_inner() {
            tracing::error!(key = %self.key, %err, "scope disposal failed");
        }
    }
}

impl std::fmt::Debug for DbContextScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbContextScope")
            .field("key", &self.key)
            .field("mode", &self.mode)
            .field("owner", &self.is_parent)
            .field("completed", &self.completed)
            .finish()
    }
}
