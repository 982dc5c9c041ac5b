//! Scope factory: the construction facade for unit-of-work scopes.

use crate::context::{DbContext, SharedTransaction};
use crate::error::{UowError, UowResult};
use crate::registry::CallChain;
use crate::scope::{DbContextScope, NonAmbientDbContextScope};
use crate::types::{ContextKind, IsolationLevel, Mode};
use std::collections::HashMap;

type ContextBuilder = Box<dyn Fn() -> Box<dyn DbContext> + Send + Sync>;

/// Builds ambient and non-ambient scopes from registered context
/// constructors.
///
/// Each [`ContextKind`] the application uses is registered once with a
/// closure producing a fresh context of that kind. The presets mirror
/// the common acquisition patterns: read-only and writable ambient
/// scopes default to [`IsolationLevel::Serializable`] unless told
/// otherwise, and the external-transaction form requests no isolation
/// at all because the caller's transaction already fixed it.
#[derive(Default)]
pub struct DbContextScopeFactory {
    builders: HashMap<ContextKind, ContextBuilder>,
}

impl DbContextScopeFactory {
    /// Creates a factory with no registered context kinds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the constructor for contexts of `kind`. A later
    /// registration for the same kind replaces the earlier one.
    pub fn register<F>(&mut self, kind: ContextKind, build: F)
    where
        F: Fn() -> Box<dyn DbContext> + Send + Sync + 'static,
    {
        self.builders.insert(kind, Box::new(build));
    }

    /// True when a constructor for `kind` is registered.
    #[must_use]
    pub fn is_registered(&self, kind: ContextKind) -> bool {
        self.builders.contains_key(&kind)
    }

    /// Opens a read-only ambient scope at the strictest isolation.
    pub fn create_ambient_read(
        &self,
        chain: &CallChain,
        kind: ContextKind,
    ) -> UowResult<DbContextScope> {
        self.create_ambient_read_with(chain, kind, IsolationLevel::Serializable)
    }

    /// Opens a read-only ambient scope at the given isolation.
    pub fn create_ambient_read_with(
        &self,
        chain: &CallChain,
        kind: ContextKind,
        isolation: IsolationLevel,
    ) -> UowResult<DbContextScope> {
        let build = self.builder(kind)?;
        DbContextScope::open(chain, kind, Mode::Read, Some(isolation), None, build)
    }

    /// Opens a writable ambient scope at the strictest isolation.
    pub fn create_ambient_write(
        &self,
        chain: &CallChain,
        kind: ContextKind,
    ) -> UowResult<DbContextScope> {
        self.create_ambient_write_with(chain, kind, IsolationLevel::Serializable)
    }

    /// Opens a writable ambient scope at the given isolation.
    pub fn create_ambient_write_with(
        &self,
        chain: &CallChain,
        kind: ContextKind,
        isolation: IsolationLevel,
    ) -> UowResult<DbContextScope> {
        let build = self.builder(kind)?;
        DbContextScope::open(chain, kind, Mode::Write, Some(isolation), None, build)
    }

    /// Opens a writable ambient scope around a transaction the caller
    /// already started. The scope never commits or rolls the adopted
    /// transaction back; the caller finalizes it through its own clone
    /// of the handle. No isolation level is requested because the
    /// external transaction already fixed it.
    pub fn create_ambient_with_external_transaction(
        &self,
        chain: &CallChain,
        kind: ContextKind,
        transaction: SharedTransaction,
    ) -> UowResult<DbContextScope> {
        let build = self.builder(kind)?;
        DbContextScope::open(chain, kind, Mode::Write, None, Some(transaction), build)
    }

    /// Opens a writable non-ambient scope at the strictest isolation.
    pub fn create_non_ambient_write(
        &self,
        chain: &CallChain,
        kind: ContextKind,
    ) -> UowResult<NonAmbientDbContextScope> {
        self.create_non_ambient_write_with(chain, kind, IsolationLevel::Serializable)
    }

    /// Opens a writable non-ambient scope at the given isolation.
    pub fn create_non_ambient_write_with(
        &self,
        chain: &CallChain,
        kind: ContextKind,
        isolation: IsolationLevel,
    ) -> UowResult<NonAmbientDbContextScope> {
        let build = self.builder(kind)?;
        NonAmbientDbContextScope::open(chain, Mode::Write, Some(isolation), build)
    }

    fn builder(&self, kind: ContextKind) -> UowResult<&dyn Fn() -> Box<dyn DbContext>> {
        match self.builders.get(&kind) {
            Some(build) => Ok(build.as_ref()),
            None => Err(UowError::UnknownContext { kind }),
        }
    }
}

impl std::fmt::Debug for DbContextScopeFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbContextScopeFactory")
            .field("registered_kinds", &self.builders.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{probed_builder, StubContext, StubProbe, OTHER, STUB};
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    fn factory() -> (DbContextScopeFactory, Arc<StubProbe>) {
        let probe = Arc::new(StubProbe::default());
        let mut factory = DbContextScopeFactory::new();
        factory.register(STUB, probed_builder(STUB, &probe));
        (factory, probe)
    }

    #[test]
    fn unregistered_kind_is_an_error() {
        let (factory, _probe) = factory();
        let chain = CallChain::new();
        let result = factory.create_ambient_write(&chain, OTHER);
        assert!(matches!(result, Err(UowError::UnknownContext { .. })));
        assert!(!chain.has_ambient());
    }

    #[test]
    fn read_preset_requests_serializable() {
        let (factory, _probe) = factory();
        let chain = CallChain::new();
        let scope = factory.create_ambient_read(&chain, STUB).unwrap();
        assert_eq!(
            scope.context_set().isolation(),
            Some(IsolationLevel::Serializable)
        );
        assert_eq!(scope.context_set().mode_of(STUB), Some(Mode::Read));
        scope.dispose().unwrap();
    }

    #[test]
    fn write_preset_nests_with_itself() {
        let (factory, probe) = factory();
        let chain = CallChain::new();

        let mut outer = factory.create_ambient_write(&chain, STUB).unwrap();
        {
            let mut inner = factory.create_ambient_write(&chain, STUB).unwrap();
            assert!(!inner.is_owner());
            inner
                .context_set()
                .with_context_as::<StubContext, _>(STUB, |cx| {
                    cx.track();
                })
                .unwrap();
            inner.save_changes().unwrap();
            inner.dispose().unwrap();
        }
        outer.save_and_commit().unwrap();
        outer.dispose().unwrap();
        assert_eq!(probe.persists.load(Ordering::SeqCst), 1);
        assert_eq!(probe.commits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn non_ambient_preset_detaches_the_chain() {
        let (factory, _probe) = factory();
        let chain = CallChain::new();

        let outer = factory.create_ambient_write(&chain, STUB).unwrap();
        let side = factory.create_non_ambient_write(&chain, STUB).unwrap();
        assert!(!chain.has_ambient());
        side.dispose().unwrap();
        assert!(chain.has_ambient());
        outer.dispose().unwrap();
    }

    #[test]
    fn registration_replaces_earlier_builder() {
        let (mut factory, _probe) = factory();
        let replacement = Arc::new(StubProbe::default());
        factory.register(STUB, probed_builder(STUB, &replacement));
        assert!(factory.is_registered(STUB));
        let chain = CallChain::new();
        let mut scope = factory.create_ambient_write(&chain, STUB).unwrap();
        scope
            .context_set()
            .with_context_as::<StubContext, _>(STUB, |cx| {
                cx.track();
            })
            .unwrap();
        scope.save_and_commit().unwrap();
        assert_eq!(replacement.persists.load(Ordering::SeqCst), 1);
        scope.dispose().unwrap();
    }
}
