//! Locator: ambient context access for application code.

use crate::context::{DbContext, GuardedContext};
use crate::error::{UowError, UowResult};
use crate::registry::CallChain;
use crate::scope::NonAmbientDbContextScope;
use crate::types::ContextKind;

/// Fetches "the current ambient context of this kind" for code that
/// did not open the scope itself.
///
/// Repositories and services call the locator instead of threading a
/// context parameter through every signature. When no scope is open on
/// the chain the lookup fails with [`UowError::NoAmbientScope`]; a
/// non-ambient scope's private handle is deliberately invisible here
/// and must be reached through
/// [`with_non_ambient`](DbContextLocator::with_non_ambient).
#[derive(Debug, Default, Clone, Copy)]
pub struct DbContextLocator;

impl DbContextLocator {
    /// Runs `f` with the chain's current ambient handle of `kind`.
    pub fn with_current<R>(
        chain: &CallChain,
        kind: ContextKind,
        f: impl FnOnce(&mut GuardedContext) -> R,
    ) -> UowResult<R> {
        let set = chain.current().ok_or(UowError::NoAmbientScope)?;
        set.with_context(kind, f)
    }

    /// Runs `f` with the chain's current ambient context, downcast to
    /// the concrete type `T`.
    pub fn with_current_as<T: DbContext + 'static, R>(
        chain: &CallChain,
        kind: ContextKind,
        f: impl FnOnce(&mut T) -> R,
    ) -> UowResult<R> {
        let set = chain.current().ok_or(UowError::NoAmbientScope)?;
        set.with_context_as(kind, f)
    }

    /// Runs `f` with a non-ambient scope's private handle of `kind`.
    pub fn with_non_ambient<R>(
        scope: &NonAmbientDbContextScope,
        kind: ContextKind,
        f: impl FnOnce(&mut GuardedContext) -> R,
    ) -> UowResult<R> {
        scope.with_context(kind, f)
    }

    /// Runs `f` with a non-ambient scope's private context, downcast
    /// to the concrete type `T`.
    pub fn with_non_ambient_as<T: DbContext + 'static, R>(
        scope: &NonAmbientDbContextScope,
        kind: ContextKind,
        f: impl FnOnce(&mut T) -> R,
    ) -> UowResult<R> {
        scope.with_context_as(kind, f)
    }
}
