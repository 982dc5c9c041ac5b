//! Ambient registry: associates a logical call chain with its resource set.
//!
//! The original design for this kind of machinery relies on a runtime's
//! notion of "logical call context" flowing implicitly across awaits.
//! Here the chain is an explicit value: a [`CallChain`] is created at
//! the top of each logical call chain and cloned into every function or
//! spawned continuation that needs ambient state. Two chains that must
//! not see each other's scopes simply never share a `CallChain`.

use crate::collection::ContextSet;
use crate::types::ScopeKey;
use parking_lot::Mutex;
use std::sync::Arc;

/// The registry entry for one chain: the current scope key and its set.
#[derive(Clone)]
pub(crate) struct AmbientEntry {
    pub(crate) key: ScopeKey,
    pub(crate) set: Arc<ContextSet>,
}

/// Handle identifying one logical call chain.
///
/// Cloning is cheap and shares the same ambient slot: pass a clone into
/// any asynchronous continuation that should observe the chain's
/// ambient scope, including tasks resumed on a different worker. A
/// fresh `CallChain::new()` starts an unrelated chain with no ambient
/// state.
#[derive(Clone, Default)]
pub struct CallChain {
    slot: Arc<Mutex<Option<AmbientEntry>>>,
}

impl CallChain {
    /// Creates a new, empty call chain.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the resource set published for this chain, if a scope is open.
    #[must_use]
    pub fn current(&self) -> Option<Arc<ContextSet>> {
        self.slot.lock().as_ref().map(|entry| Arc::clone(&entry.set))
    }

    /// True when a scope is open on this chain.
    #[must_use]
    pub fn has_ambient(&self) -> bool {
        self.slot.lock().is_some()
    }

    /// Records `set` as current for this chain.
    pub(crate) fn publish(&self, key: ScopeKey, set: Arc<ContextSet>) {
        tracing::debug!(%key, "publishing ambient resource set");
        *self.slot.lock() = Some(AmbientEntry { key, set });
    }

    /// Removes the published entry for this chain.
    pub(crate) fn clear(&self) {
        if let Some(entry) = self.slot.lock().take() {
            tracing::debug!(key = %entry.key, "clearing ambient resource set");
        }
    }

    /// Detaches and returns the current entry (memento capture).
    pub(crate) fn take_entry(&self) -> Option<AmbientEntry> {
        self.slot.lock().take()
    }

    /// Reinstates a previously captured entry verbatim.
    pub(crate) fn restore(&self, entry: Option<AmbientEntry>) {
        *self.slot.lock() = entry;
    }
}

impl std::fmt::Debug for CallChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallChain")
            .field("has_ambient", &self.has_ambient())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_chain_has_no_ambient_state() {
        let chain = CallChain::new();
        assert!(!chain.has_ambient());
        assert!(chain.current().is_none());
    }

    #[test]
    fn publish_and_clear() {
        let chain = CallChain::new();
        let set = Arc::new(ContextSet::new());
        chain.publish(ScopeKey::new(), Arc::clone(&set));
        assert!(chain.has_ambient());
        assert!(Arc::ptr_eq(&chain.current().unwrap(), &set));

        chain.clear();
        assert!(chain.current().is_none());
    }

    #[test]
    fn clones_share_the_slot() {
        let chain = CallChain::new();
        let continuation = chain.clone();
        chain.publish(ScopeKey::new(), Arc::new(ContextSet::new()));
        assert!(continuation.has_ambient());
    }

    #[test]
    fn sibling_chains_are_isolated() {
        let a = CallChain::new();
        let b = CallChain::new();
        a.publish(ScopeKey::new(), Arc::new(ContextSet::new()));
        assert!(!b.has_ambient());
    }

    #[test]
    fn take_and_restore_round_trip() {
        let chain = CallChain::new();
        let set = Arc::new(ContextSet::new());
        let key = ScopeKey::new();
        chain.publish(key, Arc::clone(&set));

        let memento = chain.take_entry();
        assert!(chain.current().is_none());

        chain.restore(memento);
        let restored = chain.current().unwrap();
        assert!(Arc::ptr_eq(&restored, &set));
    }
}
