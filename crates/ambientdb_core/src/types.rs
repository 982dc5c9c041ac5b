//! Core type definitions for AmbientDB.

use std::fmt;
use uuid::Uuid;

/// Access mode requested for a database context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    /// The context may only read; pending changes at save time are an error.
    Read,
    /// The context may read and write.
    Write,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Read => write!(f, "read"),
            Mode::Write => write!(f, "write"),
        }
    }
}

/// Transaction isolation level, delegated to the underlying resource.
///
/// The scope machinery never interprets these beyond equality checks;
/// it only forbids a child scope from overriding the level an ambient
/// transaction was established with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum IsolationLevel {
    /// Dirty reads permitted.
    ReadUncommitted,
    /// Only committed data is visible. The baseline level; requesting it
    /// in a child scope is never treated as an override.
    #[default]
    ReadCommitted,
    /// Rows read within the transaction cannot change underneath it.
    RepeatableRead,
    /// Full serializable isolation.
    Serializable,
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IsolationLevel::ReadUncommitted => "read-uncommitted",
            IsolationLevel::ReadCommitted => "read-committed",
            IsolationLevel::RepeatableRead => "repeatable-read",
            IsolationLevel::Serializable => "serializable",
        };
        write!(f, "{name}")
    }
}

/// Compile-time tag identifying a resource (context) type.
///
/// Replaces runtime type lookup: every concrete context implementation
/// declares its kind as a constant, and a resource set holds at most one
/// handle per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextKind {
    id: u16,
    name: &'static str,
}

impl ContextKind {
    /// Creates a new context kind tag.
    #[must_use]
    pub const fn new(id: u16, name: &'static str) -> Self {
        Self { id, name }
    }

    /// Returns the numeric id.
    #[must_use]
    pub const fn id(self) -> u16 {
        self.id
    }

    /// Returns the human-readable name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        self.name
    }
}

impl fmt::Display for ContextKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.name, self.id)
    }
}

/// Opaque correlation token created once per scope instance.
///
/// Used only to correlate a scope with its registry entry; never
/// compared by value across instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScopeKey(Uuid);

impl ScopeKey {
    /// Creates a fresh, unique scope key.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ScopeKey {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "scope:{}", self.0)
    }
}

/// Identity of a tracked entity: collection name plus row id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntityKey {
    /// Collection (table) the entity belongs to.
    pub collection: String,
    /// Row identifier.
    pub id: Uuid,
}

impl EntityKey {
    /// Creates an entity key.
    #[must_use]
    pub fn new(collection: impl Into<String>, id: Uuid) -> Self {
        Self {
            collection: collection.into(),
            id,
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.id)
    }
}

/// Tracking state of an entity inside a context's cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    /// Loaded from the store and not modified since.
    Unchanged,
    /// Newly added; not yet persisted.
    Added,
    /// Loaded and then modified.
    Modified,
    /// Marked for deletion.
    Deleted,
}

/// Counts of pending (unpersisted) changes held by a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PendingCounts {
    /// Entities added.
    pub added: usize,
    /// Entities modified.
    pub modified: usize,
    /// Entities removed.
    pub removed: usize,
}

impl PendingCounts {
    /// Returns true when no changes are pending.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.added == 0 && self.modified == 0 && self.removed == 0
    }

    /// Total number of pending changes.
    #[must_use]
    pub const fn total(self) -> usize {
        self.added + self.modified + self.removed
    }
}

impl fmt::Display for PendingCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} added, {} modified, {} removed",
            self.added, self.modified, self.removed
        )
    }
}
