//! Shared fixtures: context kinds and pre-wired factories.

use crate::context::MemDbContext;
use crate::store::{MemStore, Record};
use ambientdb_core::{ContextKind, DbContextScopeFactory, EntityKey};
use std::sync::Arc;
use uuid::Uuid;

/// Blogging context kind used throughout the tests.
pub const BLOG: ContextKind = ContextKind::new(1, "blog");
/// Posting context kind, for multi-kind resource sets.
pub const POST: ContextKind = ContextKind::new(2, "post");
/// User-profile context kind.
pub const USER: ContextKind = ContextKind::new(3, "user");

/// A factory with [`BLOG`], [`POST`] and [`USER`] contexts registered
/// over one shared store.
#[must_use]
pub fn blog_factory() -> (DbContextScopeFactory, Arc<MemStore>) {
    let store = MemStore::shared();
    let mut factory = DbContextScopeFactory::new();
    for kind in [BLOG, POST, USER] {
        let store = Arc::clone(&store);
        factory.register(kind, move || {
            Box::new(MemDbContext::new(kind, Arc::clone(&store)))
        });
    }
    (factory, store)
}

/// Builds a record from field pairs.
#[must_use]
pub fn record<'a>(fields: impl IntoIterator<Item = (&'a str, &'a str)>) -> Record {
    fields
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Commits a record directly into the store, outside any scope, and
/// returns its key. Test seeding only.
pub fn seed<'a>(
    store: &MemStore,
    table: &str,
    fields: impl IntoIterator<Item = (&'a str, &'a str)>,
) -> EntityKey {
    let id = Uuid::new_v4();
    store.put(table, id, record(fields));
    EntityKey::new(table, id)
}
