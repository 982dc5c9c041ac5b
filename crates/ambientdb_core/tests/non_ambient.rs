//! Integration tests for non-ambient (detached) scopes.

use ambientdb_core::{CallChain, DbContextLocator, UowError};
use ambientdb_testkit::{blog_factory, seed, MemDbContext, BLOG, USER};
use std::sync::Arc;

#[test]
fn side_transaction_survives_ambient_rollback() {
    let (factory, store) = blog_factory();
    let chain = CallChain::new();

    let outer = factory.create_ambient_write(&chain, BLOG).unwrap();
    DbContextLocator::with_current_as::<MemDbContext, _>(&chain, BLOG, |cx| {
        cx.insert("blogs", [("overview", "doomed")]);
    })
    .unwrap();

    // Record a failure counter in its own transaction.
    {
        let mut side = factory.create_non_ambient_write(&chain, USER).unwrap();
        DbContextLocator::with_non_ambient_as::<MemDbContext, _>(&side, USER, |cx| {
            cx.insert("counters", [("failed_logins", "1")]);
        })
        .unwrap();
        side.save_and_commit().unwrap();
        side.dispose().unwrap();
    }

    // Abandon the enclosing write scope without saving.
    outer.dispose().unwrap();

    assert_eq!(store.count("counters"), 1);
    assert_eq!(store.count("blogs"), 0);
}

#[test]
fn ambient_state_is_restored_losslessly() {
    let (factory, _store) = blog_factory();
    let chain = CallChain::new();

    let outer = factory.create_ambient_write(&chain, BLOG).unwrap();
    let ambient_before = chain.current().unwrap();

    let side = factory.create_non_ambient_write(&chain, BLOG).unwrap();
    assert!(!chain.has_ambient());
    side.dispose().unwrap();

    let ambient_after = chain.current().unwrap();
    assert!(Arc::ptr_eq(&ambient_before, &ambient_after));
    outer.dispose().unwrap();
}

#[test]
fn works_with_no_enclosing_scope() {
    let (factory, store) = blog_factory();
    let chain = CallChain::new();

    let mut side = factory.create_non_ambient_write(&chain, BLOG).unwrap();
    DbContextLocator::with_non_ambient_as::<MemDbContext, _>(&side, BLOG, |cx| {
        cx.insert("blogs", [("overview", "standalone")]);
    })
    .unwrap();
    side.save_and_commit().unwrap();
    side.dispose().unwrap();

    assert!(!chain.has_ambient());
    assert_eq!(store.count("blogs"), 1);
}

#[test]
fn locator_does_not_resolve_the_private_handle() {
    let (factory, _store) = blog_factory();
    let chain = CallChain::new();

    let side = factory.create_non_ambient_write(&chain, BLOG).unwrap();
    let result = DbContextLocator::with_current(&chain, BLOG, |_| ());
    assert!(matches!(result, Err(UowError::NoAmbientScope)));
    side.dispose().unwrap();
}

#[test]
fn refresh_updates_unchanged_parent_copies() {
    let (factory, store) = blog_factory();
    let chain = CallChain::new();
    let key = seed(&store, "users", [("status", "active")]);

    let outer = factory.create_ambient_write(&chain, USER).unwrap();
    DbContextLocator::with_current_as::<MemDbContext, _>(&chain, USER, |cx| {
        cx.load(&key).unwrap();
    })
    .unwrap();

    let mut side = factory.create_non_ambient_write(&chain, USER).unwrap();
    DbContextLocator::with_non_ambient_as::<MemDbContext, _>(&side, USER, |cx| {
        cx.load(&key).unwrap();
        assert!(cx.update(&key, "status", "locked"));
    })
    .unwrap();
    side.save_and_commit().unwrap();

    let refreshed = side.refresh_parent_cache(std::slice::from_ref(&key)).unwrap();
    assert_eq!(refreshed, 1);
    side.dispose().unwrap();

    let seen = DbContextLocator::with_current_as::<MemDbContext, _>(&chain, USER, |cx| {
        cx.get_field(&key, "status")
    })
    .unwrap();
    assert_eq!(seen.as_deref(), Some("locked"));
    outer.dispose().unwrap();
}

#[test]
fn refresh_leaves_pending_parent_modifications_alone() {
    let (factory, store) = blog_factory();
    let chain = CallChain::new();
    let key = seed(&store, "users", [("status", "active")]);

    let outer = factory.create_ambient_write(&chain, USER).unwrap();
    DbContextLocator::with_current_as::<MemDbContext, _>(&chain, USER, |cx| {
        cx.load(&key).unwrap();
        assert!(cx.update(&key, "status", "suspended"));
    })
    .unwrap();

    let mut side = factory.create_non_ambient_write(&chain, USER).unwrap();
    DbContextLocator::with_non_ambient_as::<MemDbContext, _>(&side, USER, |cx| {
        cx.load(&key).unwrap();
        assert!(cx.update(&key, "status", "locked"));
    })
    .unwrap();
    side.save_and_commit().unwrap();

    // The parent's pending edit wins locally; the store arbitrates later.
    let refreshed = side.refresh_parent_cache(std::slice::from_ref(&key)).unwrap();
    assert_eq!(refreshed, 0);
    side.dispose().unwrap();

    let seen = DbContextLocator::with_current_as::<MemDbContext, _>(&chain, USER, |cx| {
        cx.get_field(&key, "status")
    })
    .unwrap();
    assert_eq!(seen.as_deref(), Some("suspended"));
    outer.dispose().unwrap();
}

#[test]
fn restoration_happens_even_when_save_fails() {
    let (factory, store) = blog_factory();
    let chain = CallChain::new();

    let outer = factory.create_ambient_write(&chain, BLOG).unwrap();
    let ambient_before = chain.current().unwrap();

    let mut side = factory.create_non_ambient_write(&chain, BLOG).unwrap();
    DbContextLocator::with_non_ambient_as::<MemDbContext, _>(&side, BLOG, |cx| {
        cx.insert("blogs", [("overview", "")]);
    })
    .unwrap();
    let err = side.save_and_commit().unwrap_err();
    assert!(matches!(err, UowError::Validation { .. }));
    side.dispose().unwrap();

    assert!(Arc::ptr_eq(&chain.current().unwrap(), &ambient_before));
    assert_eq!(store.count("blogs"), 0);
    outer.dispose().unwrap();
}

#[test]
fn drop_restores_the_detached_state() {
    let (factory, _store) = blog_factory();
    let chain = CallChain::new();

    let outer = factory.create_ambient_write(&chain, BLOG).unwrap();
    {
        let _side = factory.create_non_ambient_write(&chain, BLOG).unwrap();
        assert!(!chain.has_ambient());
    }
    assert!(chain.has_ambient());
    outer.dispose().unwrap();
}
