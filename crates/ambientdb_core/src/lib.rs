//! # AmbientDB Core
//!
//! Ambient unit-of-work scopes for transactional resources.
//!
//! This crate provides:
//! - Explicit call-chain handles carrying ambient scope state
//! - Join-or-create scopes with exactly-one-owner finalization
//! - Resource sets holding one context per kind, each with its transaction
//! - Non-ambient scopes for isolated side transactions
//! - A scope factory and an ambient-context locator
//!
//! ## Usage
//!
//! ```rust,ignore
//! let chain = CallChain::new();
//! let mut scope = factory.create_ambient_write(&chain, ORDERS)?;
//! DbContextLocator::with_current_as::<OrdersContext, _>(&chain, ORDERS, |cx| {
//!     cx.insert(...);
//! })?;
//! scope.save_and_commit()?;
//! scope.dispose()?;
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod collection;
pub mod context;
pub mod error;
pub mod factory;
pub mod locator;
pub mod registry;
pub mod scope;
#[cfg(test)]
mod test_support;
pub mod types;

pub use collection::ContextSet;
pub use context::{share_transaction, DbContext, DbTransaction, GuardedContext, SharedTransaction};
pub use error::{UowError, UowResult, ValidationFailure};
pub use factory::DbContextScopeFactory;
pub use locator::DbContextLocator;
pub use registry::CallChain;
pub use scope::{DbContextScope, NonAmbientDbContextScope};
pub use types::{
    ContextKind, EntityKey, EntryState, IsolationLevel, Mode, PendingCounts, ScopeKey,
};
