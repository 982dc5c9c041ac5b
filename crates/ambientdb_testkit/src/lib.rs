//! # AmbientDB Testkit
//!
//! Test utilities for AmbientDB.
//!
//! This crate provides:
//! - An in-memory committed store ([`MemStore`])
//! - In-memory context and transaction implementations
//! - Shared context-kind fixtures and pre-wired scope factories
//!
//! ## Usage
//!
//! ```rust,ignore
//! use ambientdb_testkit::prelude::*;
//!
//! #[test]
//! fn test_with_scope() {
//!     let (factory, store) = blog_factory();
//!     let chain = CallChain::new();
//!     let mut scope = factory.create_ambient_write(&chain, BLOG).unwrap();
//!     // ... operations via the locator
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod context;
pub mod fixtures;
pub mod store;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::context::*;
    pub use crate::fixtures::*;
    pub use crate::store::*;
}

pub use context::*;
pub use fixtures::*;
pub use store::*;
