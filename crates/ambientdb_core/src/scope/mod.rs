//! Unit-of-work scopes.
//!
//! [`DbContextScope`] joins or creates the ambient resource set of a
//! call chain; [`NonAmbientDbContextScope`] detaches the ambient set
//! and runs a private one for side transactions.

mod ambient;
mod non_ambient;

pub use ambient::DbContextScope;
pub use non_ambient::NonAmbientDbContextScope;
