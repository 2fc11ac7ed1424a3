//! Storage backends for the satchel store.
//!
//! Provides the backend contract ([`traits::Backend`],
//! [`traits::BackendStore`], [`traits::BackendSession`]), the
//! category/release registry, two backend implementations (embedded
//! SQLite, networked PostgreSQL), forward schema migrations, and the
//! public [`DbStore`] facade through which consumers reach all of it.
//!
//! Consumers never see a backend type: they provision or open a store by
//! URI, obtain sessions and transactions from it, and operate on items by
//! category and name, optionally filtered by a WQL tag query.

pub(crate) mod active;
pub mod error;
pub mod migrations;
pub mod postgres;
pub mod registry;
pub mod sqlite;
pub mod store;
pub mod traits;

// Re-exports for convenience.
pub use error::{DatabaseError, DatabaseErrorCode};
pub use satchel_core::{Entry, EntryTag, Profile, StoreError, StoreErrorKind};
pub use store::{DbSession, DbStore, OpenOptions, ProvisionOptions, register_backend};
pub use traits::{PoolOptions, Scan, SchemaConfig};
