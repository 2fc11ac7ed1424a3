//! Networked server backend (PostgreSQL, schema-namespaced per tenant).

pub mod backend;
pub mod config;
pub mod database;
pub mod handlers;
pub mod pool;
pub mod schema;
pub mod session;

pub use backend::PostgresBackend;
pub use config::PostgresConfig;
pub use database::PostgresStore;
pub use pool::{PgPoolConfig, PooledPgConn, PostgresConnectionPool};
pub use schema::SchemaContext;
