//! The backend-agnostic store contract.
//!
//! A [`Backend`] knows how to provision, open, and remove stores for one
//! URI scheme. Opening yields a [`BackendStore`], which produces
//! [`BackendSession`]s (plain or transactional) and store-scope scans.
//! Consumers depend on these traits through the [`crate::store::DbStore`]
//! facade rather than on concrete backends.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use satchel_core::{Entry, EntryTag};
use satchel_query::TagQuery;

use crate::error::{DatabaseError, DatabaseErrorCode, DbResult};

/// Rows fetched per page by store-scope scans.
pub const SCAN_PAGE_SIZE: usize = 32;

/// Storage mode of a provisioned store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchemaConfig {
    /// All tags live in the common `items_tags` table; the store stays at
    /// `release_0`.
    #[default]
    Generic,
    /// Selected tags are projected into typed columns in per-category
    /// tables, per the release's descriptors.
    Normalize,
}

impl SchemaConfig {
    /// Value persisted in the `config` table.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Generic => "generic",
            Self::Normalize => "normalize",
        }
    }

    /// Parses the persisted form.
    pub fn from_str(value: &str) -> DbResult<Self> {
        match value {
            "generic" => Ok(Self::Generic),
            "normalize" => Ok(Self::Normalize),
            other => Err(DatabaseError::new(
                DatabaseErrorCode::QueryError,
                format!("unknown schema_config value '{other}'"),
            )),
        }
    }
}

/// Pool and session limits shared by both backends.
///
/// `None` fields take backend defaults. The server backend additionally
/// accepts the same fields as URI query parameters; explicit struct values
/// win over URI values.
#[derive(Debug, Clone, Default)]
pub struct PoolOptions {
    /// Connections opened eagerly and kept alive.
    pub min_connections: Option<usize>,
    /// Hard cap on live connections.
    pub max_connections: Option<usize>,
    /// How long `acquire` blocks before `ConnectionPoolExhausted`.
    pub acquire_timeout: Option<Duration>,
    /// Idle connections older than this are retired by the keep-alive task.
    pub max_idle: Option<Duration>,
    /// Connections older than this are retired regardless of use.
    pub max_lifetime: Option<Duration>,
    /// Cap on concurrently active sessions; defaults to 3/4 of
    /// `max_connections`.
    pub max_sessions: Option<usize>,
    /// Age after which the background monitor force-closes a session.
    pub session_timeout: Option<Duration>,
}

/// Provisioning parameters, backend-independent.
#[derive(Debug, Clone)]
pub struct ProvisionSpec {
    /// Name for the default profile; a generated name when `None`.
    pub profile: Option<String>,
    /// Encryption key (embedded backend only).
    pub pass_key: Option<String>,
    /// Drop any existing store at the location first.
    pub recreate: bool,
    /// Requested schema release.
    pub release_number: String,
    /// Storage mode; `Generic` forces the effective release to `release_0`.
    pub schema_config: SchemaConfig,
    /// Pool limits.
    pub pool: PoolOptions,
}

/// Open parameters, backend-independent.
#[derive(Debug, Clone)]
pub struct OpenSpec {
    /// Profile to resolve; the stored default profile when `None`.
    pub profile: Option<String>,
    /// Encryption key (embedded backend only).
    pub pass_key: Option<String>,
    /// Expected schema release for normalized stores; a mismatch fails
    /// with `UnsupportedVersion`.
    pub target_release: Option<String>,
    /// Pool limits.
    pub pool: PoolOptions,
}

/// Validates a caller-supplied `order_by` column, returning the effective
/// column name. Only known item columns are accepted; everything else is
/// rejected so that no caller input reaches SQL text.
pub fn validate_order_by(order_by: Option<&str>) -> DbResult<&'static str> {
    match order_by {
        None | Some("id") => Ok("id"),
        Some("name") => Ok("name"),
        Some("category") => Ok("category"),
        Some("created_at") => Ok("created_at"),
        Some(other) => Err(DatabaseError::new(
            DatabaseErrorCode::QueryError,
            format!("unsupported order_by column '{other}'"),
        )),
    }
}

/// A lazy sequence of entries produced by a store-scope scan.
///
/// Batches arrive through a bounded channel from a background task that
/// owns the connection for the duration of the scan; dropping the scan
/// cancels the task and releases the connection.
pub struct Scan {
    rx: mpsc::Receiver<DbResult<Vec<Entry>>>,
    done: bool,
}

impl Scan {
    pub(crate) fn new(rx: mpsc::Receiver<DbResult<Vec<Entry>>>) -> Self {
        Self { rx, done: false }
    }

    /// Returns the next batch of entries, or `None` when the scan is
    /// drained. After an error or a clean drain, subsequent calls return
    /// `None`.
    pub async fn fetch_next(&mut self) -> Result<Option<Vec<Entry>>, satchel_core::StoreError> {
        if self.done {
            return Ok(None);
        }
        match self.rx.recv().await {
            Some(Ok(batch)) => Ok(Some(batch)),
            Some(Err(err)) => {
                self.done = true;
                Err(err.into())
            }
            None => {
                self.done = true;
                Ok(None)
            }
        }
    }

    /// Drains the scan into a single vector.
    pub async fn collect_all(mut self) -> Result<Vec<Entry>, satchel_core::StoreError> {
        let mut entries = Vec::new();
        while let Some(batch) = self.fetch_next().await? {
            entries.extend(batch);
        }
        Ok(entries)
    }
}

impl std::fmt::Debug for Scan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scan").field("done", &self.done).finish()
    }
}

/// A live, opened store: owns the pool and produces sessions.
#[async_trait]
pub trait BackendStore: Send + Sync {
    /// Schema release this store was opened at.
    fn release_number(&self) -> &str;

    /// Name of the default profile.
    fn profile_name(&self) -> &str;

    /// Creates a profile; a name is generated when `None`. Fails with
    /// `ProfileAlreadyExists` when taken.
    async fn create_profile(&self, name: Option<String>) -> DbResult<String>;

    /// Removes a profile and (by cascade) its items. Returns whether a
    /// profile was removed.
    async fn remove_profile(&self, name: &str) -> DbResult<bool>;

    /// Rotates the store encryption key. Embedded backend only; the
    /// server backend fails with `UnsupportedOperation`.
    async fn rekey(&self, pass_key: &str) -> DbResult<()>;

    /// Store-scope offset scan. Acquires its own connection, yields
    /// lazily, and releases the connection when drained or dropped.
    async fn scan(
        &self,
        profile: Option<&str>,
        category: &str,
        tag_filter: Option<TagQuery>,
        offset: Option<i64>,
        limit: Option<i64>,
        order_by: Option<String>,
        descending: bool,
    ) -> DbResult<Scan>;

    /// Store-scope keyset scan, resuming after `last_id`, ordered by item
    /// id ascending.
    async fn scan_keyset(
        &self,
        profile: Option<&str>,
        category: &str,
        tag_filter: Option<TagQuery>,
        last_id: Option<i64>,
        limit: Option<i64>,
    ) -> DbResult<Scan>;

    /// Opens a session (`transaction = false`) or transaction
    /// (`transaction = true`) bound to one pooled connection. Fails with
    /// `ConnectionPoolExhausted` when the active-session cap is reached.
    async fn session(
        &self,
        profile: Option<&str>,
        transaction: bool,
    ) -> DbResult<Box<dyn BackendSession>>;

    /// Stops the background monitor, closes the pool, and optionally
    /// removes the store.
    async fn close(&self, remove: bool) -> DbResult<()>;
}

/// A scoped handle bound to one pooled connection and one profile.
///
/// In session mode each operation commits its own work; in transaction
/// mode effects become visible only on [`BackendSession::commit`].
#[async_trait]
pub trait BackendSession: Send {
    /// Whether this session was opened as a transaction.
    fn is_transaction(&self) -> bool;

    /// Counts items in a category matching the filter.
    async fn count(&mut self, category: &str, tag_filter: Option<TagQuery>) -> DbResult<u64>;

    /// Inserts a new item. Fails with `DuplicateItemEntry` when the
    /// `(profile, category, name)` already exists.
    async fn insert(
        &mut self,
        category: &str,
        name: &str,
        value: &str,
        tags: &[EntryTag],
        expiry_ms: Option<i64>,
    ) -> DbResult<()>;

    /// Replaces an existing item's value and tags in full. Fails with
    /// `RecordNotFound` when the target does not exist.
    async fn replace(
        &mut self,
        category: &str,
        name: &str,
        value: &str,
        tags: &[EntryTag],
        expiry_ms: Option<i64>,
    ) -> DbResult<()>;

    /// Fetches one item by name, optionally constrained by a tag filter.
    async fn fetch(
        &mut self,
        category: &str,
        name: &str,
        tag_filter: Option<TagQuery>,
        for_update: bool,
    ) -> DbResult<Option<Entry>>;

    /// Fetches all matching items.
    async fn fetch_all(
        &mut self,
        category: &str,
        tag_filter: Option<TagQuery>,
        limit: Option<i64>,
        for_update: bool,
        order_by: Option<String>,
        descending: bool,
    ) -> DbResult<Vec<Entry>>;

    /// Removes one item. Fails with `RecordNotFound` when absent.
    async fn remove(&mut self, category: &str, name: &str) -> DbResult<()>;

    /// Removes all matching items, returning the count removed.
    async fn remove_all(&mut self, category: &str, tag_filter: Option<TagQuery>) -> DbResult<u64>;

    /// Commits and closes a transaction.
    async fn commit(&mut self) -> DbResult<()>;

    /// Rolls back and closes a transaction.
    async fn rollback(&mut self) -> DbResult<()>;

    /// Closes the session, committing implicit work in session mode and
    /// rolling back an uncommitted transaction. Always releases the
    /// connection.
    async fn close(&mut self) -> DbResult<()>;
}

impl std::fmt::Debug for dyn Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend").finish()
    }
}

/// Entry points of one backend, selected by URI scheme.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Creates a fresh store at the URI location.
    async fn provision(&self, uri: &str, spec: &ProvisionSpec) -> DbResult<Arc<dyn BackendStore>>;

    /// Opens an existing store.
    async fn open(&self, uri: &str, spec: &OpenSpec) -> DbResult<Arc<dyn BackendStore>>;

    /// Removes the store, returning whether anything was removed.
    async fn remove(&self, uri: &str) -> DbResult<bool>;

    /// Applies forward migrations up to `target_release` and persists the
    /// new release number.
    async fn migrate(&self, uri: &str, target_release: &str) -> DbResult<()>;

    /// Translates a backend error into the caller-facing error.
    fn translate_error(&self, err: DatabaseError) -> satchel_core::StoreError {
        err.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_by_defaults_to_id() {
        assert_eq!(validate_order_by(None).unwrap(), "id");
        assert_eq!(validate_order_by(Some("name")).unwrap(), "name");
        assert_eq!(validate_order_by(Some("created_at")).unwrap(), "created_at");
    }

    #[test]
    fn order_by_rejects_unknown_columns() {
        let err = validate_order_by(Some("value; DROP TABLE items")).unwrap_err();
        assert_eq!(err.code(), Some(DatabaseErrorCode::QueryError));
    }

    #[test]
    fn schema_config_round_trips() {
        assert_eq!(SchemaConfig::from_str("generic").unwrap(), SchemaConfig::Generic);
        assert_eq!(
            SchemaConfig::from_str("normalize").unwrap(),
            SchemaConfig::Normalize
        );
        assert!(SchemaConfig::from_str("other").is_err());
    }
}
