//! The public store facade.
//!
//! Consumers provision or open a store by URI and work through
//! [`DbStore`] and [`DbSession`]; the backend never leaks through the
//! API. Every error crossing this boundary is translated from the
//! backend taxonomy to [`StoreError`], preserving the original message
//! as the attached cause. Tag filters arrive as WQL JSON text and are
//! parsed here, once.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use once_cell::sync::Lazy;
use tracing::debug;

use satchel_core::value::canonical_text;
use satchel_core::{Entry, EntryTag, StoreError};
use satchel_query::{TagQuery, query_from_str};

use crate::error::{DatabaseError, DatabaseErrorCode};
use crate::postgres::PostgresBackend;
use crate::sqlite::SqliteBackend;
use crate::traits::{
    Backend, BackendSession, BackendStore, OpenSpec, PoolOptions, ProvisionSpec, Scan,
    SchemaConfig,
};

/// Parameters for [`DbStore::provision`].
#[derive(Debug, Clone)]
pub struct ProvisionOptions {
    /// Name for the default profile; generated when `None`.
    pub profile: Option<String>,
    /// Encryption key (embedded backend only).
    pub pass_key: Option<String>,
    /// Drop any existing store at the location first.
    pub recreate: bool,
    /// Requested schema release.
    pub release_number: String,
    /// Storage mode; `Generic` forces the effective release to
    /// `release_0`.
    pub schema_config: SchemaConfig,
    /// Pool limits.
    pub pool: PoolOptions,
}

impl Default for ProvisionOptions {
    fn default() -> Self {
        Self {
            profile: None,
            pass_key: None,
            recreate: false,
            release_number: "release_0".to_string(),
            schema_config: SchemaConfig::Generic,
            pool: PoolOptions::default(),
        }
    }
}

/// Parameters for [`DbStore::open`].
#[derive(Debug, Clone, Default)]
pub struct OpenOptions {
    /// Profile to resolve; the stored default when `None`.
    pub profile: Option<String>,
    /// Encryption key (embedded backend only).
    pub pass_key: Option<String>,
    /// Expected schema release for normalized stores.
    pub target_release: Option<String>,
    /// Pool limits.
    pub pool: PoolOptions,
}

static BACKENDS: Lazy<RwLock<HashMap<String, Arc<dyn Backend>>>> = Lazy::new(|| {
    let mut backends: HashMap<String, Arc<dyn Backend>> = HashMap::new();
    backends.insert("sqlite".to_string(), Arc::new(SqliteBackend));
    let postgres: Arc<dyn Backend> = Arc::new(PostgresBackend);
    // Both spellings are accepted as aliases of the server backend.
    backends.insert("postgres".to_string(), postgres.clone());
    backends.insert("postgresql".to_string(), postgres);
    RwLock::new(backends)
});

/// Registers (or replaces) the backend serving a URI scheme.
pub fn register_backend(scheme: impl Into<String>, backend: Arc<dyn Backend>) {
    BACKENDS
        .write()
        .expect("backend registry lock")
        .insert(scheme.into(), backend);
}

fn backend_for(uri: &str) -> Result<Arc<dyn Backend>, StoreError> {
    let scheme = uri
        .split_once("://")
        .map(|(scheme, _)| scheme)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| StoreError::input(format!("invalid store URI '{uri}'")))?;
    BACKENDS
        .read()
        .expect("backend registry lock")
        .get(scheme)
        .cloned()
        .ok_or_else(|| StoreError::input(format!("no backend registered for scheme '{scheme}'")))
}

fn parse_filter(tag_filter: Option<&str>) -> Result<Option<TagQuery>, StoreError> {
    tag_filter
        .map(|raw| {
            query_from_str(raw)
                .map_err(|err| StoreError::input("invalid tag filter").with_cause(err.to_string()))
        })
        .transpose()
}

fn canonical_value(value: &[u8]) -> Result<&str, StoreError> {
    canonical_text(value).map_err(|err| {
        DatabaseError::with_cause(
            DatabaseErrorCode::QueryError,
            "value is not valid UTF-8",
            err,
        )
        .into()
    })
}

/// A live store handle, backend-agnostic.
#[derive(Clone)]
pub struct DbStore {
    inner: Arc<dyn BackendStore>,
    uri: String,
}

impl DbStore {
    /// Provisions a fresh store at the URI location.
    pub async fn provision(uri: &str, options: ProvisionOptions) -> Result<Self, StoreError> {
        let backend = backend_for(uri)?;
        let spec = ProvisionSpec {
            profile: options.profile,
            pass_key: options.pass_key,
            recreate: options.recreate,
            release_number: options.release_number,
            schema_config: options.schema_config,
            pool: options.pool,
        };
        let inner = backend.provision(uri, &spec).await?;
        Ok(Self {
            inner,
            uri: uri.to_string(),
        })
    }

    /// Opens an existing store.
    pub async fn open(uri: &str, options: OpenOptions) -> Result<Self, StoreError> {
        let backend = backend_for(uri)?;
        let spec = OpenSpec {
            profile: options.profile,
            pass_key: options.pass_key,
            target_release: options.target_release,
            pool: options.pool,
        };
        let inner = backend.open(uri, &spec).await?;
        Ok(Self {
            inner,
            uri: uri.to_string(),
        })
    }

    /// Removes the store at the URI location without opening it. Returns
    /// whether anything was removed.
    pub async fn remove(uri: &str) -> Result<bool, StoreError> {
        let backend = backend_for(uri)?;
        Ok(backend.remove(uri).await?)
    }

    /// Applies forward migrations up to `target_release`.
    pub async fn migrate(uri: &str, target_release: &str) -> Result<(), StoreError> {
        let backend = backend_for(uri)?;
        Ok(backend.migrate(uri, target_release).await?)
    }

    /// The URI this store was opened from.
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Schema release the store is at.
    pub fn release_number(&self) -> &str {
        self.inner.release_number()
    }

    /// Name of the default profile.
    pub fn get_profile_name(&self) -> &str {
        self.inner.profile_name()
    }

    /// Creates a profile; a name is generated when `None`.
    pub async fn create_profile(&self, name: Option<String>) -> Result<String, StoreError> {
        Ok(self.inner.create_profile(name).await?)
    }

    /// Removes a profile and (by cascade) its items.
    pub async fn remove_profile(&self, name: &str) -> Result<bool, StoreError> {
        Ok(self.inner.remove_profile(name).await?)
    }

    /// Rotates the store encryption key. Embedded backend only; no other
    /// session may be active.
    pub async fn rekey(&self, pass_key: &str) -> Result<(), StoreError> {
        Ok(self.inner.rekey(pass_key).await?)
    }

    /// Opens a session bound to one pooled connection.
    pub async fn session(&self, profile: Option<&str>) -> Result<DbSession, StoreError> {
        let inner = self.inner.session(profile, false).await?;
        Ok(DbSession { inner })
    }

    /// Opens a transaction; effects become visible on
    /// [`DbSession::commit`].
    pub async fn transaction(&self, profile: Option<&str>) -> Result<DbSession, StoreError> {
        let inner = self.inner.session(profile, true).await?;
        Ok(DbSession { inner })
    }

    /// Store-scope offset scan, yielding entries lazily.
    #[allow(clippy::too_many_arguments)]
    pub async fn scan(
        &self,
        profile: Option<&str>,
        category: &str,
        tag_filter: Option<&str>,
        offset: Option<i64>,
        limit: Option<i64>,
        order_by: Option<&str>,
        descending: bool,
    ) -> Result<Scan, StoreError> {
        let filter = parse_filter(tag_filter)?;
        Ok(self
            .inner
            .scan(
                profile,
                category,
                filter,
                offset,
                limit,
                order_by.map(str::to_string),
                descending,
            )
            .await?)
    }

    /// Store-scope keyset scan, resuming after `last_id`.
    pub async fn scan_keyset(
        &self,
        profile: Option<&str>,
        category: &str,
        tag_filter: Option<&str>,
        last_id: Option<i64>,
        limit: Option<i64>,
    ) -> Result<Scan, StoreError> {
        let filter = parse_filter(tag_filter)?;
        Ok(self
            .inner
            .scan_keyset(profile, category, filter, last_id, limit)
            .await?)
    }

    /// Closes the store, stopping the background monitor and the pool;
    /// `remove` additionally deletes the store afterwards.
    pub async fn close(&self, remove: bool) -> Result<(), StoreError> {
        debug!(uri = %self.uri, remove, "closing store");
        Ok(self.inner.close(remove).await?)
    }
}

impl std::fmt::Debug for DbStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbStore")
            .field("uri", &self.uri)
            .field("release", &self.inner.release_number())
            .finish_non_exhaustive()
    }
}

/// A session or transaction bound to one pooled connection and one
/// profile.
///
/// Dropping a session without closing it releases its connection in the
/// background, rolling back any uncommitted work.
pub struct DbSession {
    inner: Box<dyn BackendSession>,
}

impl DbSession {
    /// Whether this handle is a transaction.
    pub fn is_transaction(&self) -> bool {
        self.inner.is_transaction()
    }

    /// Counts items in a category matching the filter.
    pub async fn count(
        &mut self,
        category: &str,
        tag_filter: Option<&str>,
    ) -> Result<u64, StoreError> {
        let filter = parse_filter(tag_filter)?;
        Ok(self.inner.count(category, filter).await?)
    }

    /// Inserts a new item. The value may be text or bytes; it is
    /// canonicalized to UTF-8 text.
    pub async fn insert(
        &mut self,
        category: &str,
        name: &str,
        value: impl AsRef<[u8]>,
        tags: &[EntryTag],
        expiry_ms: Option<i64>,
    ) -> Result<(), StoreError> {
        let value = canonical_value(value.as_ref())?.to_string();
        Ok(self
            .inner
            .insert(category, name, &value, tags, expiry_ms)
            .await?)
    }

    /// Replaces an existing item's value and tags in full.
    pub async fn replace(
        &mut self,
        category: &str,
        name: &str,
        value: impl AsRef<[u8]>,
        tags: &[EntryTag],
        expiry_ms: Option<i64>,
    ) -> Result<(), StoreError> {
        let value = canonical_value(value.as_ref())?.to_string();
        Ok(self
            .inner
            .replace(category, name, &value, tags, expiry_ms)
            .await?)
    }

    /// Fetches one item by name, optionally constrained by a tag filter.
    pub async fn fetch(
        &mut self,
        category: &str,
        name: &str,
        tag_filter: Option<&str>,
        for_update: bool,
    ) -> Result<Option<Entry>, StoreError> {
        let filter = parse_filter(tag_filter)?;
        Ok(self.inner.fetch(category, name, filter, for_update).await?)
    }

    /// Fetches all matching items.
    #[allow(clippy::too_many_arguments)]
    pub async fn fetch_all(
        &mut self,
        category: &str,
        tag_filter: Option<&str>,
        limit: Option<i64>,
        for_update: bool,
        order_by: Option<&str>,
        descending: bool,
    ) -> Result<Vec<Entry>, StoreError> {
        let filter = parse_filter(tag_filter)?;
        Ok(self
            .inner
            .fetch_all(
                category,
                filter,
                limit,
                for_update,
                order_by.map(str::to_string),
                descending,
            )
            .await?)
    }

    /// Removes one item.
    pub async fn remove(&mut self, category: &str, name: &str) -> Result<(), StoreError> {
        Ok(self.inner.remove(category, name).await?)
    }

    /// Removes all matching items, returning the count removed.
    pub async fn remove_all(
        &mut self,
        category: &str,
        tag_filter: Option<&str>,
    ) -> Result<u64, StoreError> {
        let filter = parse_filter(tag_filter)?;
        Ok(self.inner.remove_all(category, filter).await?)
    }

    /// Commits a transaction and closes the handle.
    pub async fn commit(mut self) -> Result<(), StoreError> {
        if !self.inner.is_transaction() {
            return Err(StoreError::wrapper("not a transaction"));
        }
        Ok(self.inner.commit().await?)
    }

    /// Rolls back a transaction and closes the handle.
    pub async fn rollback(mut self) -> Result<(), StoreError> {
        if !self.inner.is_transaction() {
            return Err(StoreError::wrapper("not a transaction"));
        }
        Ok(self.inner.rollback().await?)
    }

    /// Closes the handle: transactions roll back unless committed,
    /// session-mode work is already committed per call.
    pub async fn close(mut self) -> Result<(), StoreError> {
        Ok(self.inner.close().await?)
    }
}

impl std::fmt::Debug for DbSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbSession")
            .field("transaction", &self.inner.is_transaction())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use satchel_core::StoreErrorKind;

    #[test]
    fn scheme_dispatch_covers_aliases() {
        assert!(backend_for("sqlite:///tmp/x.db").is_ok());
        assert!(backend_for("postgres://u:p@h/db").is_ok());
        assert!(backend_for("postgresql://u:p@h/db").is_ok());
    }

    #[test]
    fn unknown_scheme_is_input_error() {
        let err = backend_for("mysql://u:p@h/db").unwrap_err();
        assert_eq!(err.kind, StoreErrorKind::Input);
        let err = backend_for("no-scheme-here").unwrap_err();
        assert_eq!(err.kind, StoreErrorKind::Input);
    }

    #[test]
    fn malformed_filters_are_input_errors() {
        let err = parse_filter(Some("{oops")).unwrap_err();
        assert_eq!(err.kind, StoreErrorKind::Input);
        assert!(parse_filter(None).unwrap().is_none());
    }

    #[test]
    fn non_utf8_values_are_rejected() {
        let err = canonical_value(&[0xff, 0xfe]).unwrap_err();
        assert_eq!(err.kind, StoreErrorKind::Unexpected);
        assert_eq!(canonical_value(b"ok").unwrap(), "ok");
    }
}
