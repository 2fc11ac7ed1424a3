//! Embedded backend configuration and lifecycle.
//!
//! Parses `sqlite://` URIs, derives pool settings, and runs the
//! provision / open / remove / migrate lifecycle. Query parameters on the
//! URI are ignored for this backend; pool settings arrive through the
//! config struct.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use rusqlite::{Connection, OptionalExtension, params};
use tracing::{debug, info, warn};

use crate::error::{DatabaseError, DatabaseErrorCode, DbResult};
use crate::migrations;
use crate::registry::{self, RELEASE_0};
use crate::sqlite::pool::{ConnectionPool, SqlitePoolConfig, open_connection};
use crate::traits::{PoolOptions, SchemaConfig};

/// Core DDL shared by every release. Category objects come from the
/// registry on top of these.
pub const CORE_SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS config (
        name  TEXT PRIMARY KEY,
        value TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS profiles (
        id          INTEGER PRIMARY KEY,
        name        TEXT UNIQUE,
        reference   TEXT,
        profile_key TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS items (
        id         INTEGER PRIMARY KEY,
        profile_id INTEGER,
        kind       INTEGER,
        category   TEXT,
        name       TEXT,
        value      TEXT,
        expiry     DATETIME,
        created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
        FOREIGN KEY (profile_id) REFERENCES profiles (id)
            ON DELETE CASCADE ON UPDATE CASCADE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS items_tags (
        id      INTEGER PRIMARY KEY,
        item_id INTEGER,
        name    TEXT,
        value   TEXT,
        FOREIGN KEY (item_id) REFERENCES items (id)
            ON DELETE CASCADE ON UPDATE CASCADE
    )
    "#,
    "CREATE UNIQUE INDEX IF NOT EXISTS ix_profile_name ON profiles (name)",
    "CREATE UNIQUE INDEX IF NOT EXISTS ix_items_profile_category_name \
     ON items (profile_id, category, name)",
    "CREATE INDEX IF NOT EXISTS ix_items_expiry ON items (expiry)",
    "CREATE INDEX IF NOT EXISTS ix_items_tags_item_id ON items_tags (item_id)",
];

/// Creates the core tables and indexes on a connection.
pub(crate) fn create_core_schema(conn: &Connection) -> DbResult<()> {
    for stmt in CORE_SCHEMA {
        conn.execute_batch(stmt)?;
    }
    Ok(())
}

/// Reads one config row, treating a NULL value as absent.
pub(crate) fn get_config_value(conn: &Connection, name: &str) -> DbResult<Option<String>> {
    let row: Option<Option<String>> = conn
        .query_row("SELECT value FROM config WHERE name = ?", [name], |row| {
            row.get(0)
        })
        .optional()?;
    Ok(row.flatten())
}

/// Upserts one config row.
pub(crate) fn set_config_value(conn: &Connection, name: &str, value: &str) -> DbResult<()> {
    conn.execute(
        "INSERT OR REPLACE INTO config (name, value) VALUES (?, ?)",
        params![name, value],
    )?;
    Ok(())
}

static MEMORY_DB_IDS: AtomicUsize = AtomicUsize::new(0);

/// Configuration for the embedded backend.
#[derive(Debug, Clone)]
pub struct SqliteConfig {
    /// Resolved database path (a shared-memory URI for `:memory:`).
    pub path: String,
    /// Whether the store lives in memory.
    pub in_memory: bool,
    /// Connections kept warm.
    pub min_size: usize,
    /// Connection cap.
    pub max_size: usize,
    /// Acquire timeout.
    pub acquire_timeout: Duration,
    /// Idle retirement age.
    pub max_idle: Duration,
    /// Connection retirement age.
    pub max_lifetime: Duration,
    /// Engine busy timeout.
    pub busy_timeout: Duration,
    /// SQLCipher key, when encrypted.
    pub encryption_key: Option<String>,
    /// Storage mode for provisioning.
    pub schema_config: SchemaConfig,
    /// Active-session cap.
    pub max_sessions: usize,
    /// Age at which the monitor force-closes a session.
    pub session_timeout: Duration,
}

impl SqliteConfig {
    /// Parses a `sqlite://<path>` URI and applies pool options.
    ///
    /// `<path>` may be `:memory:`, which maps to a process-private shared
    /// in-memory database with a unique name so that all pool connections
    /// observe the same data.
    pub fn from_uri(
        uri: &str,
        pass_key: Option<String>,
        schema_config: SchemaConfig,
        pool: &PoolOptions,
    ) -> DbResult<Self> {
        let raw = uri.strip_prefix("sqlite://").ok_or_else(|| {
            DatabaseError::new(
                DatabaseErrorCode::ConnectionError,
                format!("invalid sqlite URI '{uri}'"),
            )
        })?;
        // Query parameters are not meaningful for this backend.
        let raw = match raw.split_once('?') {
            Some((path, query)) => {
                warn!(query, "ignoring query parameters on sqlite URI");
                path
            }
            None => raw,
        };
        let in_memory = raw == ":memory:";
        let path = if in_memory {
            let id = MEMORY_DB_IDS.fetch_add(1, Ordering::Relaxed);
            format!("file:satchel_memdb_{id}?mode=memory&cache=shared")
        } else {
            raw.to_string()
        };

        let encrypted = pass_key.is_some();
        let max_size = pool
            .max_connections
            .unwrap_or(if encrypted { 20 } else { 100 })
            .max(1);
        let max_sessions = pool
            .max_sessions
            .unwrap_or_else(|| (max_size * 3 / 4).max(1));
        Ok(Self {
            path,
            in_memory,
            min_size: pool.min_connections.unwrap_or(1).min(max_size),
            max_size,
            acquire_timeout: pool.acquire_timeout.unwrap_or(Duration::from_secs(30)),
            max_idle: pool.max_idle.unwrap_or(Duration::from_secs(300)),
            max_lifetime: pool.max_lifetime.unwrap_or(Duration::from_secs(3600)),
            busy_timeout: Duration::from_secs_f64(if encrypted { 15.0 } else { 10.0 }),
            encryption_key: pass_key,
            schema_config,
            max_sessions,
            session_timeout: pool.session_timeout.unwrap_or(Duration::from_secs(5)),
        })
    }

    /// Pool settings derived from this config.
    pub fn pool_config(&self) -> SqlitePoolConfig {
        SqlitePoolConfig {
            path: self.path.clone(),
            in_memory: self.in_memory,
            min_size: self.min_size,
            max_size: self.max_size,
            acquire_timeout: self.acquire_timeout,
            max_idle: self.max_idle,
            max_lifetime: self.max_lifetime,
            busy_timeout: self.busy_timeout,
            encryption_key: self.encryption_key.clone(),
        }
    }

    /// Effective release for provisioning: generic stores always land on
    /// `release_0`, whatever was requested.
    fn effective_release(&self, requested: &str) -> DbResult<String> {
        match self.schema_config {
            SchemaConfig::Generic => {
                if requested != RELEASE_0 {
                    warn!(
                        requested,
                        "schema_config=generic overrides requested release to release_0"
                    );
                }
                Ok(RELEASE_0.to_string())
            }
            SchemaConfig::Normalize => {
                registry::get_release(requested)?;
                Ok(requested.to_string())
            }
        }
    }

    /// Creates a fresh store: core tables, category objects for the
    /// effective release, baseline config rows, and the default profile.
    pub async fn provision(
        &self,
        profile: Option<&str>,
        recreate: bool,
        release_number: &str,
    ) -> DbResult<(ConnectionPool, String, String)> {
        if recreate && !self.in_memory {
            remove_database_files(&self.path)?;
        }
        let release = self.effective_release(release_number)?;
        let profile_name = profile.unwrap_or("default_profile").to_string();
        info!(path = %self.path, release = %release, "provisioning sqlite store");

        let pool = ConnectionPool::new(self.pool_config()).await?;
        let conn = pool.acquire().await?;
        let schema_config = self.schema_config;
        let release_for_task = release.clone();
        let profile_for_task = profile_name.clone();
        let (conn, result) = tokio::task::spawn_blocking(move || {
            let result = provision_schema(
                conn.connection(),
                &profile_for_task,
                &release_for_task,
                schema_config,
            );
            (conn, result)
        })
        .await
        .map_err(|err| {
            DatabaseError::with_cause(
                DatabaseErrorCode::ProvisionError,
                "provision worker task failed",
                err,
            )
        })?;
        pool.release(conn).await;
        result?;
        Ok((pool, profile_name, release))
    }

    /// Opens an existing store and validates its configuration.
    pub async fn open(
        &self,
        profile: Option<&str>,
        target_release: Option<&str>,
    ) -> DbResult<(ConnectionPool, String, String)> {
        if !self.in_memory && !Path::new(&self.path).exists() {
            return Err(DatabaseError::new(
                DatabaseErrorCode::DatabaseNotFound,
                format!("database file does not exist at {}", self.path),
            ));
        }
        let pool = ConnectionPool::new(self.pool_config()).await?;
        let conn = pool.acquire().await?;
        let profile_req = profile.map(str::to_string);
        let target = target_release.map(str::to_string);
        let (conn, result) = tokio::task::spawn_blocking(move || {
            let result = validate_open(conn.connection(), profile_req.as_deref(), target.as_deref());
            (conn, result)
        })
        .await
        .map_err(|err| {
            DatabaseError::with_cause(
                DatabaseErrorCode::ConnectionError,
                "open worker task failed",
                err,
            )
        })?;
        pool.release(conn).await;
        let (profile_name, release) = result?;
        debug!(path = %self.path, release = %release, profile = %profile_name, "opened sqlite store");
        Ok((pool, profile_name, release))
    }

    /// Removes the store files. Returns `false` when nothing existed.
    pub async fn remove(&self) -> DbResult<bool> {
        if self.in_memory {
            return Ok(true);
        }
        if !Path::new(&self.path).exists() {
            return Ok(false);
        }
        remove_database_files(&self.path)?;
        Ok(true)
    }

    /// Applies forward migrations up to `target_release` and persists the
    /// new release number.
    pub async fn migrate(&self, target_release: &str) -> DbResult<()> {
        if !self.in_memory && !Path::new(&self.path).exists() {
            return Err(DatabaseError::new(
                DatabaseErrorCode::DatabaseNotFound,
                format!("database file does not exist at {}", self.path),
            ));
        }
        let pool_config = self.pool_config();
        let target = target_release.to_string();
        tokio::task::spawn_blocking(move || -> DbResult<()> {
            let conn = open_connection(&pool_config, pool_config.encryption_key.as_deref())?;
            let current = get_config_value(&conn, "schema_release_number")?.ok_or_else(|| {
                DatabaseError::new(
                    DatabaseErrorCode::UnsupportedVersion,
                    "release number not found in config table",
                )
            })?;
            migrations::apply_sqlite_migrations(&conn, &current, &target)?;
            set_config_value(&conn, "schema_release_number", &target)?;
            if target != RELEASE_0 {
                set_config_value(&conn, "schema_config", SchemaConfig::Normalize.as_str())?;
            }
            Ok(())
        })
        .await
        .map_err(|err| {
            DatabaseError::with_cause(
                DatabaseErrorCode::ProvisionError,
                "migration worker task failed",
                err,
            )
        })?
    }
}

fn remove_database_files(path: &str) -> DbResult<()> {
    for suffix in ["", "-wal", "-shm"] {
        let target = format!("{path}{suffix}");
        match std::fs::remove_file(&target) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(DatabaseError::with_cause(
                    DatabaseErrorCode::ConnectionError,
                    format!("failed to remove database file {target}"),
                    err,
                ));
            }
        }
    }
    Ok(())
}

fn provision_schema(
    conn: &Connection,
    profile: &str,
    release: &str,
    schema_config: SchemaConfig,
) -> DbResult<()> {
    let txn = conn.unchecked_transaction()?;
    create_core_schema(&txn)?;
    for spec in registry::get_release(release)? {
        for sql in spec.sqlite_ddl() {
            txn.execute_batch(&sql).map_err(|err| {
                DatabaseError::with_cause(
                    DatabaseErrorCode::ProvisionError,
                    format!("failed to apply schema for category '{}'", spec.category),
                    err,
                )
            })?;
        }
    }
    txn.execute(
        "INSERT OR IGNORE INTO config (name, value) VALUES ('default_profile', ?)",
        params![profile],
    )?;
    txn.execute("INSERT OR IGNORE INTO config (name, value) VALUES ('key', NULL)", [])?;
    txn.execute(
        "INSERT OR IGNORE INTO config (name, value) VALUES ('schema_release_number', ?)",
        params![release],
    )?;
    txn.execute(
        "INSERT OR IGNORE INTO config (name, value) VALUES ('schema_release_type', 'sqlite')",
        [],
    )?;
    txn.execute(
        "INSERT OR IGNORE INTO config (name, value) VALUES ('schema_config', ?)",
        params![schema_config.as_str()],
    )?;
    txn.execute(
        "INSERT OR IGNORE INTO profiles (name, profile_key) VALUES (?, NULL)",
        params![profile],
    )?;
    txn.commit()?;
    Ok(())
}

fn validate_open(
    conn: &Connection,
    profile: Option<&str>,
    target_release: Option<&str>,
) -> DbResult<(String, String)> {
    let release = get_config_value(conn, "schema_release_number")?.ok_or_else(|| {
        DatabaseError::new(
            DatabaseErrorCode::UnsupportedVersion,
            "release number not found in config table",
        )
    })?;
    let default_profile = get_config_value(conn, "default_profile")?.ok_or_else(|| {
        DatabaseError::new(
            DatabaseErrorCode::DefaultProfileNotFound,
            "default profile not found in the database",
        )
    })?;
    let schema_config = get_config_value(conn, "schema_config")?
        .map(|v| SchemaConfig::from_str(&v))
        .transpose()?
        .unwrap_or(SchemaConfig::Generic);

    if schema_config == SchemaConfig::Generic && release != RELEASE_0 {
        return Err(DatabaseError::new(
            DatabaseErrorCode::QueryError,
            format!(
                "invalid configuration: schema_config='generic' requires \
                 schema_release_number='release_0', found '{release}'"
            ),
        ));
    }
    if schema_config == SchemaConfig::Normalize {
        if let Some(target) = target_release {
            if target != release {
                return Err(DatabaseError::new(
                    DatabaseErrorCode::UnsupportedVersion,
                    format!(
                        "schema release number mismatch: database has '{release}', \
                         but target is '{target}'; perform an upgrade first"
                    ),
                ));
            }
        }
    }

    let profile_name = profile.unwrap_or(&default_profile).to_string();
    let found: Option<i64> = conn
        .query_row(
            "SELECT id FROM profiles WHERE name = ?",
            params![profile_name],
            |row| row.get(0),
        )
        .optional()?;
    if found.is_none() {
        return Err(DatabaseError::new(
            DatabaseErrorCode::ProfileNotFound,
            format!("profile '{profile_name}' not found"),
        ));
    }
    Ok((profile_name, release))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uri_must_carry_the_scheme() {
        let err = SqliteConfig::from_uri("/tmp/db.sqlite", None, SchemaConfig::Generic, &PoolOptions::default())
            .unwrap_err();
        assert_eq!(err.code(), Some(DatabaseErrorCode::ConnectionError));
    }

    #[test]
    fn memory_uris_get_unique_shared_names() {
        let a = SqliteConfig::from_uri("sqlite://:memory:", None, SchemaConfig::Generic, &PoolOptions::default())
            .unwrap();
        let b = SqliteConfig::from_uri("sqlite://:memory:", None, SchemaConfig::Generic, &PoolOptions::default())
            .unwrap();
        assert!(a.in_memory && b.in_memory);
        assert!(a.path.contains("mode=memory"));
        assert_ne!(a.path, b.path);
    }

    #[test]
    fn encrypted_stores_get_smaller_pools() {
        let plain = SqliteConfig::from_uri("sqlite:///tmp/a.db", None, SchemaConfig::Generic, &PoolOptions::default())
            .unwrap();
        let encrypted = SqliteConfig::from_uri(
            "sqlite:///tmp/a.db",
            Some("secret".into()),
            SchemaConfig::Generic,
            &PoolOptions::default(),
        )
        .unwrap();
        assert!(encrypted.max_size < plain.max_size);
        assert!(encrypted.busy_timeout > plain.busy_timeout);
    }

    #[test]
    fn pool_options_override_defaults() {
        let pool = PoolOptions {
            max_connections: Some(3),
            max_sessions: Some(2),
            ..Default::default()
        };
        let config =
            SqliteConfig::from_uri("sqlite:///tmp/a.db", None, SchemaConfig::Generic, &pool).unwrap();
        assert_eq!(config.max_size, 3);
        assert_eq!(config.max_sessions, 2);
    }

    #[test]
    fn generic_overrides_requested_release() {
        let config = SqliteConfig::from_uri(
            "sqlite://:memory:",
            None,
            SchemaConfig::Generic,
            &PoolOptions::default(),
        )
        .unwrap();
        assert_eq!(config.effective_release("release_0_1").unwrap(), "release_0");
        let normalized = SqliteConfig {
            schema_config: SchemaConfig::Normalize,
            ..config
        };
        assert_eq!(
            normalized.effective_release("release_0_1").unwrap(),
            "release_0_1"
        );
        assert!(normalized.effective_release("release_9").is_err());
    }
}
