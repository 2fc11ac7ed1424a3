//! Server backend configuration and lifecycle.
//!
//! Parses `postgres://` URIs (pool and admin settings may arrive as query
//! parameters), derives the tenant schema context from the connection
//! identity, and runs the provision / open / remove / migrate lifecycle.
//! Administrative steps (create or drop the target database) run over a
//! separate connection to the `postgres` maintenance database, optionally
//! under dedicated admin credentials.

use std::collections::HashMap;
use std::time::Duration;

use tokio_postgres::error::SqlState;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{DatabaseError, DatabaseErrorCode, DbResult};
use crate::migrations;
use crate::postgres::pool::{PgPoolConfig, PostgresConnectionPool, connect};
use crate::postgres::schema::{SchemaContext, is_safe_identifier};
use crate::registry::{self, RELEASE_0};
use crate::traits::{PoolOptions, SchemaConfig};

/// URI query keys this backend understands; anything else is warned about
/// and ignored.
const RECOGNIZED_KEYS: &[&str] = &[
    "connect_timeout",
    "sslmode",
    "sslcert",
    "sslkey",
    "sslrootcert",
    "admin_account",
    "admin_password",
    "min_connections",
    "max_connections",
    "max_idle",
    "max_lifetime",
    "max_sessions",
];

/// Configuration for the server backend.
#[derive(Debug, Clone)]
pub struct PostgresConfig {
    /// Connection string for the target database.
    conn_str: String,
    /// Connection string for administrative operations.
    admin_conn_str: String,
    /// Target database name.
    db_name: String,
    /// Tenant schema qualifier.
    pub schema_context: SchemaContext,
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
    /// Active-session cap.
    pub max_sessions: usize,
    /// Age at which the monitor force-closes a session.
    pub session_timeout: Duration,
    /// Storage mode for provisioning.
    pub schema_config: SchemaConfig,
}

impl PostgresConfig {
    /// Parses a `postgres://` / `postgresql://` URI and applies pool
    /// options. Explicit [`PoolOptions`] values win over URI parameters.
    pub fn from_uri(
        uri: &str,
        schema_config: SchemaConfig,
        pool: &PoolOptions,
    ) -> DbResult<Self> {
        let url = Url::parse(uri).map_err(|err| {
            DatabaseError::with_cause(
                DatabaseErrorCode::ConnectionError,
                format!("invalid postgres URI '{uri}'"),
                err,
            )
        })?;
        if url.scheme() != "postgres" && url.scheme() != "postgresql" {
            return Err(DatabaseError::new(
                DatabaseErrorCode::ConnectionError,
                format!("unsupported URI scheme '{}'", url.scheme()),
            ));
        }
        let db_name = url.path().trim_start_matches('/').to_string();
        if db_name.is_empty() {
            return Err(DatabaseError::new(
                DatabaseErrorCode::ConnectionError,
                "postgres URI is missing a database name",
            ));
        }
        if !is_safe_identifier(&db_name.to_ascii_lowercase()) {
            return Err(DatabaseError::new(
                DatabaseErrorCode::ConnectionError,
                format!("database name '{db_name}' is not a valid identifier"),
            ));
        }

        let mut params: HashMap<String, String> = HashMap::new();
        for (key, value) in url.query_pairs() {
            if !RECOGNIZED_KEYS.contains(&key.as_ref()) {
                warn!(key = %key, "ignoring unrecognized query parameter on postgres URI");
                continue;
            }
            params.insert(key.into_owned(), value.into_owned());
        }

        if let Some(sslmode) = params.get("sslmode") {
            match sslmode.as_str() {
                "disable" | "allow" | "prefer" => {}
                other => {
                    return Err(DatabaseError::new(
                        DatabaseErrorCode::ConnectionError,
                        format!("sslmode '{other}' requires TLS support, which this \
                                 connector does not provide"),
                    ));
                }
            }
        }

        let min_size = match pool.min_connections {
            Some(v) => v,
            None => parse_param(&params, "min_connections")?.unwrap_or(4),
        };
        let max_size = match pool.max_connections {
            Some(v) => v,
            None => parse_param(&params, "max_connections")?.unwrap_or(10),
        }
        .max(1);
        let acquire_timeout = match pool.acquire_timeout {
            Some(v) => v,
            None => Duration::from_secs_f64(
                parse_param_f64(&params, "connect_timeout")?.unwrap_or(30.0),
            ),
        };
        let max_idle = match pool.max_idle {
            Some(v) => v,
            None => Duration::from_secs_f64(parse_param_f64(&params, "max_idle")?.unwrap_or(5.0)),
        };
        let max_lifetime = match pool.max_lifetime {
            Some(v) => v,
            None => Duration::from_secs_f64(
                parse_param_f64(&params, "max_lifetime")?.unwrap_or(3600.0),
            ),
        };
        let max_sessions = match pool.max_sessions {
            Some(v) => v,
            None => parse_param(&params, "max_sessions")?
                .unwrap_or_else(|| (max_size * 3 / 4).max(1)),
        };

        let username = url.username();
        let schema_context =
            SchemaContext::new((!username.is_empty()).then_some(username))?;

        // Rebuild the URI keeping only keys the client itself honors.
        let mut conn_url = url.clone();
        conn_url.set_query(None);
        {
            let mut qp = conn_url.query_pairs_mut();
            for key in ["connect_timeout", "sslmode"] {
                if let Some(value) = params.get(key) {
                    qp.append_pair(key, value);
                }
            }
        }
        if conn_url.query() == Some("") {
            conn_url.set_query(None);
        }

        // Administrative operations run against the maintenance database,
        // under dedicated credentials when provided.
        let mut admin_url = conn_url.clone();
        admin_url.set_path("/postgres");
        if let Some(account) = params.get("admin_account") {
            admin_url.set_username(account).map_err(|_| {
                DatabaseError::new(
                    DatabaseErrorCode::ConnectionError,
                    "invalid admin_account in postgres URI",
                )
            })?;
            admin_url
                .set_password(params.get("admin_password").map(String::as_str))
                .map_err(|_| {
                    DatabaseError::new(
                        DatabaseErrorCode::ConnectionError,
                        "invalid admin_password in postgres URI",
                    )
                })?;
        }

        Ok(Self {
            conn_str: conn_url.to_string(),
            admin_conn_str: admin_url.to_string(),
            db_name,
            schema_context,
            min_size: min_size.min(max_size),
            max_size,
            acquire_timeout,
            max_idle,
            max_lifetime,
            max_sessions,
            session_timeout: pool.session_timeout.unwrap_or(Duration::from_secs(5)),
            schema_config,
        })
    }

    /// Pool settings derived from this config.
    pub fn pool_config(&self) -> PgPoolConfig {
        PgPoolConfig {
            conn_str: self.conn_str.clone(),
            min_size: self.min_size,
            max_size: self.max_size,
            acquire_timeout: self.acquire_timeout,
            max_idle: self.max_idle,
            max_lifetime: self.max_lifetime,
        }
    }

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

    /// Ensures the target database exists, creating it over the admin
    /// connection when missing.
    async fn ensure_database(&self) -> DbResult<()> {
        let admin = connect(&self.admin_conn_str).await?;
        let exists = admin
            .client
            .query_opt(
                "SELECT 1 FROM pg_database WHERE datname = $1",
                &[&self.db_name],
            )
            .await?
            .is_some();
        if exists {
            return Ok(());
        }
        debug!(db = %self.db_name, "creating database");
        match admin
            .client
            .batch_execute(&format!("CREATE DATABASE \"{}\"", self.db_name))
            .await
        {
            Ok(()) => Ok(()),
            Err(err) if err.code() == Some(&SqlState::DUPLICATE_DATABASE) => Ok(()),
            Err(err) if err.code() == Some(&SqlState::INSUFFICIENT_PRIVILEGE) => {
                Err(DatabaseError::with_cause(
                    DatabaseErrorCode::PermissionError,
                    format!("not permitted to create database '{}'", self.db_name),
                    err,
                ))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Creates a fresh store: database, tenant schema, core tables,
    /// category objects for the effective release, baseline config rows,
    /// and the default profile.
    pub async fn provision(
        &self,
        profile: Option<&str>,
        recreate: bool,
        release_number: &str,
    ) -> DbResult<(PostgresConnectionPool, String, String)> {
        let release = self.effective_release(release_number)?;
        let profile_name = profile.unwrap_or("default_profile").to_string();
        info!(db = %self.db_name, schema = %self.schema_context, release = %release,
              "provisioning postgres store");

        self.ensure_database().await?;
        let pool = PostgresConnectionPool::new(self.pool_config()).await?;
        let conn = pool.acquire().await?;
        let result = self
            .provision_schema(conn.client(), &profile_name, &release, recreate)
            .await;
        pool.release(conn).await;
        result?;
        Ok((pool, profile_name, release))
    }

    async fn provision_schema(
        &self,
        client: &tokio_postgres::Client,
        profile: &str,
        release: &str,
        recreate: bool,
    ) -> DbResult<()> {
        let schema = &self.schema_context;
        if recreate {
            // Core tables first, then each category's drop objects in
            // registry order for the target release.
            for table in ["config", "profiles", "items", "items_tags"] {
                client
                    .batch_execute(&format!(
                        "DROP TABLE IF EXISTS {} CASCADE",
                        schema.qualify(table)
                    ))
                    .await?;
            }
            for spec in registry::get_release(release)? {
                for object in spec.drop_objects() {
                    client
                        .batch_execute(&format!(
                            "DROP TABLE IF EXISTS {} CASCADE",
                            schema.qualify(object.name)
                        ))
                        .await?;
                }
            }
        }

        client
            .batch_execute(&format!("CREATE SCHEMA IF NOT EXISTS {schema}"))
            .await
            .map_err(|err| {
                if err.code() == Some(&SqlState::INSUFFICIENT_PRIVILEGE) {
                    DatabaseError::with_cause(
                        DatabaseErrorCode::PermissionError,
                        format!("not permitted to create schema '{schema}'"),
                        err,
                    )
                } else {
                    err.into()
                }
            })?;

        for stmt in core_schema(schema) {
            client.batch_execute(&stmt).await.map_err(|err| {
                DatabaseError::with_cause(
                    DatabaseErrorCode::ProvisionError,
                    "failed to create core tables",
                    err,
                )
            })?;
        }
        for spec in registry::get_release(release)? {
            for stmt in spec.postgres_ddl(schema.schema_name()) {
                client.batch_execute(&stmt).await.map_err(|err| {
                    DatabaseError::with_cause(
                        DatabaseErrorCode::ProvisionError,
                        format!("failed to apply schema for category '{}'", spec.category),
                        err,
                    )
                })?;
            }
        }

        let config_table = schema.qualify("config");
        let insert_config = format!(
            "INSERT INTO {config_table} (name, value) VALUES ($1, $2) \
             ON CONFLICT (name) DO NOTHING"
        );
        for (name, value) in [
            ("default_profile", Some(profile)),
            ("key", None),
            ("schema_release_number", Some(release)),
            ("schema_release_type", Some("postgres")),
            ("schema_config", Some(self.schema_config.as_str())),
        ] {
            client.execute(&insert_config, &[&name, &value]).await?;
        }
        client
            .execute(
                &format!(
                    "INSERT INTO {} (name, profile_key) VALUES ($1, NULL) \
                     ON CONFLICT (name) DO NOTHING",
                    schema.qualify("profiles")
                ),
                &[&profile],
            )
            .await?;
        Ok(())
    }

    /// Opens an existing store and validates its configuration.
    pub async fn open(
        &self,
        profile: Option<&str>,
        target_release: Option<&str>,
    ) -> DbResult<(PostgresConnectionPool, String, String)> {
        let pool = PostgresConnectionPool::new(self.pool_config())
            .await
            .map_err(|err| self.map_missing_database(err))?;
        let conn = pool.acquire().await?;
        let result = self
            .validate_open(conn.client(), profile, target_release)
            .await;
        pool.release(conn).await;
        let (profile_name, release) = result?;
        debug!(db = %self.db_name, release = %release, profile = %profile_name,
               "opened postgres store");
        Ok((pool, profile_name, release))
    }

    fn map_missing_database(&self, err: DatabaseError) -> DatabaseError {
        if let DatabaseError::Postgres(native) = &err {
            if native.code() == Some(&SqlState::INVALID_CATALOG_NAME) {
                return DatabaseError::with_cause(
                    DatabaseErrorCode::DatabaseNotFound,
                    format!("database '{}' does not exist", self.db_name),
                    native,
                );
            }
        }
        err
    }

    async fn validate_open(
        &self,
        client: &tokio_postgres::Client,
        profile: Option<&str>,
        target_release: Option<&str>,
    ) -> DbResult<(String, String)> {
        let schema = &self.schema_context;
        let release = self
            .get_config_value(client, "schema_release_number")
            .await?
            .ok_or_else(|| {
                DatabaseError::new(
                    DatabaseErrorCode::UnsupportedVersion,
                    "release number not found in config table",
                )
            })?;
        let default_profile = self
            .get_config_value(client, "default_profile")
            .await?
            .ok_or_else(|| {
                DatabaseError::new(
                    DatabaseErrorCode::DefaultProfileNotFound,
                    "default profile not found in the database",
                )
            })?;
        let schema_config = match self.get_config_value(client, "schema_config").await? {
            Some(value) => SchemaConfig::from_str(&value)?,
            None => SchemaConfig::Generic,
        };

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
        let found = client
            .query_opt(
                &format!(
                    "SELECT id FROM {} WHERE name = $1",
                    schema.qualify("profiles")
                ),
                &[&profile_name],
            )
            .await?;
        if found.is_none() {
            return Err(DatabaseError::new(
                DatabaseErrorCode::ProfileNotFound,
                format!("profile '{profile_name}' not found"),
            ));
        }
        Ok((profile_name, release))
    }

    /// Reads one config row, treating a NULL value as absent.
    pub(crate) async fn get_config_value(
        &self,
        client: &tokio_postgres::Client,
        name: &str,
    ) -> DbResult<Option<String>> {
        let row = client
            .query_opt(
                &format!(
                    "SELECT value FROM {} WHERE name = $1",
                    self.schema_context.qualify("config")
                ),
                &[&name],
            )
            .await?;
        Ok(row.and_then(|r| r.get::<_, Option<String>>(0)))
    }

    /// Terminates other sessions on the target database, then drops it.
    /// Returns `false` when the database did not exist.
    pub async fn remove(&self) -> DbResult<bool> {
        let admin = connect(&self.admin_conn_str).await?;
        let exists = admin
            .client
            .query_opt(
                "SELECT 1 FROM pg_database WHERE datname = $1",
                &[&self.db_name],
            )
            .await?
            .is_some();
        if !exists {
            return Ok(false);
        }
        admin
            .client
            .execute(
                "SELECT pg_terminate_backend(pid) FROM pg_stat_activity \
                 WHERE datname = $1 AND pid <> pg_backend_pid()",
                &[&self.db_name],
            )
            .await?;
        match admin
            .client
            .batch_execute(&format!("DROP DATABASE IF EXISTS \"{}\"", self.db_name))
            .await
        {
            Ok(()) => Ok(true),
            Err(err) if err.code() == Some(&SqlState::INSUFFICIENT_PRIVILEGE) => {
                Err(DatabaseError::with_cause(
                    DatabaseErrorCode::PermissionError,
                    format!("not permitted to drop database '{}'", self.db_name),
                    err,
                ))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Applies forward migrations up to `target_release` and persists the
    /// new release number.
    pub async fn migrate(&self, target_release: &str) -> DbResult<()> {
        let conn = connect(&self.conn_str)
            .await
            .map_err(|err| self.map_missing_database(err))?;
        let client = &conn.client;
        let current = self
            .get_config_value(client, "schema_release_number")
            .await?
            .ok_or_else(|| {
                DatabaseError::new(
                    DatabaseErrorCode::UnsupportedVersion,
                    "release number not found in config table",
                )
            })?;
        migrations::apply_postgres_migrations(client, &self.schema_context, &current, target_release)
            .await?;
        let config_table = self.schema_context.qualify("config");
        client
            .execute(
                &format!(
                    "INSERT INTO {config_table} (name, value) VALUES ('schema_release_number', $1) \
                     ON CONFLICT (name) DO UPDATE SET value = EXCLUDED.value"
                ),
                &[&target_release],
            )
            .await?;
        if target_release != RELEASE_0 {
            client
                .execute(
                    &format!(
                        "INSERT INTO {config_table} (name, value) VALUES ('schema_config', $1) \
                         ON CONFLICT (name) DO UPDATE SET value = EXCLUDED.value"
                    ),
                    &[&SchemaConfig::Normalize.as_str()],
                )
                .await?;
        }
        Ok(())
    }
}

/// Core DDL, qualified with the tenant schema.
fn core_schema(schema: &SchemaContext) -> Vec<String> {
    let config = schema.qualify("config");
    let profiles = schema.qualify("profiles");
    let items = schema.qualify("items");
    let items_tags = schema.qualify("items_tags");
    vec![
        format!(
            "CREATE TABLE IF NOT EXISTS {config} (\n\
             \x20   name  TEXT PRIMARY KEY,\n\
             \x20   value TEXT\n)"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {profiles} (\n\
             \x20   id          BIGSERIAL PRIMARY KEY,\n\
             \x20   name        TEXT UNIQUE,\n\
             \x20   reference   TEXT,\n\
             \x20   profile_key TEXT\n)"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {items} (\n\
             \x20   id         BIGSERIAL PRIMARY KEY,\n\
             \x20   profile_id BIGINT,\n\
             \x20   kind       INTEGER,\n\
             \x20   category   TEXT,\n\
             \x20   name       TEXT,\n\
             \x20   value      TEXT,\n\
             \x20   expiry     TIMESTAMPTZ,\n\
             \x20   created_at TIMESTAMPTZ DEFAULT CURRENT_TIMESTAMP,\n\
             \x20   FOREIGN KEY (profile_id) REFERENCES {profiles} (id) \
             ON DELETE CASCADE ON UPDATE CASCADE\n)"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {items_tags} (\n\
             \x20   id      BIGSERIAL PRIMARY KEY,\n\
             \x20   item_id BIGINT,\n\
             \x20   name    TEXT,\n\
             \x20   value   TEXT,\n\
             \x20   FOREIGN KEY (item_id) REFERENCES {items} (id) \
             ON DELETE CASCADE ON UPDATE CASCADE\n)"
        ),
        format!(
            "CREATE UNIQUE INDEX IF NOT EXISTS ix_items_profile_category_name \
             ON {items} (profile_id, category, name)"
        ),
        format!("CREATE INDEX IF NOT EXISTS ix_items_expiry ON {items} (expiry)"),
        format!("CREATE INDEX IF NOT EXISTS ix_items_tags_item_id ON {items_tags} (item_id)"),
        format!(
            "CREATE INDEX IF NOT EXISTS ix_items_tags_name_value ON {items_tags} (name, value)"
        ),
    ]
}

fn parse_param(params: &HashMap<String, String>, key: &str) -> DbResult<Option<usize>> {
    params
        .get(key)
        .map(|raw| {
            raw.parse::<usize>().map_err(|err| {
                DatabaseError::with_cause(
                    DatabaseErrorCode::ProvisionError,
                    format!("invalid value '{raw}' for URI parameter '{key}'"),
                    err,
                )
            })
        })
        .transpose()
}

fn parse_param_f64(params: &HashMap<String, String>, key: &str) -> DbResult<Option<f64>> {
    params
        .get(key)
        .map(|raw| match raw.parse::<f64>() {
            Ok(value) if value.is_finite() && value >= 0.0 => Ok(value),
            Ok(_) => Err(DatabaseError::new(
                DatabaseErrorCode::ProvisionError,
                format!("invalid value '{raw}' for URI parameter '{key}'"),
            )),
            Err(err) => Err(DatabaseError::with_cause(
                DatabaseErrorCode::ProvisionError,
                format!("invalid value '{raw}' for URI parameter '{key}'"),
                err,
            )),
        })
        .transpose()
}
