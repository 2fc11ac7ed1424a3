//! The live embedded store.
//!
//! Owns the connection pool, the resolved default profile, the
//! active-session set, and the background session monitor. Produces
//! sessions and transactions and serves store-scope scans.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, params};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use satchel_query::TagQuery;

use crate::active::{ActiveSessions, SessionState, next_session_id};
use crate::error::{DatabaseError, DatabaseErrorCode, DbResult};
use crate::sqlite::config::SqliteConfig;
use crate::sqlite::handlers::{self, SqliteCategoryHandler};
use crate::sqlite::pool::{ConnectionPool, PooledConn};
use crate::sqlite::session::SqliteSession;
use crate::traits::{BackendSession, BackendStore, SCAN_PAGE_SIZE, Scan, validate_order_by};

static PROFILE_IDS: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(1);

pub(crate) struct SqliteStoreInner {
    pub pool: ConnectionPool,
    pub config: SqliteConfig,
    pub default_profile: String,
    pub default_profile_id: i64,
    pub release_number: String,
    pub active: ActiveSessions<PooledConn>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

/// Embedded-backend implementation of [`BackendStore`].
pub struct SqliteStore {
    pub(crate) inner: Arc<SqliteStoreInner>,
}

impl SqliteStore {
    /// Binds a provisioned or opened pool into a live store: resolves the
    /// default profile id once and starts the session monitor.
    pub(crate) async fn initialize(
        pool: ConnectionPool,
        config: SqliteConfig,
        default_profile: String,
        release_number: String,
    ) -> DbResult<Self> {
        let profile = default_profile.clone();
        let default_profile_id = {
            let conn = pool.acquire().await?;
            let (conn, result) = tokio::task::spawn_blocking(move || {
                let result = lookup_profile_id(conn.connection(), &profile);
                (conn, result)
            })
            .await
            .map_err(worker_failed)?;
            pool.release(conn).await;
            result?
        };

        let store = Self {
            inner: Arc::new(SqliteStoreInner {
                pool,
                config,
                default_profile,
                default_profile_id,
                release_number,
                active: ActiveSessions::new(),
                monitor: Mutex::new(None),
            }),
        };
        store.start_monitor();
        info!(
            release = %store.inner.release_number,
            profile = %store.inner.default_profile,
            "sqlite store ready"
        );
        Ok(store)
    }

    /// Starts the defensive session monitor: sessions older than the
    /// configured threshold have their connection reclaimed.
    fn start_monitor(&self) {
        let weak = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(5));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                let stale = inner.active.over_age(inner.config.session_timeout);
                for (id, state) in stale {
                    warn!(session = id, "closing overdue session");
                    if let Some(conn) = state.take_conn().await {
                        inner.pool.release(conn).await;
                    }
                    inner.active.unregister(id);
                }
            }
        });
        *self.inner.monitor.lock().expect("monitor mutex") = Some(handle);
    }

    async fn with_conn<T, F>(&self, f: F) -> DbResult<T>
    where
        F: FnOnce(&Connection) -> DbResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.inner.pool.acquire().await?;
        let (conn, result) = tokio::task::spawn_blocking(move || {
            let result = f(conn.connection());
            (conn, result)
        })
        .await
        .map_err(worker_failed)?;
        self.inner.pool.release(conn).await;
        result
    }

    async fn resolve_profile_id(&self, profile: Option<&str>) -> DbResult<i64> {
        match profile {
            None => Ok(self.inner.default_profile_id),
            Some(name) if name == self.inner.default_profile => {
                Ok(self.inner.default_profile_id)
            }
            Some(name) => {
                let name = name.to_string();
                self.with_conn(move |conn| lookup_profile_id(conn, &name)).await
            }
        }
    }

    /// Shared driver for offset and keyset scans: pages through the
    /// handler on a dedicated connection, yielding batches through the
    /// scan channel and releasing the connection at the end.
    #[allow(clippy::too_many_arguments)]
    fn spawn_scan(
        &self,
        handler: &'static dyn SqliteCategoryHandler,
        profile_id: i64,
        category: String,
        tag_filter: Option<TagQuery>,
        mut cursor: ScanCursor,
        limit: Option<i64>,
        conn: PooledConn,
    ) -> Scan {
        let (tx, rx) = mpsc::channel(1);
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let mut conn = Some(conn);
            let mut remaining = limit;
            loop {
                let page_limit = remaining
                    .map_or(SCAN_PAGE_SIZE as i64, |r| r.min(SCAN_PAGE_SIZE as i64));
                if page_limit <= 0 {
                    break;
                }
                let pooled = conn.take().expect("scan connection");
                let category_for_page = category.clone();
                let filter_for_page = tag_filter.clone();
                let cursor_for_page = cursor;
                let joined = tokio::task::spawn_blocking(move || {
                    let result = match cursor_for_page {
                        ScanCursor::Offset {
                            offset,
                            order_by,
                            descending,
                        } => handler.scan_page(
                            pooled.connection(),
                            profile_id,
                            &category_for_page,
                            filter_for_page.as_ref(),
                            offset,
                            page_limit,
                            Some(order_by),
                            descending,
                        ),
                        ScanCursor::Keyset { last_id } => handler.scan_keyset_page(
                            pooled.connection(),
                            profile_id,
                            &category_for_page,
                            filter_for_page.as_ref(),
                            last_id,
                            page_limit,
                        ),
                    };
                    (pooled, result)
                })
                .await;

                let (pooled, result) = match joined {
                    Ok(pair) => pair,
                    Err(err) => {
                        let _ = tx.send(Err(worker_failed(err))).await;
                        return;
                    }
                };
                conn = Some(pooled);
                match result {
                    Ok(batch) => {
                        let fetched = batch.len() as i64;
                        cursor.advance(&batch, fetched);
                        if fetched > 0 && tx.send(Ok(batch)).await.is_err() {
                            break;
                        }
                        if let Some(r) = remaining.as_mut() {
                            *r -= fetched;
                        }
                        if fetched < page_limit {
                            break;
                        }
                    }
                    Err(err) => {
                        let _ = tx.send(Err(err)).await;
                        break;
                    }
                }
            }
            if let Some(pooled) = conn.take() {
                inner.pool.release(pooled).await;
            }
            debug!("scan drained");
        });
        Scan::new(rx)
    }
}

#[derive(Clone, Copy)]
enum ScanCursor {
    Offset {
        offset: i64,
        order_by: &'static str,
        descending: bool,
    },
    Keyset {
        last_id: i64,
    },
}

impl ScanCursor {
    fn advance(&mut self, batch: &[satchel_core::Entry], fetched: i64) {
        match self {
            Self::Offset { offset, .. } => *offset += fetched,
            Self::Keyset { last_id } => {
                if let Some(last) = batch.last() {
                    *last_id = last.id;
                }
            }
        }
    }
}

#[async_trait]
impl BackendStore for SqliteStore {
    fn release_number(&self) -> &str {
        &self.inner.release_number
    }

    fn profile_name(&self) -> &str {
        &self.inner.default_profile
    }

    async fn create_profile(&self, name: Option<String>) -> DbResult<String> {
        let name = name.unwrap_or_else(|| {
            format!(
                "profile_{}",
                PROFILE_IDS.fetch_add(1, std::sync::atomic::Ordering::Relaxed)
            )
        });
        let insert_name = name.clone();
        self.with_conn(move |conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO profiles (name, profile_key) VALUES (?, NULL)",
                params![insert_name],
            )?;
            if inserted == 0 {
                return Err(DatabaseError::new(
                    DatabaseErrorCode::ProfileAlreadyExists,
                    format!("profile '{insert_name}' already exists"),
                ));
            }
            Ok(())
        })
        .await?;
        Ok(name)
    }

    async fn remove_profile(&self, name: &str) -> DbResult<bool> {
        let name = name.to_string();
        self.with_conn(move |conn| {
            let removed = conn.execute("DELETE FROM profiles WHERE name = ?", params![name])?;
            Ok(removed > 0)
        })
        .await
    }

    async fn rekey(&self, pass_key: &str) -> DbResult<()> {
        let key = pass_key.to_string();
        self.with_conn(move |conn| {
            let cipher_version: Option<String> = conn
                .query_row("PRAGMA cipher_version", [], |row| row.get(0))
                .optional()?;
            if cipher_version.map(|v| v.is_empty()).unwrap_or(true) {
                return Err(DatabaseError::new(
                    DatabaseErrorCode::DatabaseNotEncrypted,
                    "cannot rekey an unencrypted database",
                ));
            }
            let escaped = key.replace('\'', "''");
            conn.execute_batch(&format!("PRAGMA rekey = '{escaped}'"))?;
            Ok(())
        })
        .await?;
        // New connections must open with the new key; idle ones are
        // discarded rather than left keyed to the old secret.
        self.inner.pool.set_key(Some(pass_key.to_string()));
        Ok(())
    }

    async fn scan(
        &self,
        profile: Option<&str>,
        category: &str,
        tag_filter: Option<TagQuery>,
        offset: Option<i64>,
        limit: Option<i64>,
        order_by: Option<String>,
        descending: bool,
    ) -> DbResult<Scan> {
        let order_col = validate_order_by(order_by.as_deref())?;
        let handler = handlers::handler_for(&self.inner.release_number, category)?;
        let profile_id = self.resolve_profile_id(profile).await?;
        let conn = self.inner.pool.acquire().await?;
        Ok(self.spawn_scan(
            handler,
            profile_id,
            category.to_string(),
            tag_filter,
            ScanCursor::Offset {
                offset: offset.unwrap_or(0),
                order_by: order_col,
                descending,
            },
            limit,
            conn,
        ))
    }

    async fn scan_keyset(
        &self,
        profile: Option<&str>,
        category: &str,
        tag_filter: Option<TagQuery>,
        last_id: Option<i64>,
        limit: Option<i64>,
    ) -> DbResult<Scan> {
        let handler = handlers::handler_for(&self.inner.release_number, category)?;
        let profile_id = self.resolve_profile_id(profile).await?;
        let conn = self.inner.pool.acquire().await?;
        Ok(self.spawn_scan(
            handler,
            profile_id,
            category.to_string(),
            tag_filter,
            ScanCursor::Keyset {
                last_id: last_id.unwrap_or(0),
            },
            limit,
            conn,
        ))
    }

    async fn session(
        &self,
        profile: Option<&str>,
        transaction: bool,
    ) -> DbResult<Box<dyn BackendSession>> {
        if self.inner.active.live_count() >= self.inner.config.max_sessions {
            return Err(DatabaseError::new(
                DatabaseErrorCode::ConnectionPoolExhausted,
                format!(
                    "maximum number of active sessions reached ({})",
                    self.inner.config.max_sessions
                ),
            ));
        }
        let profile_name = profile.unwrap_or(&self.inner.default_profile).to_string();
        let known_id = (profile_name == self.inner.default_profile)
            .then_some(self.inner.default_profile_id);

        // Enter: acquire with bounded retries on transient failure.
        let mut attempt = 0;
        let pooled = loop {
            match self.inner.pool.acquire().await {
                Ok(conn) => break conn,
                Err(err) => {
                    attempt += 1;
                    if attempt >= 5 {
                        return Err(DatabaseError::with_cause(
                            DatabaseErrorCode::ConnectionError,
                            "failed to enter session",
                            err,
                        ));
                    }
                    debug!(attempt, "session enter retry");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        };

        let profile_for_task = profile_name.clone();
        let (pooled, result) = tokio::task::spawn_blocking(move || {
            let result = (|| -> DbResult<i64> {
                let conn = pooled.connection();
                let profile_id = match known_id {
                    Some(id) => id,
                    None => lookup_profile_id(conn, &profile_for_task)?,
                };
                if transaction {
                    conn.execute_batch("BEGIN")?;
                }
                Ok(profile_id)
            })();
            (pooled, result)
        })
        .await
        .map_err(worker_failed)?;
        let profile_id = match result {
            Ok(id) => id,
            Err(err) => {
                self.inner.pool.release(pooled).await;
                return Err(err);
            }
        };

        let state = Arc::new(SessionState::new(pooled));
        let session_id = next_session_id();
        self.inner.active.register(session_id, &state);
        debug!(session = session_id, active = self.inner.active.live_count(), "session opened");
        Ok(Box::new(SqliteSession::new(
            self.inner.clone(),
            state,
            session_id,
            profile_id,
            transaction,
        )))
    }

    async fn close(&self, remove: bool) -> DbResult<()> {
        if let Some(handle) = self.inner.monitor.lock().expect("monitor mutex").take() {
            handle.abort();
        }
        for (id, state) in self.inner.active.drain() {
            if let Some(conn) = state.take_conn().await {
                warn!(session = id, "closing store with live session");
                self.inner.pool.release(conn).await;
            }
        }
        self.inner.pool.close().await;
        if remove {
            self.inner.config.remove().await?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore")
            .field("release", &self.inner.release_number)
            .field("profile", &self.inner.default_profile)
            .finish_non_exhaustive()
    }
}

pub(crate) fn lookup_profile_id(conn: &Connection, profile: &str) -> DbResult<i64> {
    let id: Option<i64> = conn
        .query_row(
            "SELECT id FROM profiles WHERE name = ?",
            params![profile],
            |row| row.get(0),
        )
        .optional()?;
    id.ok_or_else(|| {
        DatabaseError::new(
            DatabaseErrorCode::ProfileNotFound,
            format!("profile '{profile}' not found"),
        )
    })
}

fn worker_failed(err: tokio::task::JoinError) -> DatabaseError {
    DatabaseError::with_cause(
        DatabaseErrorCode::ConnectionError,
        "store worker task failed",
        err,
    )
}
