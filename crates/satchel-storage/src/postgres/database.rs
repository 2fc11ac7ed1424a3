//! The live server store.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use satchel_core::Entry;
use satchel_query::TagQuery;

use crate::active::{ActiveSessions, SessionState, next_session_id};
use crate::error::{DatabaseError, DatabaseErrorCode, DbResult};
use crate::postgres::config::PostgresConfig;
use crate::postgres::handlers::{self, PgCategoryHandler};
use crate::postgres::pool::{PooledPgConn, PostgresConnectionPool};
use crate::postgres::schema::SchemaContext;
use crate::postgres::session::{PgSession, decode_entry_value};
use crate::traits::{BackendSession, BackendStore, SCAN_PAGE_SIZE, Scan, validate_order_by};

static PROFILE_IDS: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(1);

pub(crate) struct PgStoreInner {
    pub pool: PostgresConnectionPool,
    pub config: PostgresConfig,
    pub schema: SchemaContext,
    pub default_profile: String,
    pub default_profile_id: i64,
    pub release_number: String,
    pub active: ActiveSessions<PooledPgConn>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

/// Server-backend implementation of [`BackendStore`].
pub struct PostgresStore {
    pub(crate) inner: Arc<PgStoreInner>,
}

impl PostgresStore {
    /// Binds a provisioned or opened pool into a live store: resolves the
    /// default profile id once and starts the session monitor.
    pub(crate) async fn initialize(
        pool: PostgresConnectionPool,
        config: PostgresConfig,
        default_profile: String,
        release_number: String,
    ) -> DbResult<Self> {
        let schema = config.schema_context.clone();
        let default_profile_id = {
            let conn = pool.acquire().await?;
            let result = lookup_profile_id(conn.client(), &schema, &default_profile).await;
            pool.release(conn).await;
            result?
        };
        let store = Self {
            inner: Arc::new(PgStoreInner {
                pool,
                schema,
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
            "postgres store ready"
        );
        Ok(store)
    }

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

    async fn resolve_profile_id(&self, profile: Option<&str>) -> DbResult<i64> {
        match profile {
            None => Ok(self.inner.default_profile_id),
            Some(name) if name == self.inner.default_profile => {
                Ok(self.inner.default_profile_id)
            }
            Some(name) => {
                let conn = self.inner.pool.acquire().await?;
                let result = lookup_profile_id(conn.client(), &self.inner.schema, name).await;
                self.inner.pool.release(conn).await;
                result
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn spawn_scan(
        &self,
        handler: &'static dyn PgCategoryHandler,
        profile_id: i64,
        category: String,
        tag_filter: Option<TagQuery>,
        mut cursor: PgScanCursor,
        limit: Option<i64>,
        conn: PooledPgConn,
    ) -> Scan {
        let (tx, rx) = mpsc::channel(1);
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let mut remaining = limit;
            loop {
                let page_limit = remaining
                    .map_or(SCAN_PAGE_SIZE as i64, |r| r.min(SCAN_PAGE_SIZE as i64));
                if page_limit <= 0 {
                    break;
                }
                let result = match cursor {
                    PgScanCursor::Offset {
                        offset,
                        order_by,
                        descending,
                    } => {
                        handler
                            .scan_page(
                                conn.client(),
                                &inner.schema,
                                profile_id,
                                &category,
                                tag_filter.as_ref(),
                                offset,
                                page_limit,
                                Some(order_by),
                                descending,
                            )
                            .await
                    }
                    PgScanCursor::Keyset { last_id } => {
                        handler
                            .scan_keyset_page(
                                conn.client(),
                                &inner.schema,
                                profile_id,
                                &category,
                                tag_filter.as_ref(),
                                last_id,
                                page_limit,
                            )
                            .await
                    }
                };
                match result {
                    Ok(mut batch) => {
                        if let Err(err) = batch.iter_mut().try_for_each(decode_entry_value) {
                            let _ = tx.send(Err(err)).await;
                            break;
                        }
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
            inner.pool.release(conn).await;
            debug!("scan drained");
        });
        Scan::new(rx)
    }
}

enum PgScanCursor {
    Offset {
        offset: i64,
        order_by: &'static str,
        descending: bool,
    },
    Keyset {
        last_id: i64,
    },
}

impl PgScanCursor {
    fn advance(&mut self, batch: &[Entry], fetched: i64) {
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
impl BackendStore for PostgresStore {
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
        let conn = self.inner.pool.acquire().await?;
        let result = conn
            .client()
            .query_opt(
                &format!(
                    "INSERT INTO {} (name, profile_key) VALUES ($1, NULL) \
                     ON CONFLICT (name) DO NOTHING RETURNING id",
                    self.inner.schema.qualify("profiles")
                ),
                &[&name],
            )
            .await;
        self.inner.pool.release(conn).await;
        match result? {
            Some(_) => Ok(name),
            None => Err(DatabaseError::new(
                DatabaseErrorCode::ProfileAlreadyExists,
                format!("profile '{name}' already exists"),
            )),
        }
    }

    async fn remove_profile(&self, name: &str) -> DbResult<bool> {
        let conn = self.inner.pool.acquire().await?;
        let result = conn
            .client()
            .execute(
                &format!(
                    "DELETE FROM {} WHERE name = $1",
                    self.inner.schema.qualify("profiles")
                ),
                &[&name],
            )
            .await;
        self.inner.pool.release(conn).await;
        Ok(result? > 0)
    }

    async fn rekey(&self, _pass_key: &str) -> DbResult<()> {
        Err(DatabaseError::new(
            DatabaseErrorCode::UnsupportedOperation,
            "rekey is not supported by the postgres backend",
        ))
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
            PgScanCursor::Offset {
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
            PgScanCursor::Keyset {
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

        let mut attempt = 0;
        let conn = loop {
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

        let profile_id = match known_id {
            Some(id) => id,
            None => match lookup_profile_id(conn.client(), &self.inner.schema, &profile_name).await
            {
                Ok(id) => id,
                Err(err) => {
                    self.inner.pool.release(conn).await;
                    return Err(err);
                }
            },
        };
        if transaction {
            if let Err(err) = conn.client().batch_execute("BEGIN").await {
                self.inner.pool.release(conn).await;
                return Err(err.into());
            }
        }

        let state = Arc::new(SessionState::new(conn));
        let session_id = next_session_id();
        self.inner.active.register(session_id, &state);
        debug!(session = session_id, active = self.inner.active.live_count(), "session opened");
        Ok(Box::new(PgSession::new(
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

impl std::fmt::Debug for PostgresStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresStore")
            .field("release", &self.inner.release_number)
            .field("profile", &self.inner.default_profile)
            .finish_non_exhaustive()
    }
}

pub(crate) async fn lookup_profile_id(
    client: &tokio_postgres::Client,
    schema: &SchemaContext,
    profile: &str,
) -> DbResult<i64> {
    let row = client
        .query_opt(
            &format!("SELECT id FROM {} WHERE name = $1", schema.qualify("profiles")),
            &[&profile],
        )
        .await?;
    row.map(|r| r.get(0)).ok_or_else(|| {
        DatabaseError::new(
            DatabaseErrorCode::ProfileNotFound,
            format!("profile '{profile}' not found"),
        )
    })
}
