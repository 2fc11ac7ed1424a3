//! Embedded-backend sessions.
//!
//! A session borrows one pooled connection for its lifetime. In session
//! mode each operation runs inside its own implicit transaction and
//! commits on success; in transaction mode `BEGIN` was issued at enter
//! and effects become visible only on commit. Every blocking call runs on
//! a worker thread with the connection moved in and out of the shared
//! slot, so the store monitor can reclaim the connection from a leaked
//! session without racing an in-flight call.

use std::sync::Arc;

use async_trait::async_trait;
use rusqlite::Connection;
use tracing::debug;

use satchel_core::{Entry, EntryTag};
use satchel_query::TagQuery;

use crate::active::SessionState;
use crate::error::{DatabaseError, DatabaseErrorCode, DbResult};
use crate::sqlite::database::SqliteStoreInner;
use crate::sqlite::handlers;
use crate::sqlite::pool::PooledConn;
use crate::traits::BackendSession;

pub(crate) struct SqliteSession {
    inner: Arc<SqliteStoreInner>,
    state: Arc<SessionState<PooledConn>>,
    session_id: u64,
    profile_id: i64,
    is_txn: bool,
    closed: bool,
}

impl SqliteSession {
    pub(crate) fn new(
        inner: Arc<SqliteStoreInner>,
        state: Arc<SessionState<PooledConn>>,
        session_id: u64,
        profile_id: i64,
        is_txn: bool,
    ) -> Self {
        Self {
            inner,
            state,
            session_id,
            profile_id,
            is_txn,
            closed: false,
        }
    }

    /// Runs one operation on the session connection.
    ///
    /// In session mode the closure executes inside an implicit
    /// transaction that commits on success and rolls back (by drop) on
    /// failure.
    async fn perform<T, F>(&self, f: F) -> DbResult<T>
    where
        F: FnOnce(&Connection) -> DbResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let mut slot = self.state.conn.lock().await;
        let pooled = slot.take().ok_or_else(session_closed)?;
        let is_txn = self.is_txn;
        let joined = tokio::task::spawn_blocking(move || {
            let result = if is_txn {
                f(pooled.connection())
            } else {
                (|| -> DbResult<T> {
                    let txn = pooled.connection().unchecked_transaction()?;
                    let out = f(&txn)?;
                    txn.commit()?;
                    Ok(out)
                })()
            };
            (pooled, result)
        })
        .await;
        match joined {
            Ok((pooled, result)) => {
                *slot = Some(pooled);
                result
            }
            Err(err) => Err(DatabaseError::with_cause(
                DatabaseErrorCode::ConnectionError,
                "session worker task failed",
                err,
            )),
        }
    }

    /// Releases the connection and removes the session from the active
    /// set. The closure decides what to do with any open transaction.
    async fn finish<F>(&mut self, f: F) -> DbResult<()>
    where
        F: FnOnce(&Connection) -> DbResult<()> + Send + 'static,
    {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let mut slot = self.state.conn.lock().await;
        let outcome = match slot.take() {
            None => Ok(()),
            Some(pooled) => {
                let joined = tokio::task::spawn_blocking(move || {
                    let result = f(pooled.connection());
                    (pooled, result)
                })
                .await;
                match joined {
                    Ok((pooled, result)) => {
                        self.inner.pool.release(pooled).await;
                        result
                    }
                    Err(err) => Err(DatabaseError::with_cause(
                        DatabaseErrorCode::ConnectionError,
                        "session close task failed",
                        err,
                    )),
                }
            }
        };
        drop(slot);
        self.inner.active.unregister(self.session_id);
        debug!(session = self.session_id, "session closed");
        outcome
    }

    fn handler(
        &self,
        category: &str,
    ) -> DbResult<&'static dyn handlers::SqliteCategoryHandler> {
        handlers::handler_for(&self.inner.release_number, category)
    }
}

fn session_closed() -> DatabaseError {
    DatabaseError::new(
        DatabaseErrorCode::ConnectionError,
        "session connection is closed",
    )
}

#[async_trait]
impl BackendSession for SqliteSession {
    fn is_transaction(&self) -> bool {
        self.is_txn
    }

    async fn count(&mut self, category: &str, tag_filter: Option<TagQuery>) -> DbResult<u64> {
        let handler = self.handler(category)?;
        let profile_id = self.profile_id;
        let category = category.to_string();
        self.perform(move |conn| handler.count(conn, profile_id, &category, tag_filter.as_ref()))
            .await
    }

    async fn insert(
        &mut self,
        category: &str,
        name: &str,
        value: &str,
        tags: &[EntryTag],
        expiry_ms: Option<i64>,
    ) -> DbResult<()> {
        let handler = self.handler(category)?;
        let profile_id = self.profile_id;
        let (category, name, value) = (category.to_string(), name.to_string(), value.to_string());
        let tags = tags.to_vec();
        self.perform(move |conn| {
            handler.insert(conn, profile_id, &category, &name, &value, &tags, expiry_ms)
        })
        .await
    }

    async fn replace(
        &mut self,
        category: &str,
        name: &str,
        value: &str,
        tags: &[EntryTag],
        expiry_ms: Option<i64>,
    ) -> DbResult<()> {
        let handler = self.handler(category)?;
        let profile_id = self.profile_id;
        let (category, name, value) = (category.to_string(), name.to_string(), value.to_string());
        let tags = tags.to_vec();
        self.perform(move |conn| {
            handler.replace(conn, profile_id, &category, &name, &value, &tags, expiry_ms)
        })
        .await
    }

    async fn fetch(
        &mut self,
        category: &str,
        name: &str,
        tag_filter: Option<TagQuery>,
        for_update: bool,
    ) -> DbResult<Option<Entry>> {
        let handler = self.handler(category)?;
        let profile_id = self.profile_id;
        let (category, name) = (category.to_string(), name.to_string());
        let for_update = for_update && self.is_txn;
        self.perform(move |conn| {
            handler.fetch(conn, profile_id, &category, &name, tag_filter.as_ref(), for_update)
        })
        .await
    }

    async fn fetch_all(
        &mut self,
        category: &str,
        tag_filter: Option<TagQuery>,
        limit: Option<i64>,
        for_update: bool,
        order_by: Option<String>,
        descending: bool,
    ) -> DbResult<Vec<Entry>> {
        let handler = self.handler(category)?;
        let profile_id = self.profile_id;
        let category = category.to_string();
        let for_update = for_update && self.is_txn;
        self.perform(move |conn| {
            handler.fetch_all(
                conn,
                profile_id,
                &category,
                tag_filter.as_ref(),
                limit,
                for_update,
                order_by.as_deref(),
                descending,
            )
        })
        .await
    }

    async fn remove(&mut self, category: &str, name: &str) -> DbResult<()> {
        let handler = self.handler(category)?;
        let profile_id = self.profile_id;
        let (category, name) = (category.to_string(), name.to_string());
        self.perform(move |conn| handler.remove(conn, profile_id, &category, &name))
            .await
    }

    async fn remove_all(&mut self, category: &str, tag_filter: Option<TagQuery>) -> DbResult<u64> {
        let handler = self.handler(category)?;
        let profile_id = self.profile_id;
        let category = category.to_string();
        self.perform(move |conn| {
            handler.remove_all(conn, profile_id, &category, tag_filter.as_ref())
        })
        .await
    }

    async fn commit(&mut self) -> DbResult<()> {
        if !self.is_txn {
            return Err(DatabaseError::new(
                DatabaseErrorCode::QueryError,
                "commit on a non-transaction session",
            ));
        }
        self.finish(|conn| {
            conn.execute_batch("COMMIT")?;
            Ok(())
        })
        .await
    }

    async fn rollback(&mut self) -> DbResult<()> {
        if !self.is_txn {
            return Err(DatabaseError::new(
                DatabaseErrorCode::QueryError,
                "rollback on a non-transaction session",
            ));
        }
        self.finish(|conn| {
            conn.execute_batch("ROLLBACK")?;
            Ok(())
        })
        .await
    }

    async fn close(&mut self) -> DbResult<()> {
        let is_txn = self.is_txn;
        self.finish(move |conn| {
            if !conn.is_autocommit() {
                // An uncommitted transaction rolls back at exit; implicit
                // session work is committed instead.
                let stmt = if is_txn { "ROLLBACK" } else { "COMMIT" };
                conn.execute_batch(stmt)?;
            }
            Ok(())
        })
        .await
    }
}

impl Drop for SqliteSession {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        self.inner.active.unregister(self.session_id);
        let state = self.state.clone();
        let inner = self.inner.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Some(conn) = state.take_conn().await {
                    // Release rolls back any open transaction.
                    inner.pool.release(conn).await;
                }
            });
        }
    }
}
