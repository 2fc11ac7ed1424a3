//! Server-backend sessions.
//!
//! Same discipline as the embedded sessions, without the blocking-worker
//! indirection: the client is async. In session mode each operation is
//! wrapped in `BEGIN` / `COMMIT` (rolled back on failure); in transaction
//! mode `BEGIN` was issued at enter and the statements join that
//! transaction until commit or rollback. The connection-slot lock is held
//! across each operation so the store monitor cannot reclaim the
//! connection out from under an in-flight call.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_postgres::Client;
use tracing::debug;

use satchel_core::value::decode_hex_prefixed;
use satchel_core::{Entry, EntryTag};
use satchel_query::TagQuery;

use crate::active::SessionState;
use crate::error::{DatabaseError, DatabaseErrorCode, DbResult};
use crate::postgres::database::PgStoreInner;
use crate::postgres::handlers;
use crate::postgres::pool::PooledPgConn;
use crate::traits::BackendSession;

/// Rewrites a `\x…` hex-encoded value produced by the engine back to its
/// text form. Values without the prefix pass through; a prefixed value
/// that fails to decode fails the read.
pub(crate) fn decode_entry_value(entry: &mut Entry) -> DbResult<()> {
    match decode_hex_prefixed(&entry.value) {
        Ok(Some(decoded)) => {
            entry.value = decoded;
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => Err(DatabaseError::with_cause(
            DatabaseErrorCode::QueryError,
            format!(
                "failed to decode hex-encoded value for '{}' in category '{}'",
                entry.name, entry.category
            ),
            err,
        )),
    }
}

pub(crate) struct PgSession {
    inner: Arc<PgStoreInner>,
    state: Arc<SessionState<PooledPgConn>>,
    session_id: u64,
    profile_id: i64,
    is_txn: bool,
    closed: bool,
}

impl PgSession {
    pub(crate) fn new(
        inner: Arc<PgStoreInner>,
        state: Arc<SessionState<PooledPgConn>>,
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

    /// Opens the implicit per-operation transaction in session mode.
    async fn begin_op(&self, client: &Client) -> DbResult<()> {
        if !self.is_txn {
            client.batch_execute("BEGIN").await?;
        }
        Ok(())
    }

    /// Commits the implicit work on success or rolls it back on failure,
    /// in session mode; a no-op inside a transaction.
    async fn end_op<T>(&self, client: &Client, result: DbResult<T>) -> DbResult<T> {
        if self.is_txn {
            return result;
        }
        match result {
            Ok(value) => {
                client.batch_execute("COMMIT").await?;
                Ok(value)
            }
            Err(err) => {
                let _ = client.batch_execute("ROLLBACK").await;
                Err(err)
            }
        }
    }

    /// Releases the connection and removes the session from the active
    /// set, running `terminal` (commit or rollback) first if the
    /// connection is still held.
    async fn finish(&mut self, terminal: Option<&'static str>) -> DbResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let mut slot = self.state.conn.lock().await;
        let outcome = match slot.take() {
            None => Ok(()),
            Some(conn) => {
                let result = match terminal {
                    Some(stmt) => conn
                        .client()
                        .batch_execute(stmt)
                        .await
                        .map_err(DatabaseError::from),
                    None => Ok(()),
                };
                self.inner.pool.release(conn).await;
                result
            }
        };
        drop(slot);
        self.inner.active.unregister(self.session_id);
        debug!(session = self.session_id, "session closed");
        outcome
    }

    fn handler(&self, category: &str) -> DbResult<&'static dyn handlers::PgCategoryHandler> {
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
impl BackendSession for PgSession {
    fn is_transaction(&self) -> bool {
        self.is_txn
    }

    async fn count(&mut self, category: &str, tag_filter: Option<TagQuery>) -> DbResult<u64> {
        let handler = self.handler(category)?;
        let slot = self.state.conn.lock().await;
        let conn = slot.as_ref().ok_or_else(session_closed)?;
        let client = conn.client();
        self.begin_op(client).await?;
        let result = handler
            .count(
                client,
                &self.inner.schema,
                self.profile_id,
                category,
                tag_filter.as_ref(),
            )
            .await;
        self.end_op(client, result).await
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
        let slot = self.state.conn.lock().await;
        let conn = slot.as_ref().ok_or_else(session_closed)?;
        let client = conn.client();
        self.begin_op(client).await?;
        let result = handler
            .insert(
                client,
                &self.inner.schema,
                self.profile_id,
                category,
                name,
                value,
                tags,
                expiry_ms,
            )
            .await;
        self.end_op(client, result).await
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
        let slot = self.state.conn.lock().await;
        let conn = slot.as_ref().ok_or_else(session_closed)?;
        let client = conn.client();
        self.begin_op(client).await?;
        let result = handler
            .replace(
                client,
                &self.inner.schema,
                self.profile_id,
                category,
                name,
                value,
                tags,
                expiry_ms,
            )
            .await;
        self.end_op(client, result).await
    }

    async fn fetch(
        &mut self,
        category: &str,
        name: &str,
        tag_filter: Option<TagQuery>,
        for_update: bool,
    ) -> DbResult<Option<Entry>> {
        let handler = self.handler(category)?;
        let for_update = for_update && self.is_txn;
        let slot = self.state.conn.lock().await;
        let conn = slot.as_ref().ok_or_else(session_closed)?;
        let client = conn.client();
        self.begin_op(client).await?;
        let result = handler
            .fetch(
                client,
                &self.inner.schema,
                self.profile_id,
                category,
                name,
                tag_filter.as_ref(),
                for_update,
            )
            .await;
        let mut entry = self.end_op(client, result).await?;
        if let Some(entry) = entry.as_mut() {
            decode_entry_value(entry)?;
        }
        Ok(entry)
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
        let for_update = for_update && self.is_txn;
        let slot = self.state.conn.lock().await;
        let conn = slot.as_ref().ok_or_else(session_closed)?;
        let client = conn.client();
        self.begin_op(client).await?;
        let result = handler
            .fetch_all(
                client,
                &self.inner.schema,
                self.profile_id,
                category,
                tag_filter.as_ref(),
                limit,
                for_update,
                order_by.as_deref(),
                descending,
            )
            .await;
        let mut entries = self.end_op(client, result).await?;
        for entry in entries.iter_mut() {
            decode_entry_value(entry)?;
        }
        Ok(entries)
    }

    async fn remove(&mut self, category: &str, name: &str) -> DbResult<()> {
        let handler = self.handler(category)?;
        let slot = self.state.conn.lock().await;
        let conn = slot.as_ref().ok_or_else(session_closed)?;
        let client = conn.client();
        self.begin_op(client).await?;
        let result = handler
            .remove(client, &self.inner.schema, self.profile_id, category, name)
            .await;
        self.end_op(client, result).await
    }

    async fn remove_all(&mut self, category: &str, tag_filter: Option<TagQuery>) -> DbResult<u64> {
        let handler = self.handler(category)?;
        let slot = self.state.conn.lock().await;
        let conn = slot.as_ref().ok_or_else(session_closed)?;
        let client = conn.client();
        self.begin_op(client).await?;
        let result = handler
            .remove_all(
                client,
                &self.inner.schema,
                self.profile_id,
                category,
                tag_filter.as_ref(),
            )
            .await;
        self.end_op(client, result).await
    }

    async fn commit(&mut self) -> DbResult<()> {
        if !self.is_txn {
            return Err(DatabaseError::new(
                DatabaseErrorCode::QueryError,
                "commit on a non-transaction session",
            ));
        }
        self.finish(Some("COMMIT")).await
    }

    async fn rollback(&mut self) -> DbResult<()> {
        if !self.is_txn {
            return Err(DatabaseError::new(
                DatabaseErrorCode::QueryError,
                "rollback on a non-transaction session",
            ));
        }
        self.finish(Some("ROLLBACK")).await
    }

    async fn close(&mut self) -> DbResult<()> {
        // An uncommitted transaction rolls back at exit; session-mode
        // work was already committed per call.
        let terminal = self.is_txn.then_some("ROLLBACK");
        self.finish(terminal).await
    }
}

impl Drop for PgSession {
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
