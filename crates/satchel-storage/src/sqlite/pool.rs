//! Bounded pool of embedded connections.
//!
//! The engine is blocking, so every call that touches a connection runs
//! on the blocking-task pool. A semaphore bounds the number of live
//! connections; idle ones wait in a deque and are validated with a
//! trivial round-trip both on acquire and on release. A keep-alive task
//! revalidates idle connections, retires stale ones, tops the pool back
//! up to its minimum, and checkpoints the WAL.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rusqlite::{Connection, OpenFlags};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{DatabaseError, DatabaseErrorCode, DbResult};

/// Pool settings resolved from the backend config.
#[derive(Debug, Clone)]
pub struct SqlitePoolConfig {
    /// Database path, or a `file:…?mode=memory&cache=shared` URI.
    pub path: String,
    /// Whether the store is in-memory (no WAL checkpointing or file
    /// removal applies).
    pub in_memory: bool,
    /// Connections kept alive by the keep-alive task.
    pub min_size: usize,
    /// Hard cap on live connections.
    pub max_size: usize,
    /// Default timeout for [`ConnectionPool::acquire`].
    pub acquire_timeout: Duration,
    /// Idle connections older than this are retired.
    pub max_idle: Duration,
    /// Connections older than this are retired on release or sweep.
    pub max_lifetime: Duration,
    /// SQLite busy timeout applied per connection.
    pub busy_timeout: Duration,
    /// SQLCipher key, when the store is encrypted.
    pub encryption_key: Option<String>,
}

struct IdleConn {
    conn: Connection,
    created: Instant,
    idle_since: Instant,
}

struct PoolInner {
    config: SqlitePoolConfig,
    key: Mutex<Option<String>>,
    idle: Mutex<VecDeque<IdleConn>>,
    semaphore: Arc<Semaphore>,
}

/// A connection checked out of the pool.
///
/// Holds the semaphore permit for its lifetime; dropping it without a
/// release closes the connection and frees the slot.
pub struct PooledConn {
    conn: Connection,
    created: Instant,
    _permit: OwnedSemaphorePermit,
}

impl PooledConn {
    /// The underlying connection.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl std::fmt::Debug for PooledConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConn")
            .field("age", &self.created.elapsed())
            .finish_non_exhaustive()
    }
}

/// Bounded pool of live embedded connections.
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
    keepalive: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionPool {
    /// Creates the pool, eagerly opening `min_size` connections so that a
    /// bad path or key fails here rather than on first use.
    pub async fn new(config: SqlitePoolConfig) -> DbResult<Self> {
        let inner = Arc::new(PoolInner {
            key: Mutex::new(config.encryption_key.clone()),
            semaphore: Arc::new(Semaphore::new(config.max_size)),
            idle: Mutex::new(VecDeque::new()),
            config,
        });
        let warm = inner.clone();
        tokio::task::spawn_blocking(move || -> DbResult<()> {
            for _ in 0..warm.config.min_size {
                let conn = open_connection(&warm.config, warm.key.lock().expect("key mutex").as_deref())?;
                warm.idle
                    .lock()
                    .expect("pool mutex")
                    .push_back(IdleConn {
                        conn,
                        created: Instant::now(),
                        idle_since: Instant::now(),
                    });
            }
            Ok(())
        })
        .await
        .map_err(worker_failed)??;

        let pool = Self {
            keepalive: Mutex::new(None),
            inner,
        };
        pool.start_keepalive();
        Ok(pool)
    }

    /// Maximum number of live connections.
    pub fn max_size(&self) -> usize {
        self.inner.config.max_size
    }

    /// Acquires a connection within the configured timeout.
    pub async fn acquire(&self) -> DbResult<PooledConn> {
        self.acquire_timeout(self.inner.config.acquire_timeout).await
    }

    /// Acquires a connection, blocking up to `timeout`.
    ///
    /// A connection popped from the idle set is verified with a trivial
    /// round-trip first; broken ones are discarded and replaced
    /// transparently.
    pub async fn acquire_timeout(&self, timeout: Duration) -> DbResult<PooledConn> {
        let permit = match tokio::time::timeout(
            timeout,
            self.inner.semaphore.clone().acquire_owned(),
        )
        .await
        {
            Err(_) => {
                return Err(DatabaseError::new(
                    DatabaseErrorCode::ConnectionPoolExhausted,
                    format!(
                        "connection pool exhausted after {:.1}s",
                        timeout.as_secs_f64()
                    ),
                ));
            }
            Ok(Err(_)) => {
                return Err(DatabaseError::new(
                    DatabaseErrorCode::ConnectionError,
                    "connection pool is closed",
                ));
            }
            Ok(Ok(permit)) => permit,
        };

        let inner = self.inner.clone();
        let opened = tokio::task::spawn_blocking(move || -> DbResult<(Connection, Instant)> {
            loop {
                let idle = inner.idle.lock().expect("pool mutex").pop_front();
                match idle {
                    Some(ic) => {
                        if verify_connection(&ic.conn) {
                            return Ok((ic.conn, ic.created));
                        }
                        debug!("discarding broken pooled connection");
                    }
                    None => {
                        let key = inner.key.lock().expect("key mutex").clone();
                        let conn = open_connection(&inner.config, key.as_deref())?;
                        return Ok((conn, Instant::now()));
                    }
                }
            }
        })
        .await
        .map_err(worker_failed)?;

        let (conn, created) = opened?;
        Ok(PooledConn {
            conn,
            created,
            _permit: permit,
        })
    }

    /// Returns a connection to the pool.
    ///
    /// Any open transaction is rolled back first; a connection that fails
    /// verification or has outlived `max_lifetime` is closed instead and
    /// its slot freed for a replacement.
    pub async fn release(&self, pooled: PooledConn) {
        let inner = self.inner.clone();
        let result = tokio::task::spawn_blocking(move || {
            let PooledConn {
                conn,
                created,
                _permit,
            } = pooled;
            if !conn.is_autocommit() {
                if let Err(err) = conn.execute_batch("ROLLBACK") {
                    warn!(%err, "rollback on release failed, closing connection");
                    return;
                }
            }
            if verify_connection(&conn) && created.elapsed() < inner.config.max_lifetime {
                inner.idle.lock().expect("pool mutex").push_back(IdleConn {
                    conn,
                    created,
                    idle_since: Instant::now(),
                });
            } else {
                debug!("closing connection on release");
            }
        })
        .await;
        if let Err(err) = result {
            warn!(%err, "connection release task failed");
        }
    }

    /// Swaps the encryption key used for new connections and discards the
    /// idle set so nothing opened under the old key lingers.
    pub fn set_key(&self, key: Option<String>) {
        *self.inner.key.lock().expect("key mutex") = key;
        self.inner.idle.lock().expect("pool mutex").clear();
    }

    fn start_keepalive(&self) {
        let inner = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(10));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let Some(inner) = inner.upgrade() else { break };
                let sweep = tokio::task::spawn_blocking(move || keepalive_sweep(&inner)).await;
                if sweep.is_err() {
                    break;
                }
            }
        });
        *self.keepalive.lock().expect("keepalive mutex") = Some(handle);
    }

    /// Drains and closes every idle connection, stops the keep-alive
    /// task, and checkpoints the WAL.
    pub async fn close(&self) {
        if let Some(handle) = self.keepalive.lock().expect("keepalive mutex").take() {
            handle.abort();
        }
        self.inner.semaphore.close();
        let inner = self.inner.clone();
        let result = tokio::task::spawn_blocking(move || {
            checkpoint_wal(&inner);
            inner.idle.lock().expect("pool mutex").clear();
        })
        .await;
        if let Err(err) = result {
            warn!(%err, "pool close task failed");
        }
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("path", &self.inner.config.path)
            .field("max_size", &self.inner.config.max_size)
            .finish_non_exhaustive()
    }
}

/// Opens and configures one connection: key pragmas first (when
/// encrypted), then journal mode, foreign keys, and busy timeout.
pub(crate) fn open_connection(
    config: &SqlitePoolConfig,
    key: Option<&str>,
) -> DbResult<Connection> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_URI
        | OpenFlags::SQLITE_OPEN_NO_MUTEX;
    let conn = Connection::open_with_flags(&config.path, flags).map_err(|err| {
        DatabaseError::with_cause(
            DatabaseErrorCode::ConnectionError,
            format!("failed to open database at {}", config.path),
            err,
        )
    })?;
    if let Some(key) = key {
        let escaped = key.replace('\'', "''");
        conn.execute_batch(&format!(
            "PRAGMA key = '{escaped}'; PRAGMA cipher_compatibility = 4;"
        ))
        .map_err(|err| {
            DatabaseError::with_cause(
                DatabaseErrorCode::ConnectionError,
                "failed to apply encryption key",
                err,
            )
        })?;
    }
    conn.busy_timeout(config.busy_timeout)?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA synchronous = FULL;
         PRAGMA wal_autocheckpoint = 1000;",
    )
    .map_err(|err| {
        DatabaseError::with_cause(
            DatabaseErrorCode::ConnectionError,
            "failed to set connection pragmas",
            err,
        )
    })?;
    Ok(conn)
}

fn verify_connection(conn: &Connection) -> bool {
    conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0)).is_ok()
}

fn checkpoint_wal(inner: &PoolInner) {
    if inner.config.in_memory {
        return;
    }
    let key = inner.key.lock().expect("key mutex").clone();
    match open_connection(&inner.config, key.as_deref()) {
        Ok(conn) => {
            if let Err(err) = conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);") {
                warn!(%err, "WAL checkpoint failed");
            }
        }
        Err(err) => warn!(%err, "could not open checkpoint connection"),
    }
}

fn keepalive_sweep(inner: &PoolInner) {
    checkpoint_wal(inner);

    let mut idle = inner.idle.lock().expect("pool mutex");
    let initial = idle.len();
    let mut kept = VecDeque::with_capacity(initial);
    while let Some(ic) = idle.pop_front() {
        let stale = ic.created.elapsed() > inner.config.max_lifetime
            || ic.idle_since.elapsed() > inner.config.max_idle;
        let healthy =
            !stale && verify_connection(&ic.conn) && ic.conn.execute_batch("BEGIN; ROLLBACK;").is_ok();
        if healthy {
            kept.push_back(ic);
        }
    }
    if kept.len() < initial {
        debug!(lost = initial - kept.len(), "retired connections during keep-alive");
    }

    // Top back up to the configured minimum, counting checked-out
    // connections against the target.
    let in_use = inner.config.max_size - inner.semaphore.available_permits();
    let key = inner.key.lock().expect("key mutex").clone();
    while kept.len() + in_use < inner.config.min_size {
        match open_connection(&inner.config, key.as_deref()) {
            Ok(conn) => kept.push_back(IdleConn {
                conn,
                created: Instant::now(),
                idle_since: Instant::now(),
            }),
            Err(err) => {
                warn!(%err, "failed to restore connection in keep-alive");
                break;
            }
        }
    }
    *idle = kept;
}

fn worker_failed(err: tokio::task::JoinError) -> DatabaseError {
    DatabaseError::with_cause(
        DatabaseErrorCode::ConnectionError,
        "pool worker task failed",
        err,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(path: String, max_size: usize) -> SqlitePoolConfig {
        SqlitePoolConfig {
            path,
            in_memory: false,
            min_size: 1,
            max_size,
            acquire_timeout: Duration::from_millis(250),
            max_idle: Duration::from_secs(300),
            max_lifetime: Duration::from_secs(3600),
            busy_timeout: Duration::from_secs(5),
            encryption_key: None,
        }
    }

    #[tokio::test]
    async fn acquire_and_release_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pool.db").to_string_lossy().into_owned();
        let pool = ConnectionPool::new(test_config(path, 2)).await.unwrap();
        let conn = pool.acquire().await.unwrap();
        let one: i64 = conn
            .connection()
            .query_row("SELECT 1", [], |row| row.get(0))
            .unwrap();
        assert_eq!(one, 1);
        pool.release(conn).await;
        pool.close().await;
    }

    #[tokio::test]
    async fn exhausted_pool_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pool.db").to_string_lossy().into_owned();
        let pool = ConnectionPool::new(test_config(path, 1)).await.unwrap();
        let held = pool.acquire().await.unwrap();
        let err = pool.acquire().await.unwrap_err();
        assert_eq!(err.code(), Some(DatabaseErrorCode::ConnectionPoolExhausted));
        pool.release(held).await;
        // The slot is free again.
        let conn = pool.acquire().await.unwrap();
        pool.release(conn).await;
        pool.close().await;
    }

    #[tokio::test]
    async fn release_rolls_back_open_transactions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pool.db").to_string_lossy().into_owned();
        let pool = ConnectionPool::new(test_config(path, 1)).await.unwrap();

        let conn = pool.acquire().await.unwrap();
        conn.connection()
            .execute_batch("CREATE TABLE t (x INTEGER); BEGIN; INSERT INTO t VALUES (1);")
            .unwrap();
        assert!(!conn.connection().is_autocommit());
        pool.release(conn).await;

        let conn = pool.acquire().await.unwrap();
        assert!(conn.connection().is_autocommit());
        let count: i64 = conn
            .connection()
            .query_row("SELECT COUNT(*) FROM t", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0, "uncommitted insert must be rolled back");
        pool.release(conn).await;
        pool.close().await;
    }
}
