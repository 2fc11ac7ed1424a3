//! Bounded pool of server connections.
//!
//! Each pooled connection is a `tokio_postgres` client plus the spawned
//! task driving its socket. Validation, release hygiene, and keep-alive
//! mirror the embedded pool: verify with a trivial round-trip on acquire
//! and on release, roll back residual transaction state before reuse,
//! retire stale connections, and keep the pool topped up to its minimum.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_postgres::{Client, NoTls};
use tracing::{debug, warn};

use crate::error::{DatabaseError, DatabaseErrorCode, DbResult};

/// Pool settings resolved from the backend config.
#[derive(Debug, Clone)]
pub struct PgPoolConfig {
    /// Connection string understood by `tokio_postgres`.
    pub conn_str: String,
    /// Connections kept alive by the keep-alive task.
    pub min_size: usize,
    /// Hard cap on live connections.
    pub max_size: usize,
    /// Default timeout for [`PostgresConnectionPool::acquire`].
    pub acquire_timeout: Duration,
    /// Idle connections older than this are retired.
    pub max_idle: Duration,
    /// Connections older than this are retired regardless of use.
    pub max_lifetime: Duration,
}

/// A live client plus its socket driver task.
pub(crate) struct PgClientConn {
    pub(crate) client: Client,
    driver: JoinHandle<()>,
    created: Instant,
}

impl Drop for PgClientConn {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

/// Opens one connection and spawns its driver.
pub(crate) async fn connect(conn_str: &str) -> DbResult<PgClientConn> {
    let config: tokio_postgres::Config = conn_str.parse().map_err(|err| {
        DatabaseError::with_cause(
            DatabaseErrorCode::ConnectionError,
            "invalid postgres connection string",
            err,
        )
    })?;
    let (client, connection) = config.connect(NoTls).await?;
    let driver = tokio::spawn(async move {
        if let Err(err) = connection.await {
            debug!(%err, "postgres connection driver ended");
        }
    });
    Ok(PgClientConn {
        client,
        driver,
        created: Instant::now(),
    })
}

async fn verify(client: &Client) -> bool {
    !client.is_closed() && client.simple_query("SELECT 1").await.is_ok()
}

struct IdleEntry {
    conn: PgClientConn,
    idle_since: Instant,
}

struct PgPoolInner {
    config: PgPoolConfig,
    semaphore: Arc<Semaphore>,
    idle: Mutex<VecDeque<IdleEntry>>,
}

/// A connection checked out of the pool.
pub struct PooledPgConn {
    conn: PgClientConn,
    _permit: OwnedSemaphorePermit,
}

impl PooledPgConn {
    /// The underlying client.
    pub fn client(&self) -> &Client {
        &self.conn.client
    }
}

impl std::fmt::Debug for PooledPgConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledPgConn")
            .field("age", &self.conn.created.elapsed())
            .finish_non_exhaustive()
    }
}

/// Bounded pool of live server connections.
pub struct PostgresConnectionPool {
    inner: Arc<PgPoolInner>,
    keepalive: StdMutex<Option<JoinHandle<()>>>,
}

impl PostgresConnectionPool {
    /// Creates the pool, eagerly opening `min_size` connections so that a
    /// bad target or credentials fail here.
    pub async fn new(config: PgPoolConfig) -> DbResult<Self> {
        let inner = Arc::new(PgPoolInner {
            semaphore: Arc::new(Semaphore::new(config.max_size)),
            idle: Mutex::new(VecDeque::new()),
            config,
        });
        for _ in 0..inner.config.min_size {
            let conn = connect(&inner.config.conn_str).await?;
            inner.idle.lock().await.push_back(IdleEntry {
                conn,
                idle_since: Instant::now(),
            });
        }
        let pool = Self {
            keepalive: StdMutex::new(None),
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
    pub async fn acquire(&self) -> DbResult<PooledPgConn> {
        self.acquire_timeout(self.inner.config.acquire_timeout).await
    }

    /// Acquires a connection, blocking up to `timeout`. Idle connections
    /// are verified before being handed out; broken ones are discarded
    /// and replaced.
    pub async fn acquire_timeout(&self, timeout: Duration) -> DbResult<PooledPgConn> {
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

        loop {
            let idle = self.inner.idle.lock().await.pop_front();
            match idle {
                Some(entry) => {
                    if verify(&entry.conn.client).await {
                        return Ok(PooledPgConn {
                            conn: entry.conn,
                            _permit: permit,
                        });
                    }
                    debug!("discarding broken pooled connection");
                }
                None => {
                    let conn = connect(&self.inner.config.conn_str).await?;
                    return Ok(PooledPgConn {
                        conn,
                        _permit: permit,
                    });
                }
            }
        }
    }

    /// Returns a connection to the pool, clearing residual transaction
    /// state first. Connections that fail the round-trip or have outlived
    /// `max_lifetime` are closed instead.
    pub async fn release(&self, pooled: PooledPgConn) {
        let PooledPgConn { conn, _permit } = pooled;
        if let Err(err) = conn.client.batch_execute("ROLLBACK").await {
            // ROLLBACK outside a transaction only warns; a hard error
            // means the connection is unusable.
            debug!(%err, "closing connection on release");
            return;
        }
        if conn.created.elapsed() < self.inner.config.max_lifetime && verify(&conn.client).await {
            self.inner.idle.lock().await.push_back(IdleEntry {
                conn,
                idle_since: Instant::now(),
            });
        } else {
            debug!("closing connection on release");
        }
    }

    fn start_keepalive(&self) {
        let weak = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(10));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                keepalive_sweep(&inner).await;
            }
        });
        *self.keepalive.lock().expect("keepalive mutex") = Some(handle);
    }

    /// Stops the keep-alive task and closes every idle connection.
    pub async fn close(&self) {
        if let Some(handle) = self.keepalive.lock().expect("keepalive mutex").take() {
            handle.abort();
        }
        self.inner.semaphore.close();
        self.inner.idle.lock().await.clear();
    }
}

impl std::fmt::Debug for PostgresConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresConnectionPool")
            .field("max_size", &self.inner.config.max_size)
            .finish_non_exhaustive()
    }
}

async fn keepalive_sweep(inner: &PgPoolInner) {
    let mut idle = inner.idle.lock().await;
    let initial = idle.len();
    let mut kept = VecDeque::with_capacity(initial);
    while let Some(entry) = idle.pop_front() {
        let stale = entry.conn.created.elapsed() > inner.config.max_lifetime
            || entry.idle_since.elapsed() > inner.config.max_idle;
        if !stale && verify(&entry.conn.client).await {
            kept.push_back(entry);
        }
    }
    if kept.len() < initial {
        debug!(lost = initial - kept.len(), "retired connections during keep-alive");
    }

    let in_use = inner.config.max_size - inner.semaphore.available_permits();
    while kept.len() + in_use < inner.config.min_size {
        match connect(&inner.config.conn_str).await {
            Ok(conn) => kept.push_back(IdleEntry {
                conn,
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
