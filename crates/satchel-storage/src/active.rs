//! Active-session bookkeeping shared by both backends.
//!
//! Each store tracks its live sessions in a bounded set so that the
//! session cap can be enforced and the background monitor can reclaim
//! connections from sessions that outlive their welcome. The set holds
//! weak references: a session that is dropped normally disappears from
//! the set without ceremony.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, Weak};
use std::time::Instant;

use tokio::sync::Mutex as AsyncMutex;

static SESSION_IDS: AtomicU64 = AtomicU64::new(1);

/// Allocates a process-unique session id.
pub(crate) fn next_session_id() -> u64 {
    SESSION_IDS.fetch_add(1, Ordering::Relaxed)
}

/// Connection slot shared between a session and the store's monitor.
///
/// The slot is `None` before enter and after the connection has been
/// released (normally or by force-close). Operations take the connection
/// out for the duration of one call and put it back, holding the async
/// lock across the call so the monitor cannot interleave.
pub(crate) struct SessionState<C> {
    /// The pooled connection, while the session owns one.
    pub conn: AsyncMutex<Option<C>>,
}

impl<C> SessionState<C> {
    pub(crate) fn new(conn: C) -> Self {
        Self {
            conn: AsyncMutex::new(Some(conn)),
        }
    }

    /// Takes the connection out of the slot, if still present.
    pub(crate) async fn take_conn(&self) -> Option<C> {
        self.conn.lock().await.take()
    }
}

struct ActiveEntry<C> {
    id: u64,
    created: Instant,
    state: Weak<SessionState<C>>,
}

/// The store's set of live sessions.
pub(crate) struct ActiveSessions<C> {
    entries: Mutex<Vec<ActiveEntry<C>>>,
}

impl<C> ActiveSessions<C> {
    pub(crate) fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Registers a session under its id.
    pub(crate) fn register(&self, id: u64, state: &std::sync::Arc<SessionState<C>>) {
        let mut entries = self.entries.lock().expect("active session mutex");
        entries.push(ActiveEntry {
            id,
            created: Instant::now(),
            state: std::sync::Arc::downgrade(state),
        });
    }

    /// Removes a session by id.
    pub(crate) fn unregister(&self, id: u64) {
        let mut entries = self.entries.lock().expect("active session mutex");
        entries.retain(|e| e.id != id);
    }

    /// Number of live sessions, pruning ones whose state is gone.
    pub(crate) fn live_count(&self) -> usize {
        let mut entries = self.entries.lock().expect("active session mutex");
        entries.retain(|e| e.state.strong_count() > 0);
        entries.len()
    }

    /// Sessions older than `max_age`, for the monitor to reclaim.
    pub(crate) fn over_age(
        &self,
        max_age: std::time::Duration,
    ) -> Vec<(u64, std::sync::Arc<SessionState<C>>)> {
        let entries = self.entries.lock().expect("active session mutex");
        entries
            .iter()
            .filter(|e| e.created.elapsed() > max_age)
            .filter_map(|e| e.state.upgrade().map(|s| (e.id, s)))
            .collect()
    }

    /// Removes and returns every live session, for store close.
    pub(crate) fn drain(&self) -> Vec<(u64, std::sync::Arc<SessionState<C>>)> {
        let mut entries = self.entries.lock().expect("active session mutex");
        entries
            .drain(..)
            .filter_map(|e| e.state.upgrade().map(|s| (e.id, s)))
            .collect()
    }
}
