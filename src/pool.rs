//! Per-thread SQLite connections
//!
//! Each thread that touches the store gets its own connection, opened on
//! first use and kept until the thread calls `close`, the thread exits, or
//! the pool is dropped.
//! Connections are never shared between threads; SQLite serializes writes
//! from the different connections on the file itself.

use crate::config::Settings;
use crate::error::Result;
use dashmap::DashMap;
use parking_lot::Mutex;
use rusqlite::Connection;
use std::cell::RefCell;
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};

type ConnectionMap = DashMap<ThreadId, Arc<Mutex<Connection>>>;

/// Removes the owning thread's connection from a pool when the thread exits
struct ExitGuard {
    connections: Weak<ConnectionMap>,
    thread: ThreadId,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        if let Some(connections) = self.connections.upgrade() {
            if connections.remove(&self.thread).is_some() {
                tracing::debug!(thread = ?self.thread, "closed connection of exited thread");
            }
        }
    }
}

thread_local! {
    static EXIT_GUARDS: RefCell<Vec<ExitGuard>> = const { RefCell::new(Vec::new()) };
}

/// Arrange for this thread's entry in `connections` to go when the thread does
fn register_exit_guard(connections: &Arc<ConnectionMap>) {
    let weak = Arc::downgrade(connections);
    let thread = thread::current().id();
    let _ = EXIT_GUARDS.try_with(|guards| {
        let mut guards = guards.borrow_mut();
        guards.retain(|guard| guard.connections.strong_count() > 0);
        if !guards.iter().any(|guard| guard.connections.ptr_eq(&weak)) {
            guards.push(ExitGuard {
                connections: weak,
                thread,
            });
        }
    });
}

/// Schema shared by the trace and annotation stores
pub(crate) const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS traces (
    id TEXT PRIMARY KEY,
    input TEXT NOT NULL,
    output TEXT NOT NULL,
    context TEXT,
    timestamp TEXT NOT NULL,
    duration_ms REAL,
    status TEXT NOT NULL DEFAULT 'success' CHECK (status IN ('success', 'error')),
    error TEXT,
    metadata TEXT,
    CHECK ((status = 'error') = (error IS NOT NULL))
);

CREATE INDEX IF NOT EXISTS idx_traces_timestamp ON traces(timestamp DESC);
CREATE INDEX IF NOT EXISTS idx_traces_status ON traces(status);

CREATE TABLE IF NOT EXISTS annotations (
    id TEXT PRIMARY KEY,
    trace_id TEXT NOT NULL,
    judgment TEXT NOT NULL CHECK (judgment IN ('pass', 'fail')),
    critique TEXT NOT NULL,
    tags TEXT NOT NULL DEFAULT '[]',
    annotator TEXT NOT NULL DEFAULT 'default',
    timestamp TEXT NOT NULL,
    metadata TEXT
);

CREATE INDEX IF NOT EXISTS idx_annotations_trace_id ON annotations(trace_id);
CREATE INDEX IF NOT EXISTS idx_annotations_judgment ON annotations(judgment);
CREATE INDEX IF NOT EXISTS idx_annotations_annotator ON annotations(annotator);
CREATE INDEX IF NOT EXISTS idx_annotations_timestamp ON annotations(timestamp DESC);
"#;

/// Connection-per-thread pool over one database file
pub struct ConnectionPool {
    settings: Settings,
    connections: Arc<ConnectionMap>,
}

impl ConnectionPool {
    /// Create a pool; no connection is opened until first use
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            connections: Arc::new(DashMap::new()),
        }
    }

    /// Settings the pool opens connections with
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Run `f` with the calling thread's connection
    pub fn with_connection<R>(&self, f: impl FnOnce(&mut Connection) -> Result<R>) -> Result<R> {
        let conn = self.thread_connection()?;
        let mut guard = conn.lock();
        f(&mut guard)
    }

    /// Drop the calling thread's connection
    ///
    /// Returns whether a connection was open. The next call on this thread
    /// opens a new one.
    pub fn close(&self) -> bool {
        let closed = self.connections.remove(&thread::current().id()).is_some();
        if closed {
            tracing::debug!(db_path = %self.settings.db_path.display(), "closed thread connection");
        }
        closed
    }

    /// Drop every connection in the pool
    pub fn close_all(&self) -> usize {
        let count = self.connections.len();
        self.connections.clear();
        count
    }

    /// Number of threads currently holding a connection
    pub fn open_connections(&self) -> usize {
        self.connections.len()
    }

    fn thread_connection(&self) -> Result<Arc<Mutex<Connection>>> {
        let id = thread::current().id();
        if let Some(conn) = self.connections.get(&id) {
            return Ok(Arc::clone(conn.value()));
        }

        // Opened outside the map entry so a slow open never blocks other threads' lookups
        let conn = Arc::new(Mutex::new(self.open()?));
        let conn = Arc::clone(self.connections.entry(id).or_insert(conn).value());
        register_exit_guard(&self.connections);
        Ok(conn)
    }

    fn open(&self) -> Result<Connection> {
        let conn = Connection::open(&self.settings.db_path)?;
        conn.busy_timeout(self.settings.busy_timeout())?;
        if self.settings.wal {
            conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        }
        conn.execute_batch(SCHEMA)?;

        tracing::debug!(
            db_path = %self.settings.db_path.display(),
            thread = ?thread::current().id(),
            "opened thread connection"
        );
        Ok(conn)
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        let closed = self.close_all();
        if closed > 0 {
            tracing::debug!(closed, "connection pool dropped");
        }
    }
}
