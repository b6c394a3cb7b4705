//! Database connections.
//!
//! Rule lookups run on adapter threads in the middle of a transfer, while
//! verdict logging and blob writes run on a writer task. A file database
//! therefore gets two connections: a read-only one for lookups and a writer.
//! With WAL, lookups never wait on an open write. An in-memory database has a
//! single connection, since every in-memory connection is its own database.

use rusqlite::{Connection, OpenFlags};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{Result, StorageError};
use crate::schema::run_migrations;

/// Thread-safe pair of SQLite connections.
#[derive(Clone)]
pub struct ConnectionPool {
    writer: Arc<Mutex<Connection>>,
    reader: Option<Arc<Mutex<Connection>>>,
}

impl ConnectionPool {
    /// Opens (creating if needed) a file database and migrates it.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let writer = Connection::open(path)?;
        configure(&writer)?;
        writer.execute_batch("PRAGMA foreign_keys = ON; PRAGMA synchronous = NORMAL;")?;
        run_migrations(&writer)?;

        let reader = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        configure(&reader)?;

        Ok(Self {
            writer: Arc::new(Mutex::new(writer)),
            reader: Some(Arc::new(Mutex::new(reader))),
        })
    }

    /// Opens a migrated in-memory database.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        run_migrations(&conn)?;

        Ok(Self {
            writer: Arc::new(Mutex::new(conn)),
            reader: None,
        })
    }

    /// Borrows the writer connection.
    pub fn get(&self) -> Result<PooledConnection<'_>> {
        lock(&self.writer)
    }

    /// Borrows a connection for lookups. Writes through it fail.
    pub fn read(&self) -> Result<PooledConnection<'_>> {
        lock(self.reader.as_ref().unwrap_or(&self.writer))
    }

    /// Returns true if lookups use their own connection.
    pub fn has_separate_reader(&self) -> bool {
        self.reader.is_some()
    }
}

fn configure(conn: &Connection) -> Result<()> {
    // The journal mode is stored in the file; the reader finds WAL already set.
    let mode: String = conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))?;
    if !mode.eq_ignore_ascii_case("wal") {
        conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get::<_, String>(0))?;
    }
    conn.busy_timeout(std::time::Duration::from_millis(1000))?;
    Ok(())
}

fn lock(conn: &Mutex<Connection>) -> Result<PooledConnection<'_>> {
    let guard = conn
        .lock()
        .map_err(|_| StorageError::Config("Connection pool poisoned".to_string()))?;
    Ok(PooledConnection { guard })
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("separate_reader", &self.has_separate_reader())
            .finish_non_exhaustive()
    }
}

/// A connection borrowed from the pool.
pub struct PooledConnection<'a> {
    guard: MutexGuard<'a, Connection>,
}

impl std::ops::Deref for PooledConnection<'_> {
    type Target = Connection;

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}
