//! `DuckDB` connection pool.
//!
//! Collection workers for different datasets share one store, so connections
//! are recycled through a small mutexed free-list instead of being reopened
//! per statement. Every handle is a clone of one canonical connection, so
//! all of them address the same database instance and a write committed
//! through one handle is visible to reads through any other. A [`PoolHandle`]
//! returns its connection to the pool on drop.

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use ::duckdb::Connection;

/// Access mode requested for a pooled connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    ReadOnly,
    ReadWrite,
}

struct FreeLists {
    read_only: VecDeque<Connection>,
    read_write: VecDeque<Connection>,
}

struct PoolShared {
    db_path: PathBuf,
    max_idle: usize,
    /// Canonical connection all handles are cloned from. Never handed out;
    /// opened lazily on the first checkout.
    root: Mutex<Option<Connection>>,
    free: Mutex<FreeLists>,
}

/// Pool of `DuckDB` connections to a single database file.
#[derive(Clone)]
pub struct ConnectionPool {
    shared: Arc<PoolShared>,
}

impl ConnectionPool {
    /// Create a pool for the given database file, keeping at most `max_idle`
    /// idle connections per access mode.
    #[must_use]
    pub fn new(db_path: impl Into<PathBuf>, max_idle: usize) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                db_path: db_path.into(),
                max_idle: max_idle.max(1),
                root: Mutex::new(None),
                free: Mutex::new(FreeLists {
                    read_only: VecDeque::new(),
                    read_write: VecDeque::new(),
                }),
            }),
        }
    }

    /// Check out a connection, cloning a fresh one off the canonical
    /// connection when the free-list is empty.
    ///
    /// # Errors
    /// Returns an error if the database file cannot be opened or configured.
    pub fn checkout(&self, mode: AccessMode) -> Result<PoolHandle, ::duckdb::Error> {
        let recycled = {
            let mut free = self
                .shared
                .free
                .lock()
                .expect("connection pool mutex poisoned");
            match mode {
                AccessMode::ReadOnly => free.read_only.pop_front(),
                AccessMode::ReadWrite => free.read_write.pop_front(),
            }
        };

        let connection = match recycled {
            Some(connection) => connection,
            None => self.clone_root(mode)?,
        };

        Ok(PoolHandle {
            mode,
            shared: Arc::clone(&self.shared),
            connection: Some(connection),
        })
    }

    #[must_use]
    pub fn db_path(&self) -> &Path {
        self.shared.db_path.as_path()
    }

    /// Mint a new handle off the canonical connection. A plain
    /// `Connection::open` here would create a second database instance that
    /// never sees writes committed through the first one.
    fn clone_root(&self, mode: AccessMode) -> Result<Connection, ::duckdb::Error> {
        let mut root = self
            .shared
            .root
            .lock()
            .expect("connection pool mutex poisoned");
        if root.is_none() {
            *root = Some(Connection::open(self.shared.db_path.as_path())?);
        }
        let connection = root
            .as_ref()
            .expect("root connection opened above")
            .try_clone()?;
        configure_connection(&connection, mode)?;
        Ok(connection)
    }
}

/// A checked-out connection. Dereferences to [`Connection`] and returns to
/// the pool when dropped.
pub struct PoolHandle {
    mode: AccessMode,
    shared: Arc<PoolShared>,
    connection: Option<Connection>,
}

impl Deref for PoolHandle {
    type Target = Connection;

    fn deref(&self) -> &Self::Target {
        self.connection
            .as_ref()
            .expect("pool handle missing its connection")
    }
}

impl DerefMut for PoolHandle {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.connection
            .as_mut()
            .expect("pool handle missing its connection")
    }
}

impl Drop for PoolHandle {
    fn drop(&mut self) {
        let Some(connection) = self.connection.take() else {
            return;
        };

        let mut free = self
            .shared
            .free
            .lock()
            .expect("connection pool mutex poisoned");
        let list = match self.mode {
            AccessMode::ReadOnly => &mut free.read_only,
            AccessMode::ReadWrite => &mut free.read_write,
        };
        if list.len() < self.shared.max_idle {
            list.push_back(connection);
        }
    }
}

fn configure_connection(
    connection: &Connection,
    mode: AccessMode,
) -> Result<(), ::duckdb::Error> {
    connection.execute_batch("PRAGMA disable_progress_bar;")?;
    if mode == AccessMode::ReadOnly {
        // Can fail on older embedded engines; the query layer never issues
        // writes over read-only handles anyway.
        let _ = connection.execute_batch("SET access_mode = 'READ_ONLY';");
    }
    Ok(())
}
