//! `DuckDB` connection pool.
//!
//! The database is opened once; pooled connections are clones of the root
//! connection, so every connection sees the same database instance.

use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use ::duckdb::Connection;

/// Where the database lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DbLocation {
    File(PathBuf),
    InMemory,
}

struct PoolInner {
    location: DbLocation,
    max_pool_size: usize,
    root: Mutex<Connection>,
    idle: Mutex<Vec<Connection>>,
}

#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Opens the database and keeps up to `max_pool_size` idle connections.
    ///
    /// # Errors
    /// Returns an error if the database cannot be opened or configured.
    pub fn open(location: DbLocation, max_pool_size: usize) -> Result<Self, ::duckdb::Error> {
        let root = match &location {
            DbLocation::File(path) => Connection::open(path)?,
            DbLocation::InMemory => Connection::open_in_memory()?,
        };
        configure_connection(&root)?;

        Ok(Self {
            inner: Arc::new(PoolInner {
                location,
                max_pool_size: max_pool_size.max(1),
                root: Mutex::new(root),
                idle: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Takes an idle connection or clones a new one from the root.
    ///
    /// # Errors
    /// Returns an error if a new connection cannot be created or configured.
    ///
    /// # Panics
    /// Panics if a pool mutex is poisoned.
    pub fn acquire(&self) -> Result<PooledConnection, ::duckdb::Error> {
        let idle = self
            .inner
            .idle
            .lock()
            .expect("duckdb connection pool mutex poisoned")
            .pop();

        let connection = match idle {
            Some(connection) => connection,
            None => {
                let connection = self
                    .inner
                    .root
                    .lock()
                    .expect("duckdb root connection mutex poisoned")
                    .try_clone()?;
                configure_connection(&connection)?;
                connection
            }
        };

        Ok(PooledConnection {
            pool: Arc::clone(&self.inner),
            connection: Some(connection),
        })
    }

    /// Path of the database file, if it is file-backed.
    #[must_use]
    pub fn db_path(&self) -> Option<&Path> {
        match &self.inner.location {
            DbLocation::File(path) => Some(path.as_path()),
            DbLocation::InMemory => None,
        }
    }

    pub fn idle_connections(&self) -> usize {
        self.inner
            .idle
            .lock()
            .expect("duckdb connection pool mutex poisoned")
            .len()
    }
}

/// A pooled connection that returns to the pool when dropped.
pub struct PooledConnection {
    pool: Arc<PoolInner>,
    connection: Option<Connection>,
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Self::Target {
        self.connection
            .as_ref()
            .expect("pooled connection unexpectedly missing")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.connection
            .as_mut()
            .expect("pooled connection unexpectedly missing")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let Some(connection) = self.connection.take() else {
            return;
        };

        let mut idle = self
            .pool
            .idle
            .lock()
            .expect("duckdb connection pool mutex poisoned");
        if idle.len() < self.pool.max_pool_size {
            idle.push(connection);
        }
    }
}

fn configure_connection(connection: &Connection) -> Result<(), ::duckdb::Error> {
    connection.execute_batch("PRAGMA disable_progress_bar;")
}
