//! Transactional SQLite store.
//!
//! A [`Store`] is one database file holding the pipeline, edge, running,
//! log and transfer tables. The active store and the archive store are two
//! instances of the same type. Each handle owns a single connection behind a
//! mutex; separate processes open their own handles on the same file and
//! SQLite's locking (with a busy timeout) serializes their writes.

mod schema;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::errors::{EngineError, EngineResult};

pub(crate) use schema::PIPELINE_COLUMNS;
pub use schema::SCHEMA_VERSION;

/// Default time a writer waits for a competing lock.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Schema name the archive store is attached under during a move.
pub(crate) const ARCHIVE_ALIAS: &str = "archive";

/// A handle on one store file.
pub struct Store {
    path: Option<PathBuf>,
    conn: Mutex<Connection>,
}

impl Store {
    /// Opens (creating if needed) a store file with the default busy timeout.
    pub fn open(path: impl AsRef<Path>) -> EngineResult<Self> {
        Self::open_with_timeout(path, DEFAULT_BUSY_TIMEOUT)
    }

    /// Opens a store file with an explicit busy timeout.
    pub fn open_with_timeout(path: impl AsRef<Path>, busy_timeout: Duration) -> EngineResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(&path)?;
        conn.busy_timeout(busy_timeout)?;
        debug!(path = %path.display(), "Opened store");
        Self::from_connection(conn, Some(path))
    }

    /// Opens a private in-memory store.
    ///
    /// In-memory stores cannot take part in archive moves, which need a file
    /// to attach.
    pub fn open_in_memory() -> EngineResult<Self> {
        Self::from_connection(Connection::open_in_memory()?, None)
    }

    fn from_connection(conn: Connection, path: Option<PathBuf>) -> EngineResult<Self> {
        conn.execute_batch(schema::SCHEMA)?;
        conn.execute(
            "INSERT OR IGNORE INTO meta(key, value) VALUES (?1, ?2)",
            params!["schema_version", SCHEMA_VERSION],
        )?;
        Ok(Self {
            path,
            conn: Mutex::new(conn),
        })
    }

    /// Returns the store file, or `None` for in-memory stores.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Returns the schema version recorded in the store.
    pub fn schema_version(&self) -> EngineResult<Option<String>> {
        self.read(|conn| {
            Ok(conn
                .query_row(
                    "SELECT value FROM meta WHERE key = 'schema_version'",
                    [],
                    |row| row.get(0),
                )
                .optional()?)
        })
    }

    /// Runs `f` inside a read transaction, giving it a consistent snapshot.
    pub fn read<T>(&self, f: impl FnOnce(&Connection) -> EngineResult<T>) -> EngineResult<T> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Deferred)?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    /// Runs `f` inside an immediate write transaction.
    ///
    /// The transaction commits when `f` returns `Ok` and rolls back otherwise,
    /// so a failed operation leaves no partial effect.
    pub fn write<T>(&self, f: impl FnOnce(&Connection) -> EngineResult<T>) -> EngineResult<T> {
        let mut conn = self.conn.lock();
        run_immediate(&mut conn, f)
    }

    /// Runs `f` in one write transaction spanning this store and `other`.
    ///
    /// `other` is attached under [`ARCHIVE_ALIAS`] for the duration of the
    /// call, so `f` addresses its tables as `archive.<table>`.
    pub(crate) fn write_attached<T>(
        &self,
        other: &Self,
        f: impl FnOnce(&Connection) -> EngineResult<T>,
    ) -> EngineResult<T> {
        let (Some(own_path), Some(other_path)) = (self.path(), other.path()) else {
            return Err(EngineError::configuration(
                "archive moves require file-backed active and archive stores",
            ));
        };
        if own_path == other_path {
            return Err(EngineError::configuration(
                "active and archive stores must be different files",
            ));
        }

        let mut conn = self.conn.lock();
        conn.execute(
            &format!("ATTACH DATABASE ?1 AS {ARCHIVE_ALIAS}"),
            params![other_path.to_string_lossy()],
        )?;
        let result = run_immediate(&mut conn, f);
        let detached = conn.execute_batch(&format!("DETACH DATABASE {ARCHIVE_ALIAS}"));
        let out = result?;
        detached?;
        Ok(out)
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").field("path", &self.path).finish()
    }
}

fn run_immediate<T>(
    conn: &mut Connection,
    f: impl FnOnce(&Connection) -> EngineResult<T>,
) -> EngineResult<T> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let out = f(&tx)?;
    tx.commit()?;
    Ok(out)
}
