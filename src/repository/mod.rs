//! Store: the shared persistence layer.
//!
//! Each worker owns one `Store` handle (its own connection); the supervisor
//! owns another. All SQL is hand-written and goes through the per-connection
//! prepared-statement cache, so a reconnect implicitly re-prepares every
//! statement. Multi-row selection and insertion windows run inside
//! `BEGIN IMMEDIATE` transactions whose guard rolls back on drop.

mod configs;
mod content;
mod log;
mod queries;
mod schema;
mod targets;
mod threads;
mod urls;
mod url_lists;
mod websites;

pub use self::configs::parse_config_entries;
pub use self::targets::TargetKind;
pub use self::urls::{LinkChunkOutcome, MAX_URL_LENGTH};

use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::{Connection, Transaction, TransactionBehavior};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("{0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, RepositoryError>;

/// Create a database connection with the settings every handle relies on.
fn connect(db_path: &Path) -> rusqlite::Result<Connection> {
    let conn = Connection::open(db_path)?;

    // WAL allows concurrent readers while one worker writes; the busy
    // timeout stands in for the session lock wait of a networked server.
    conn.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA foreign_keys = ON;
        PRAGMA busy_timeout = 600000;
    "#,
    )?;

    Ok(conn)
}

fn is_connection_error(error: &rusqlite::Error) -> bool {
    use rusqlite::ErrorCode::*;
    matches!(
        error,
        rusqlite::Error::SqliteFailure(e, _) if matches!(
            e.code,
            CannotOpen | NotADatabase | DatabaseCorrupt | SystemIoFailure | OperationInterrupted
        )
    )
}

/// The physical table names of one URL list.
#[derive(Debug, Clone)]
pub struct ListTables {
    pub urls: String,
    pub crawled: String,
    pub links: String,
}

impl ListTables {
    pub fn new(website_ns: &str, list_ns: &str) -> Self {
        let urls = format!("{website_ns}_{list_ns}");
        Self {
            crawled: format!("{urls}_crawled"),
            links: format!("{urls}_links"),
            urls,
        }
    }
}

/// A handle to the shared store. Not shared between threads; every worker
/// opens its own.
pub struct Store {
    db_path: PathBuf,
    conn: Connection,
    sleep_on_error: Duration,
}

impl Store {
    /// Open a handle. The global schema must already exist (see
    /// [`Store::init_schema`], called once by the supervisor).
    pub fn open(db_path: &Path) -> Result<Self> {
        Ok(Self {
            db_path: db_path.to_path_buf(),
            conn: connect(db_path)?,
            sleep_on_error: Duration::from_secs(5),
        })
    }

    /// Backoff before the second reconnect attempt after a driver error.
    pub fn set_sleep_on_error(&mut self, sleep: Duration) {
        self.sleep_on_error = sleep;
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Re-open the underlying connection. A fresh connection carries a fresh
    /// prepared-statement cache, so every statement is re-prepared on next use.
    fn reconnect(&mut self) -> Result<()> {
        match connect(&self.db_path) {
            Ok(conn) => {
                self.conn = conn;
                Ok(())
            }
            Err(first) => {
                tracing::warn!(error = %first, "database reconnect failed, retrying");
                std::thread::sleep(self.sleep_on_error);
                self.conn = connect(&self.db_path)?;
                Ok(())
            }
        }
    }

    /// Run an operation, reconnecting and retrying once if the connection
    /// itself turns out to be broken.
    pub(crate) fn with_conn<T>(
        &mut self,
        op: impl Fn(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T> {
        match op(&self.conn) {
            Ok(value) => Ok(value),
            Err(error) if is_connection_error(&error) => {
                tracing::warn!(error = %error, "database connection lost, reconnecting");
                self.reconnect()?;
                Ok(op(&self.conn)?)
            }
            Err(error) => Err(error.into()),
        }
    }

    /// Begin a table-lock window. The returned transaction rolls back on drop
    /// unless committed, so an error cannot leave the lock held.
    pub(crate) fn lock_window(&mut self) -> Result<Transaction<'_>> {
        Ok(self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?)
    }

    /// Reset the auto-increment counter of a table iff it is empty.
    pub(crate) fn reset_auto_increment_if_empty(conn: &Connection, table: &str) -> rusqlite::Result<()> {
        let count: i64 =
            conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))?;
        if count == 0 {
            conn.execute("DELETE FROM sqlite_sequence WHERE name = ?1", [table])?;
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// A store over a scratch database with the global schema in place.
    pub fn scratch_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let mut store = Store::open(&dir.path().join("webacquire.sqlite3")).unwrap();
        store.init_schema().unwrap();
        (dir, store)
    }
}
