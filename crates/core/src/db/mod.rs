//! SQLite storage for the shelfsync catalog.
//!
//! One [`Database`] backs both the [`CatalogStore`](crate::catalog::CatalogStore)
//! the sync engine writes to and the
//! [`SettingsStore`](crate::settings::SettingsStore) the scheduler persists
//! its interval in. The schema lives in [`schema`]; typed queries in
//! [`queries`].

pub mod queries;
pub mod schema;

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::Connection;
use tracing::{debug, info, warn};

use crate::errors::DatabaseError;

/// How long a writer waits for a competing lock before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Catalog database handle.
///
/// The connection sits behind a `Mutex` so one handle can be shared as
/// `Arc<Database>` between the engine, the scheduler and the web layer.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) the catalog at `path`, creating missing parent
    /// directories. The schema is not touched until
    /// [`initialize`](Self::initialize).
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DatabaseError> {
        let path = path.as_ref();
        info!(path = %path.display(), "opening catalog database");

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        configure(&conn)?;
        debug!("catalog database opened in WAL mode");

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory catalog for tests and dry runs.
    pub fn in_memory() -> Result<Self, DatabaseError> {
        let conn = Connection::open_in_memory()?;
        configure(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open the catalog at `path` and bring its schema up to date.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, DatabaseError> {
        let db = Self::new(path)?;
        db.initialize()?;
        Ok(db)
    }

    /// Apply pending schema migrations.
    pub fn initialize(&self) -> Result<(), DatabaseError> {
        schema::run_migrations(&self.conn())
    }

    /// Lock the connection. A poisoned lock is recovered: every query runs
    /// in a single statement, so a panicking holder cannot leave partial
    /// writes behind.
    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| {
            warn!("catalog database mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }
}

fn configure(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    Ok(())
}
