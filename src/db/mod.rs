//! SQLite persistence shared by the policy store, key registry and the
//! firehose cursor.
//!
//! A single [`Connection`] sits behind one mutex.  Every public operation
//! takes the lock for the duration of its statement(s) only, so callers never
//! observe a half-applied mutation.

pub mod cursor;
pub mod known_dids;
pub mod pubkeys;
pub mod schema;

use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::Connection;
use thiserror::Error;

pub use known_dids::{check_did, is_valid_did};
pub use pubkeys::{check_public_key, PublicKey};

/// Failures of the persistent store.  Distinct from a negative decision.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(#[from] rusqlite::Error),
    #[error("store lock poisoned")]
    Poisoned,
    #[error("policy domain must not be empty")]
    EmptyDomain,
    #[error("invalid repo {0:?}: expected did:<...>/<name>")]
    InvalidRepo(String),
    #[error("invalid DID {0:?}")]
    InvalidDid(String),
    #[error("invalid SSH public key: expected one \"<algorithm> <base64> [comment]\" line")]
    InvalidKey,
}

/// Handle to the node database.  Cheap to clone.
#[derive(Clone)]
pub struct Db {
    conn: Arc<Mutex<Connection>>,
}

impl Db {
    /// Open or create the database at `path`, creating parent directories.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            // Best effort: a missing parent surfaces as an open error below.
            let _ = std::fs::create_dir_all(parent);
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA busy_timeout = 5000;")?;
        schema::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory database (for testing)
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        schema::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` with exclusive access to the connection.
    pub(crate) fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> rusqlite::Result<T>,
    ) -> Result<T, StoreError> {
        let mut conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(f(&mut conn)?)
    }

    /// Cheap liveness check used by the health endpoint.
    pub fn ping(&self) -> Result<(), StoreError> {
        self.with_conn(|conn| conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0)))?;
        Ok(())
    }
}
