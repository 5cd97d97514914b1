//! Shared access to the SQLite database: one writer, pooled readers.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use gubae_store::Database;

use crate::error::{ChatError, ChatResult};

/// Idle read connections kept around for reuse.
const MAX_IDLE_READERS: usize = 8;

/// Cloneable handle to the database shared by every core component.
///
/// Writes go through [`with`](Self::with) and are serialized on a single
/// connection. Reads go through [`read`](Self::read); for a file-backed
/// (WAL) database they run on their own read-only connections and never
/// wait for the writer. An in-memory database has no second connection to
/// offer, so its reads share the writer.
///
/// Locks are held only for the duration of the closure; never hold one
/// across an `.await`.
#[derive(Clone)]
pub struct SharedDatabase {
    writer: Arc<Mutex<Database>>,
    readers: Option<Arc<ReaderPool>>,
}

struct ReaderPool {
    path: PathBuf,
    idle: Mutex<Vec<Database>>,
}

impl ReaderPool {
    fn checkout(&self) -> ChatResult<Database> {
        let pooled = self
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();
        match pooled {
            Some(db) => Ok(db),
            None => Ok(Database::open_reader(&self.path)?),
        }
    }

    fn checkin(&self, db: Database) {
        let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        if idle.len() < MAX_IDLE_READERS {
            idle.push(db);
        }
    }
}

impl SharedDatabase {
    pub fn new(db: Database) -> Self {
        let readers = db.path().map(|path| {
            Arc::new(ReaderPool {
                path,
                idle: Mutex::new(Vec::new()),
            })
        });
        Self {
            writer: Arc::new(Mutex::new(db)),
            readers,
        }
    }

    pub fn open_in_memory() -> ChatResult<Self> {
        Ok(Self::new(Database::open_in_memory()?))
    }

    /// Run `f` with exclusive access to the writable connection.
    pub fn with<T>(
        &self,
        f: impl FnOnce(&mut Database) -> gubae_store::Result<T>,
    ) -> ChatResult<T> {
        let mut guard = self
            .writer
            .lock()
            .map_err(|_| ChatError::Internal("database lock poisoned".into()))?;
        f(&mut guard).map_err(ChatError::from)
    }

    /// Run a read-only `f` against the last committed state.
    pub fn read<T>(&self, f: impl FnOnce(&Database) -> gubae_store::Result<T>) -> ChatResult<T> {
        let Some(pool) = &self.readers else {
            return self.with(|db| f(db));
        };
        let db = pool.checkout()?;
        let result = f(&db);
        pool.checkin(db);
        result.map_err(ChatError::from)
    }
}
