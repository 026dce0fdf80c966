use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use error_stack::{Report, ResultExt};
use fjall::{Database, Keyspace, KeyspaceCreateOptions, PersistMode};

use super::{Log, Record, decode, encode};
use crate::error::LogError;

const KEYSPACE: &str = "paxos_log";

/// A [`Log`] persisted in a fjall database.
///
/// Keys are `prefix ++ id.to_be_bytes()`, so the keyspace's natural byte
/// order is id order within a scope. Every write is synced before
/// [`Log::record`] returns.
#[derive(Clone)]
pub struct FjallLog {
    db: Arc<Database>,
    keyspace: Keyspace,
    prefix: Vec<u8>,
    write_lock: Arc<Mutex<()>>,
}

impl FjallLog {
    /// Open (or create) a log stored under `path`.
    ///
    /// # Errors
    ///
    /// Fails if the database or its keyspace cannot be opened.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Report<LogError>> {
        let path = path.as_ref();
        let db = Database::builder(path)
            .open()
            .change_context(LogError)
            .attach_with(|| format!("failed to open database at {}", path.display()))?;
        let keyspace = db
            .keyspace(KEYSPACE, KeyspaceCreateOptions::default)
            .change_context(LogError)
            .attach("failed to open keyspace")?;

        Ok(Self {
            db: Arc::new(db),
            keyspace,
            prefix: Vec::new(),
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    fn key(&self, id: u64) -> Vec<u8> {
        let mut key = Vec::with_capacity(self.prefix.len() + 8);
        key.extend_from_slice(&self.prefix);
        key.extend_from_slice(&id.to_be_bytes());
        key
    }

    /// Keys under a nested prefix share our prefix but are longer.
    fn in_scope(&self, key: &[u8]) -> bool {
        key.len() == self.prefix.len() + 8 && key.starts_with(&self.prefix)
    }
}

impl std::fmt::Debug for FjallLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FjallLog")
            .field("prefix", &String::from_utf8_lossy(&self.prefix))
            .finish_non_exhaustive()
    }
}

impl Log for FjallLog {
    fn with_prefix(&self, prefix: impl AsRef<[u8]>) -> Self {
        let mut nested = self.prefix.clone();
        nested.extend_from_slice(prefix.as_ref());
        Self {
            db: self.db.clone(),
            keyspace: self.keyspace.clone(),
            prefix: nested,
            write_lock: self.write_lock.clone(),
        }
    }

    fn record<T: Record>(&self, id: u64, msg: &T) -> Result<(), Report<LogError>> {
        let key = self.key(id);
        let bytes = encode(msg)?;

        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let existing = self
            .keyspace
            .get(key.as_slice())
            .change_context(LogError)
            .attach("failed to read existing record")?;
        if existing.is_some() {
            return Ok(());
        }

        self.keyspace
            .insert(key.as_slice(), bytes.as_slice())
            .change_context(LogError)
            .attach("failed to write record")?;
        self.db
            .persist(PersistMode::SyncAll)
            .change_context(LogError)
            .attach("failed to persist record")?;
        Ok(())
    }

    fn last<T: Record>(&self) -> Result<Option<T>, Report<LogError>> {
        let lo = self.key(0);
        let hi = self.key(u64::MAX);
        for guard in self.keyspace.range(lo..=hi).rev() {
            let (key, value) = guard
                .into_inner()
                .change_context(LogError)
                .attach("failed to read record")?;
            if self.in_scope(&key) {
                return decode(&value).map(Some);
            }
        }
        Ok(None)
    }

    fn range<T, F>(&self, start: u64, stop: u64, mut f: F) -> Result<(), Report<LogError>>
    where
        T: Record,
        F: FnMut(T) -> Result<(), Report<LogError>>,
    {
        if start > stop {
            return Ok(());
        }

        let lo = self.key(start);
        let hi = self.key(stop);
        for guard in self.keyspace.range(lo..=hi) {
            let (key, value) = guard
                .into_inner()
                .change_context(LogError)
                .attach("failed to read record")?;
            if self.in_scope(&key) {
                f(decode(&value)?)?;
            }
        }
        Ok(())
    }
}
