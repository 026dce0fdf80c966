use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use error_stack::Report;

use super::{Log, Record, decode, encode};
use crate::error::LogError;

/// A [`Log`] held entirely in memory.
///
/// Suitable for tests and for participants that do not need to survive a
/// restart. Clones and prefixed views share the same storage.
#[derive(Clone, Default)]
pub struct MemoryLog {
    scopes: Arc<Mutex<HashMap<Vec<u8>, Entries>>>,
    prefix: Vec<u8>,
}

/// Records of one scope, kept sorted by id.
#[derive(Default)]
struct Entries {
    ids: Vec<u64>,
    msgs: Vec<Vec<u8>>,
}

impl MemoryLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl std::fmt::Debug for MemoryLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryLog")
            .field("prefix", &String::from_utf8_lossy(&self.prefix))
            .finish_non_exhaustive()
    }
}

impl Log for MemoryLog {
    fn with_prefix(&self, prefix: impl AsRef<[u8]>) -> Self {
        let mut nested = self.prefix.clone();
        nested.extend_from_slice(prefix.as_ref());
        Self {
            scopes: self.scopes.clone(),
            prefix: nested,
        }
    }

    fn record<T: Record>(&self, id: u64, msg: &T) -> Result<(), Report<LogError>> {
        let bytes = encode(msg)?;

        let mut scopes = self.scopes.lock().unwrap_or_else(PoisonError::into_inner);
        let entries = scopes.entry(self.prefix.clone()).or_default();
        if let Err(idx) = entries.ids.binary_search(&id) {
            entries.ids.insert(idx, id);
            entries.msgs.insert(idx, bytes);
        }
        Ok(())
    }

    fn last<T: Record>(&self) -> Result<Option<T>, Report<LogError>> {
        let bytes = {
            let scopes = self.scopes.lock().unwrap_or_else(PoisonError::into_inner);
            scopes
                .get(&self.prefix)
                .and_then(|entries| entries.msgs.last().cloned())
        };
        bytes.as_deref().map(decode::<T>).transpose()
    }

    fn range<T, F>(&self, start: u64, stop: u64, mut f: F) -> Result<(), Report<LogError>>
    where
        T: Record,
        F: FnMut(T) -> Result<(), Report<LogError>>,
    {
        if start > stop {
            return Ok(());
        }

        // copy out so `f` can touch the log without deadlocking
        let selected: Vec<Vec<u8>> = {
            let scopes = self.scopes.lock().unwrap_or_else(PoisonError::into_inner);
            let Some(entries) = scopes.get(&self.prefix) else {
                return Ok(());
            };
            let lo = entries.ids.partition_point(|&id| id < start);
            let hi = entries.ids.partition_point(|&id| id <= stop);
            entries.msgs[lo..hi].to_vec()
        };

        for bytes in &selected {
            f(decode(bytes)?)?;
        }
        Ok(())
    }
}
