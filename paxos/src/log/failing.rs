//! A [`Log`] whose writes can be made to fail.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use error_stack::Report;

use super::{Log, MemoryLog, Record};
use crate::error::LogError;

#[derive(Clone, Default)]
pub(crate) struct FailingLog {
    inner: MemoryLog,
    fail_writes: Arc<AtomicBool>,
}

impl FailingLog {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

impl Log for FailingLog {
    fn with_prefix(&self, prefix: impl AsRef<[u8]>) -> Self {
        Self {
            inner: self.inner.with_prefix(prefix),
            fail_writes: self.fail_writes.clone(),
        }
    }

    fn record<T: Record>(&self, id: u64, msg: &T) -> Result<(), Report<LogError>> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Report::new(LogError).attach("disk full"));
        }
        self.inner.record(id, msg)
    }

    fn last<T: Record>(&self) -> Result<Option<T>, Report<LogError>> {
        self.inner.last()
    }

    fn range<T, F>(&self, start: u64, stop: u64, f: F) -> Result<(), Report<LogError>>
    where
        T: Record,
        F: FnMut(T) -> Result<(), Report<LogError>>,
    {
        self.inner.range(start, stop, f)
    }
}
