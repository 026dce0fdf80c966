//! Durable, id-ordered storage for protocol records.
//!
//! A [`Log`] is a set of scopes. Each scope is selected by a byte prefix and
//! holds at most one record per id, iterated in ascending id order. The
//! acceptor keeps its promises in one scope and its accepted proposals in
//! another; the observer keeps learned values in a third.

#[cfg(test)]
mod conformance;
#[cfg(test)]
pub(crate) mod failing;
mod kv;
mod memory;

pub use kv::FjallLog;
pub use memory::MemoryLog;

use error_stack::{Report, ResultExt};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::LogError;

const STORAGE_VERSION: u8 = 1;

/// A message that can be stored in a [`Log`].
///
/// `KIND` is written next to the payload so a scope holding one message
/// type is never decoded as another.
pub trait Record: Serialize + DeserializeOwned {
    const KIND: u8;
}

pub trait Log: Clone + Send + Sync + 'static {
    /// A view of this log whose keys are scoped under `prefix`.
    ///
    /// Views share storage with the log they came from. Calling
    /// `with_prefix` on a view nests the prefixes.
    #[must_use]
    fn with_prefix(&self, prefix: impl AsRef<[u8]>) -> Self;

    /// Store `msg` under `id`.
    ///
    /// Recording an id that is already present is a no-op and leaves the
    /// original record in place.
    ///
    /// # Errors
    ///
    /// Fails if the record cannot be encoded or the write cannot be made
    /// durable.
    fn record<T: Record>(&self, id: u64, msg: &T) -> Result<(), Report<LogError>>;

    /// The record with the greatest id in this scope, if any.
    ///
    /// # Errors
    ///
    /// Fails if the storage cannot be read or the record does not decode
    /// as `T`.
    fn last<T: Record>(&self) -> Result<Option<T>, Report<LogError>>;

    /// Call `f` for every record with `start <= id <= stop`, ascending.
    ///
    /// Iteration stops at the first error returned by `f`.
    ///
    /// # Errors
    ///
    /// Fails if the storage cannot be read, a record does not decode, or
    /// `f` fails.
    fn range<T, F>(&self, start: u64, stop: u64, f: F) -> Result<(), Report<LogError>>
    where
        T: Record,
        F: FnMut(T) -> Result<(), Report<LogError>>;
}

fn encode<T: Record>(msg: &T) -> Result<Vec<u8>, Report<LogError>> {
    let payload = postcard::to_allocvec(msg)
        .change_context(LogError)
        .attach("failed to encode record")?;
    let mut out = Vec::with_capacity(2 + payload.len());
    out.push(STORAGE_VERSION);
    out.push(T::KIND);
    out.extend_from_slice(&payload);
    Ok(out)
}

fn decode<T: Record>(bytes: &[u8]) -> Result<T, Report<LogError>> {
    let [version, kind, payload @ ..] = bytes else {
        return Err(Report::new(LogError).attach("record is truncated"));
    };
    if *version != STORAGE_VERSION {
        return Err(Report::new(LogError)
            .attach(format!("unsupported storage version {version}")));
    }
    if *kind != T::KIND {
        return Err(Report::new(LogError).attach(format!(
            "record kind {kind} does not match expected kind {}",
            T::KIND
        )));
    }
    postcard::from_bytes(payload)
        .change_context(LogError)
        .attach("failed to decode record")
}
