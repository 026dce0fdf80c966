//! Paxos protocol messages

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::log::Record;

/// Sent by proposers during Prepare and by observers when opening an Observe
/// stream.
///
/// For Prepare, `id` is the round being prepared and `attempt` the proposer's
/// local retry count. For Observe, `id` is the newest id the caller has
/// already learned and `attempt` is unused.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub attempt: u64,
}

impl Request {
    #[must_use]
    pub fn prepare(id: u64, attempt: u64) -> Self {
        Self { id, attempt }
    }

    /// Resume an Observe stream from `id` (inclusive).
    #[must_use]
    pub fn observe(id: u64) -> Self {
        Self { id, attempt: 0 }
    }
}

/// A value bound to a round id.
///
/// The zero proposal (`id == 0`) is how acceptors reject an Accept.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Proposal {
    pub id: u64,
    pub value: Bytes,
}

impl Proposal {
    #[must_use]
    pub fn new(id: u64, value: impl Into<Bytes>) -> Self {
        Self {
            id,
            value: value.into(),
        }
    }

    #[must_use]
    pub fn rejected() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_rejected(&self) -> bool {
        self.id == 0
    }
}

/// An acceptor's answer to Prepare.
///
/// The zero promise (`id == 0`) is a rejection. `accepted` carries the
/// acceptor's previously accepted proposal when the proposer is retrying, so
/// competing proposers converge on a value instead of overwriting it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Promise {
    pub id: u64,
    pub accepted: Option<Proposal>,
}

impl Promise {
    #[must_use]
    pub fn new(id: u64) -> Self {
        Self { id, accepted: None }
    }

    #[must_use]
    pub fn rejected() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_rejected(&self) -> bool {
        self.id == 0
    }
}

/// One member's answer during a fan-out phase. `payload` is `None` when the
/// member could not be reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vote<P> {
    pub member: String,
    pub payload: Option<P>,
}

impl Record for Request {
    const KIND: u8 = 1;
}

impl Record for Promise {
    const KIND: u8 = 2;
}

impl Record for Proposal {
    const KIND: u8 = 3;
}
