//! Round id generation
//!
//! Ids are `(unix_millis << 8) | server_id`. Comparing two ids compares their
//! timestamps first and breaks ties by server id, so ids minted by different
//! participants are always comparable and never equal.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Source of wall-clock time in milliseconds since the unix epoch.
pub trait Clock: Send + Sync + 'static {
    fn now_millis(&self) -> u64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Clone, Default)]
pub struct ManualClock(Arc<AtomicU64>);

impl ManualClock {
    #[must_use]
    pub fn new(millis: u64) -> Self {
        Self(Arc::new(AtomicU64::new(millis)))
    }

    pub fn set(&self, millis: u64) {
        self.0.store(millis, Ordering::SeqCst);
    }

    pub fn advance(&self, millis: u64) {
        self.0.fetch_add(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

pub trait IdGenerator: Send + Sync + 'static {
    /// A fresh round id, greater than any this generator returned before.
    fn next_id(&self) -> u64;
}

/// Generates ids for one participant.
///
/// At most one id is minted per millisecond. When called again within the
/// same millisecond (or after the clock stepped backwards) the generator
/// borrows the next millisecond slot instead of repeating itself.
#[derive(Debug)]
pub struct ServerIdGenerator<C = SystemClock> {
    server_id: u8,
    clock: C,
    last: AtomicU64,
}

impl ServerIdGenerator<SystemClock> {
    #[must_use]
    pub fn new(server_id: u8) -> Self {
        Self::with_clock(server_id, SystemClock)
    }
}

impl<C: Clock> ServerIdGenerator<C> {
    #[must_use]
    pub fn with_clock(server_id: u8, clock: C) -> Self {
        Self {
            server_id,
            clock,
            last: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn server_id(&self) -> u8 {
        self.server_id
    }
}

impl<C: Clock> IdGenerator for ServerIdGenerator<C> {
    fn next_id(&self) -> u64 {
        let candidate = (self.clock.now_millis() << 8) | u64::from(self.server_id);
        let step = |last: u64| {
            if candidate > last {
                candidate
            } else {
                last + (1 << 8)
            }
        };
        let (Ok(last) | Err(last)) = self
            .last
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| Some(step(last)));
        step(last)
    }
}

impl<G: IdGenerator + ?Sized> IdGenerator for Arc<G> {
    fn next_id(&self) -> u64 {
        (**self).next_id()
    }
}
