//! The acceptor: grants promises, accepts proposals and feeds learners.

use std::collections::HashMap;
use std::pin::pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use error_stack::{Report, ResultExt};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace, warn};

use crate::error::{AcceptorError, LogError, RpcError};
use crate::log::Log;
use crate::messages::{Promise, Proposal, Request};
use crate::transport::{AcceptorClient, ObserveConn};

/// Proposals buffered per Observe subscriber before it is considered lagging.
const SUBSCRIBER_CAPACITY: usize = 16;

/// Historical proposals read ahead of a replaying Observe stream.
const HISTORY_BATCH: usize = 64;

/// A durable Paxos acceptor.
///
/// Promises and accepted proposals are written to their logs before the
/// in-memory state changes, and every Prepare, Accept and subscriber change
/// is serialized by one lock. Clones share state.
pub struct Acceptor<L> {
    inner: Arc<Inner<L>>,
}

impl<L> Clone for Acceptor<L> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct Inner<L> {
    promises: L,
    accepts: L,
    state: Mutex<State>,
}

struct State {
    last_promise: Promise,
    /// The accepted proposal with the greatest id.
    last_accept: Proposal,
    subscribers: HashMap<u64, mpsc::Sender<Proposal>>,
    next_subscriber: u64,
}

impl<L> Inner<L> {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<L: Log> Acceptor<L> {
    /// Restore an acceptor from its promise and accept logs.
    ///
    /// This reads from the logs and may block.
    ///
    /// # Errors
    ///
    /// Fails if either log cannot be read.
    pub fn open(promises: L, accepts: L) -> Result<Self, Report<AcceptorError>> {
        let last_promise = promises
            .last::<Promise>()
            .change_context(AcceptorError)
            .attach("failed to restore last promise")?
            .unwrap_or_default();
        let last_accept = accepts
            .last::<Proposal>()
            .change_context(AcceptorError)
            .attach("failed to restore last accepted proposal")?
            .unwrap_or_default();

        debug!(
            promised = last_promise.id,
            accepted = last_accept.id,
            "acceptor restored"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                promises,
                accepts,
                state: Mutex::new(State {
                    last_promise,
                    last_accept,
                    subscribers: HashMap::new(),
                    next_subscriber: 0,
                }),
            }),
        })
    }

    #[must_use]
    pub fn last_promise(&self) -> Promise {
        self.inner.lock().last_promise.clone()
    }

    #[must_use]
    pub fn last_accept(&self) -> Proposal {
        self.inner.lock().last_accept.clone()
    }

    /// Answer a Prepare. A zero promise means the request was rejected.
    ///
    /// # Errors
    ///
    /// Fails if the promise could not be made durable. The acceptor's state
    /// is unchanged in that case.
    pub async fn prepare(&self, request: Request) -> Result<Promise, Report<AcceptorError>> {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || inner.prepare(request))
            .await
            .change_context(AcceptorError)?
    }

    /// Answer an Accept, echoing the proposal on success. A zero proposal
    /// means it was rejected.
    ///
    /// # Errors
    ///
    /// Fails if the proposal could not be made durable. The acceptor's state
    /// is unchanged in that case.
    pub async fn accept(&self, proposal: Proposal) -> Result<Proposal, Report<AcceptorError>> {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || inner.accept(proposal))
            .await
            .change_context(AcceptorError)?
    }

    /// Serve one Observe stream.
    ///
    /// Waits for the opening [`Request`], replays accepted proposals from
    /// its id (inclusive) up to the newest accepted one, then forwards
    /// every new accept until the stream closes or `cancel` fires.
    ///
    /// # Errors
    ///
    /// Fails if the connection fails, history cannot be read, or this
    /// subscriber fell too far behind and was dropped.
    #[instrument(skip_all, name = "observe")]
    pub async fn observe<C>(
        &self,
        conn: C,
        cancel: &CancellationToken,
    ) -> Result<(), Report<AcceptorError>>
    where
        C: ObserveConn + Send,
    {
        let mut conn = pin!(conn);
        let (mut subscription, highest) = self.subscribe();

        let request = tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            msg = conn.next() => msg,
        };
        let Some(request) = request else {
            debug!("stream closed before request");
            return Ok(());
        };
        let request = request
            .change_context(AcceptorError)
            .attach("failed to read observe request")?;
        debug!(from = request.id, to = highest, "observer connected");

        if highest != 0 && request.id <= highest {
            let (tx, mut history) = mpsc::channel(HISTORY_BATCH);
            let replay = self.replay(request.id, highest, tx);
            loop {
                let proposal = tokio::select! {
                    () = cancel.cancelled() => return Ok(()),
                    proposal = history.recv() => proposal,
                };
                let Some(proposal) = proposal else {
                    break;
                };
                conn.send(proposal)
                    .await
                    .change_context(AcceptorError)
                    .attach("failed to replay history")?;
            }
            replay
                .await
                .change_context(AcceptorError)?
                .change_context(AcceptorError)
                .attach("failed to read accepted history")?;
        }

        loop {
            tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                proposal = subscription.rx.recv() => {
                    let Some(proposal) = proposal else {
                        return Err(Report::new(AcceptorError).attach("observer lagged behind"));
                    };
                    trace!(id = proposal.id, "forwarding accepted proposal");
                    conn.send(proposal)
                        .await
                        .change_context(AcceptorError)
                        .attach("failed to forward proposal")?;
                }
                msg = conn.next() => match msg {
                    None => {
                        debug!("observer disconnected");
                        return Ok(());
                    }
                    Some(Err(error)) => {
                        return Err(error.change_context(AcceptorError));
                    }
                    Some(Ok(request)) => {
                        trace!(id = request.id, "ignoring extra observe request");
                    }
                },
            }
        }
    }

    /// Register a live subscriber and capture the newest accepted id.
    fn subscribe(&self) -> (Subscription<'_, L>, u64) {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CAPACITY);
        let mut state = self.inner.lock();
        let id = state.next_subscriber;
        state.next_subscriber += 1;
        state.subscribers.insert(id, tx);
        let highest = state.last_accept.id;
        drop(state);

        let subscription = Subscription {
            inner: &self.inner,
            id,
            rx,
        };
        (subscription, highest)
    }

    /// Read accepted proposals `from..=to` into `tx` on a blocking thread,
    /// at most [`HISTORY_BATCH`] ahead of the reader.
    fn replay(
        &self,
        from: u64,
        to: u64,
        tx: mpsc::Sender<Proposal>,
    ) -> JoinHandle<Result<(), Report<LogError>>> {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            inner.accepts.range(from, to, |proposal: Proposal| {
                tx.blocking_send(proposal)
                    .map_err(|_| Report::new(LogError).attach("observer stopped reading history"))
            })
        })
    }
}

impl<L: Log> Inner<L> {
    fn prepare(&self, request: Request) -> Result<Promise, Report<AcceptorError>> {
        let mut state = self.lock();

        // an accepted id also counts as promised
        let floor = state.last_promise.id.max(state.last_accept.id);
        if request.id <= floor {
            trace!(id = request.id, floor, "prepare rejected");
            return Ok(Promise::rejected());
        }

        let mut promise = Promise::new(request.id);
        if request.attempt > 1 && !state.last_accept.is_rejected() {
            promise.accepted = Some(state.last_accept.clone());
        }

        self.promises
            .record(promise.id, &promise)
            .change_context(AcceptorError)
            .attach("failed to persist promise")?;

        trace!(id = promise.id, carried = promise.accepted.is_some(), "promise granted");
        state.last_promise = promise.clone();
        Ok(promise)
    }

    fn accept(&self, proposal: Proposal) -> Result<Proposal, Report<AcceptorError>> {
        let mut state = self.lock();

        if proposal.is_rejected() || proposal.id < state.last_promise.id {
            trace!(id = proposal.id, promised = state.last_promise.id, "accept rejected");
            return Ok(Proposal::rejected());
        }

        self.accepts
            .record(proposal.id, &proposal)
            .change_context(AcceptorError)
            .attach("failed to persist accepted proposal")?;

        trace!(id = proposal.id, "proposal accepted");
        if proposal.id > state.last_accept.id {
            state.last_accept = proposal.clone();
        }

        state.subscribers.retain(|id, tx| match tx.try_send(proposal.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(subscriber = id, "dropping lagging observer");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });

        Ok(proposal)
    }
}

/// A live subscriber slot, released on drop.
struct Subscription<'a, L> {
    inner: &'a Inner<L>,
    id: u64,
    rx: mpsc::Receiver<Proposal>,
}

impl<L> Drop for Subscription<'_, L> {
    fn drop(&mut self) {
        self.inner.lock().subscribers.remove(&self.id);
    }
}

impl<L: Log> AcceptorClient for Acceptor<L> {
    async fn prepare(&self, request: Request) -> Result<Promise, Report<RpcError>> {
        Acceptor::prepare(self, request)
            .await
            .change_context(RpcError)
    }

    async fn accept(&self, proposal: Proposal) -> Result<Proposal, Report<RpcError>> {
        Acceptor::accept(self, proposal)
            .await
            .change_context(RpcError)
    }
}
