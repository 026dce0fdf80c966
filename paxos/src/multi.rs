//! A quorum client over every known acceptor.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use error_stack::Report;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace};

use crate::config::BackoffConfig;
use crate::error::RpcError;
use crate::membership::Membership;
use crate::messages::{Promise, Proposal, Request, Vote};
use crate::transport::{AcceptorClient, Dialer};

/// Fans Prepare and Accept out to every connected acceptor and succeeds only
/// when a majority agrees.
///
/// Connections are kept in sync with [`Membership`] by
/// [`start`](Self::start). Clones share connections.
pub struct MultiAcceptorClient<D: Dialer> {
    inner: Arc<Inner<D>>,
}

impl<D: Dialer> Clone for MultiAcceptorClient<D> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct Inner<D: Dialer> {
    dialer: D,
    backoff: BackoffConfig,
    connections: DashMap<String, Connection<D::Client>>,
    size: AtomicUsize,
    majority: AtomicUsize,
    /// Distinguishes dials of the same member across remove and re-add.
    generation: AtomicU64,
}

struct Connection<C> {
    client: Arc<C>,
    generation: u64,
}

impl<D: Dialer> Inner<D> {
    /// Store a freshly dialed client unless a newer dial of the same member
    /// got there first or the dial was cancelled meanwhile.
    fn insert(
        &self,
        member: String,
        client: D::Client,
        generation: u64,
        token: &CancellationToken,
    ) {
        if token.is_cancelled() {
            return;
        }
        let connection = Connection {
            client: Arc::new(client),
            generation,
        };
        match self.connections.entry(member.clone()) {
            Entry::Vacant(entry) => {
                entry.insert(connection);
                self.size.fetch_add(1, Ordering::SeqCst);
            }
            Entry::Occupied(mut entry) => {
                if entry.get().generation < generation {
                    entry.insert(connection);
                }
            }
        }

        // removed while we were inserting
        if token.is_cancelled()
            && self
                .connections
                .remove_if(&member, |_, connection| connection.generation == generation)
                .is_some()
        {
            self.size.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn remove(&self, member: &str) {
        if self.connections.remove(member).is_some() {
            self.size.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl<D: Dialer> MultiAcceptorClient<D> {
    #[must_use]
    pub fn new(dialer: D) -> Self {
        Self::with_backoff(dialer, BackoffConfig::default())
    }

    #[must_use]
    pub fn with_backoff(dialer: D, backoff: BackoffConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                dialer,
                backoff,
                connections: DashMap::new(),
                size: AtomicUsize::new(0),
                majority: AtomicUsize::new(0),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Number of connected acceptors.
    #[must_use]
    pub fn size(&self) -> usize {
        self.inner.size.load(Ordering::SeqCst)
    }

    /// The majority last reported by membership. Zero until the first change
    /// arrives.
    #[must_use]
    pub fn majority(&self) -> usize {
        self.inner.majority.load(Ordering::SeqCst)
    }

    /// Keep connections in sync with `membership` until `cancel` fires.
    ///
    /// Newly active members are dialed in the background, retrying with
    /// backoff. Removed members are disconnected.
    ///
    /// # Errors
    ///
    /// Dial failures are retried rather than returned, so this only returns
    /// once cancelled.
    #[instrument(skip_all, name = "acceptor_membership")]
    pub async fn start(
        &self,
        cancel: &CancellationToken,
        membership: &Membership,
    ) -> Result<(), Report<RpcError>> {
        let connections_cancel = cancel.child_token();
        let _stop_connections = connections_cancel.clone().drop_guard();

        let mut watch = membership.watch();
        let mut members: HashMap<String, CancellationToken> = HashMap::new();

        loop {
            let change = tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                change = watch.changed() => change,
            };
            let Some(change) = change else {
                return Ok(());
            };

            let majority = membership.majority();
            self.inner.majority.store(majority, Ordering::SeqCst);
            debug!(?change, majority, "membership changed");

            for member in change.active {
                if members.contains_key(&member) {
                    continue;
                }
                let token = connections_cancel.child_token();
                members.insert(member.clone(), token.clone());
                let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
                tokio::spawn(connect(self.inner.clone(), member, generation, token));
            }

            for member in change.removed {
                if let Some(token) = members.remove(&member) {
                    token.cancel();
                }
                self.inner.remove(&member);
                debug!(%member, "disconnected acceptor");
            }
        }
    }

    fn targets(&self) -> Vec<(String, Arc<D::Client>)> {
        self.inner
            .connections
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().client.clone()))
            .collect()
    }
}

async fn connect<D: Dialer>(
    inner: Arc<Inner<D>>,
    member: String,
    generation: u64,
    token: CancellationToken,
) {
    let client = inner
        .backoff
        .retry("dial acceptor", &token, || inner.dialer.dial(&member))
        .await;
    if let Some(client) = client {
        debug!(%member, "connected to acceptor");
        inner.insert(member, client, generation, &token);
    }
}

/// Call every target once and collect one vote per target.
async fn broadcast<C, P, F, Fut>(targets: Vec<(String, Arc<C>)>, call: F) -> Vec<Vote<P>>
where
    F: Fn(Arc<C>) -> Fut,
    Fut: Future<Output = Result<P, Report<RpcError>>>,
{
    let mut pending: FuturesUnordered<_> = targets
        .into_iter()
        .map(|(member, client)| {
            let call = call(client);
            async move {
                let payload = match call.await {
                    Ok(payload) => Some(payload),
                    Err(error) => {
                        trace!(%member, ?error, "acceptor call failed");
                        None
                    }
                };
                Vote { member, payload }
            }
        })
        .collect();

    let mut votes = Vec::with_capacity(pending.len());
    while let Some(vote) = pending.next().await {
        votes.push(vote);
    }
    votes
}

/// Combine per-acceptor promises for round `id`.
///
/// Grants when at least `majority` acceptors promised `id`, carrying the
/// highest previously accepted proposal any of them reported.
#[must_use]
pub fn tally_promises(id: u64, votes: &[Vote<Promise>], majority: usize) -> Promise {
    let promises: Vec<&Promise> = votes.iter().filter_map(|v| v.payload.as_ref()).collect();
    if majority == 0 || promises.len() < majority {
        return Promise::rejected();
    }

    let granted = promises.iter().filter(|p| p.id == id).count();
    if granted < majority {
        return Promise::rejected();
    }

    let accepted = promises
        .iter()
        .filter_map(|p| p.accepted.as_ref())
        .filter(|a| !a.is_rejected())
        .max_by_key(|a| a.id)
        .cloned();
    Promise { id, accepted }
}

/// Combine per-acceptor answers to `proposal`.
///
/// Succeeds when at least `majority` acceptors echoed its id.
#[must_use]
pub fn tally_accepts(proposal: Proposal, votes: &[Vote<Proposal>], majority: usize) -> Proposal {
    let answers = votes.iter().filter(|v| v.payload.is_some()).count();
    if majority == 0 || answers < majority {
        return Proposal::rejected();
    }

    let accepted = votes
        .iter()
        .filter_map(|v| v.payload.as_ref())
        .filter(|p| p.id == proposal.id)
        .count();
    if accepted < majority {
        return Proposal::rejected();
    }
    proposal
}

impl<D> AcceptorClient for MultiAcceptorClient<D>
where
    D: Dialer,
    D::Client: AcceptorClient,
{
    async fn prepare(&self, request: Request) -> Result<Promise, Report<RpcError>> {
        let majority = self.majority();
        let targets = self.targets();
        if majority == 0 || targets.len() < majority {
            trace!(known = targets.len(), majority, "too few acceptors to prepare");
            return Ok(Promise::rejected());
        }

        let votes = broadcast(targets, |client| async move { client.prepare(request).await }).await;
        Ok(tally_promises(request.id, &votes, majority))
    }

    async fn accept(&self, proposal: Proposal) -> Result<Proposal, Report<RpcError>> {
        let majority = self.majority();
        let targets = self.targets();
        if majority == 0 || targets.len() < majority {
            trace!(known = targets.len(), majority, "too few acceptors to accept");
            return Ok(Proposal::rejected());
        }

        let votes = broadcast(targets, |client| {
            let proposal = proposal.clone();
            async move { client.accept(proposal).await }
        })
        .await;
        Ok(tally_accepts(proposal, &votes, majority))
    }
}
