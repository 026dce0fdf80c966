//! An in-process transport.
//!
//! Acceptors are registered under a member address and reached through
//! [`LocalNetwork`], which implements [`Dialer`]. Members can be partitioned
//! to make them unreachable: dials and calls fail, and open Observe streams
//! are torn down until the member is healed.

use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use error_stack::{Report, ResultExt};
use futures::{Sink, Stream};
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::debug;

use crate::acceptor::Acceptor;
use crate::error::RpcError;
use crate::log::Log;
use crate::messages::{Promise, Proposal, Request};
use crate::transport::{AcceptorClient, Dialer, ObserverClient};

pub struct LocalNetwork<L> {
    inner: Arc<Mutex<Network<L>>>,
}

impl<L> Clone for LocalNetwork<L> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<L> Default for LocalNetwork<L> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Network {
                acceptors: HashMap::new(),
                unreachable: HashSet::new(),
                streams: HashMap::new(),
            })),
        }
    }
}

struct Network<L> {
    acceptors: HashMap<String, Acceptor<L>>,
    unreachable: HashSet<String>,
    /// Parent token of every open Observe stream per member.
    streams: HashMap<String, CancellationToken>,
}

impl<L> LocalNetwork<L> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Network<L>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self, member: impl Into<String>, acceptor: Acceptor<L>) {
        self.lock().acceptors.insert(member.into(), acceptor);
    }

    /// Make `member` unreachable and close its open Observe streams.
    pub fn partition(&self, member: &str) {
        let mut network = self.lock();
        network.unreachable.insert(member.to_owned());
        if let Some(streams) = network.streams.remove(member) {
            streams.cancel();
        }
        debug!(%member, "partitioned");
    }

    pub fn heal(&self, member: &str) {
        self.lock().unreachable.remove(member);
        debug!(%member, "healed");
    }

    fn route(&self, member: &str) -> Result<(Acceptor<L>, CancellationToken), Report<RpcError>> {
        let mut network = self.lock();
        if network.unreachable.contains(member) {
            return Err(Report::new(RpcError).attach(format!("{member} is unreachable")));
        }
        let Some(acceptor) = network.acceptors.get(member).cloned() else {
            return Err(Report::new(RpcError).attach(format!("{member} is not registered")));
        };
        let streams = network
            .streams
            .entry(member.to_owned())
            .or_default()
            .child_token();
        Ok((acceptor, streams))
    }
}

impl<L: Log> Dialer for LocalNetwork<L> {
    type Client = LocalClient<L>;

    async fn dial(&self, member: &str) -> Result<LocalClient<L>, Report<RpcError>> {
        self.route(member)?;
        Ok(LocalClient {
            member: member.to_owned(),
            network: self.clone(),
        })
    }
}

/// A connection to one member of a [`LocalNetwork`].
///
/// Every call is routed anew, so partitions take effect immediately.
pub struct LocalClient<L> {
    member: String,
    network: LocalNetwork<L>,
}

impl<L: Log> AcceptorClient for LocalClient<L> {
    async fn prepare(&self, request: Request) -> Result<Promise, Report<RpcError>> {
        let (acceptor, _) = self.network.route(&self.member)?;
        acceptor
            .prepare(request)
            .await
            .change_context(RpcError)
            .attach_with(|| format!("prepare on {}", self.member))
    }

    async fn accept(&self, proposal: Proposal) -> Result<Proposal, Report<RpcError>> {
        let (acceptor, _) = self.network.route(&self.member)?;
        acceptor
            .accept(proposal)
            .await
            .change_context(RpcError)
            .attach_with(|| format!("accept on {}", self.member))
    }
}

impl<L: Log> ObserverClient for LocalClient<L> {
    type Observation = LocalObservation;

    async fn observe(&self, from: Request) -> Result<LocalObservation, Report<RpcError>> {
        let (acceptor, cancel) = self.network.route(&self.member)?;
        let (client, server) = observe_pair();

        let member = self.member.clone();
        let task_cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(error) = acceptor.observe(server, &task_cancel).await {
                debug!(%member, ?error, "observe stream ended");
            }
        });

        client
            .requests
            .send(from)
            .map_err(|_| Report::new(RpcError).attach("observe stream closed"))?;

        Ok(LocalObservation {
            proposals: client.proposals,
            _requests: client.requests,
            _cancel: cancel.drop_guard(),
        })
    }
}

/// Proposals streamed from a member. Dropping it closes the stream.
pub struct LocalObservation {
    proposals: mpsc::UnboundedReceiver<Proposal>,
    _requests: mpsc::UnboundedSender<Request>,
    _cancel: DropGuard,
}

impl Stream for LocalObservation {
    type Item = Result<Proposal, Report<RpcError>>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.proposals.poll_recv(cx).map(|p| p.map(Ok))
    }
}

/// The observer's half of an in-process Observe stream.
pub(crate) struct ClientEnd {
    pub(crate) requests: mpsc::UnboundedSender<Request>,
    pub(crate) proposals: mpsc::UnboundedReceiver<Proposal>,
}

/// The acceptor's half of an in-process Observe stream.
pub(crate) struct ServerEnd {
    requests: mpsc::UnboundedReceiver<Request>,
    proposals: mpsc::UnboundedSender<Proposal>,
}

pub(crate) fn observe_pair() -> (ClientEnd, ServerEnd) {
    let (req_tx, req_rx) = mpsc::unbounded_channel();
    let (prop_tx, prop_rx) = mpsc::unbounded_channel();
    (
        ClientEnd {
            requests: req_tx,
            proposals: prop_rx,
        },
        ServerEnd {
            requests: req_rx,
            proposals: prop_tx,
        },
    )
}

impl Stream for ServerEnd {
    type Item = Result<Request, Report<RpcError>>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.requests.poll_recv(cx).map(|r| r.map(Ok))
    }
}

impl Sink<Proposal> for ServerEnd {
    type Error = Report<RpcError>;

    fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn start_send(self: Pin<&mut Self>, item: Proposal) -> Result<(), Self::Error> {
        self.proposals
            .send(item)
            .map_err(|_| Report::new(RpcError).attach("observer hung up"))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }
}
