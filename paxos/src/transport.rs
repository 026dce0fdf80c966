//! Client and connection traits the protocol is written against.
//!
//! Framing and encoding belong to the transport. The core only needs a way
//! to dial a member by address, issue Prepare and Accept calls, and open the
//! duplex Observe stream.

use core::future::Future;

use error_stack::Report;
use futures::{Sink, Stream};

use crate::error::RpcError;
use crate::messages::{Promise, Proposal, Request};

/// Prepare and Accept against one acceptor (or a quorum of them).
pub trait AcceptorClient: Send + Sync + 'static {
    fn prepare(
        &self,
        request: Request,
    ) -> impl Future<Output = Result<Promise, Report<RpcError>>> + Send;

    fn accept(
        &self,
        proposal: Proposal,
    ) -> impl Future<Output = Result<Proposal, Report<RpcError>>> + Send;
}

/// The learner side of an acceptor's Observe stream.
pub trait ObserverClient: Send + Sync + 'static {
    type Observation: Stream<Item = Result<Proposal, Report<RpcError>>> + Send + Unpin + 'static;

    /// Send `from` as the opening request and return the proposals that
    /// follow: history from `from.id` onwards, then live accepts.
    fn observe(
        &self,
        from: Request,
    ) -> impl Future<Output = Result<Self::Observation, Report<RpcError>>> + Send;
}

/// Opens clients to members by address.
/// Retrying failed dials is left to the caller.
pub trait Dialer: Clone + Send + Sync + 'static {
    type Client: Send + Sync + 'static;

    fn dial(
        &self,
        member: &str,
    ) -> impl Future<Output = Result<Self::Client, Report<RpcError>>> + Send;
}

/// The acceptor side of an Observe stream: requests in, proposals out.
pub trait ObserveConn:
    Stream<Item = Result<Request, Report<RpcError>>> + Sink<Proposal, Error = Report<RpcError>>
{
}

impl<T> ObserveConn for T where
    T: Stream<Item = Result<Request, Report<RpcError>>> + Sink<Proposal, Error = Report<RpcError>>
{
}
