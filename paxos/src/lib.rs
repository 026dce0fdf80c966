//! Single-decree-per-round Paxos
//!
//! A set of participants agree on a sequence of values despite crashes,
//! lost messages and competing proposers.
//!
//! # Architecture
//!
//! - **Acceptors** ([`Acceptor`]) grant promises and accept proposals,
//!   persisting both to a [`Log`] before answering.
//! - **Proposers** ([`Proposer`]) run Prepare then Accept against a quorum
//!   through the [`MultiAcceptorClient`], adopting any value an acceptor
//!   already accepted.
//! - **Observers** ([`Observer`]) follow every acceptor and record a
//!   proposal once a majority reports it.
//!
//! [`Paxos`] composes all three into one participant, driven by a
//! [`Membership`].
//!
//! # Quick Start
//!
//! ```ignore
//! use basic_paxos::{LocalNetwork, Membership, MemoryLog, Paxos, ServerIdGenerator};
//!
//! let network = LocalNetwork::new();
//! let membership = Membership::with_members(["a", "b", "c"]);
//!
//! let paxos = Paxos::builder()
//!     .id_generator(ServerIdGenerator::new(1))
//!     .logs(&MemoryLog::new())
//!     .dialer(network.clone())
//!     .build()?;
//! network.register("a", paxos.acceptor().clone());
//!
//! tokio::spawn(async move { paxos.start(&cancel, &membership).await });
//! let value = paxos.propose(&cancel, "hello-world").await?;
//! ```

#![warn(clippy::pedantic)]

pub mod acceptor;
pub mod config;
pub mod error;
pub mod id;
pub mod local;
pub mod log;
pub mod membership;
mod messages;
pub mod multi;
pub mod observer;
mod paxos;
pub mod proposer;
pub mod quorum;
pub mod transport;

pub use acceptor::Acceptor;
pub use config::BackoffConfig;
pub use id::{Clock, IdGenerator, ManualClock, ServerIdGenerator, SystemClock};
pub use local::LocalNetwork;
pub use log::{FjallLog, Log, MemoryLog, Record};
pub use membership::{Membership, MembershipChange, Watch};
pub use messages::{Promise, Proposal, Request, Vote};
pub use multi::MultiAcceptorClient;
pub use observer::Observer;
pub use paxos::{ACCEPTED_PREFIX, PROMISED_PREFIX, Paxos, PaxosBuilder, RECORDED_PREFIX};
pub use proposer::Proposer;
pub use transport::{AcceptorClient, Dialer, ObserveConn, ObserverClient};
