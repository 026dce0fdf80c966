//! The proposer drives a value through Prepare and Accept.

use bytes::Bytes;
use error_stack::Report;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace};

use crate::config::BackoffConfig;
use crate::error::{ProposeError, RpcError};
use crate::id::IdGenerator;
use crate::messages::{Promise, Proposal, Request};
use crate::transport::AcceptorClient;

pub struct Proposer<G, A> {
    ids: G,
    acceptor: A,
    backoff: BackoffConfig,
}

impl<G: IdGenerator, A: AcceptorClient> Proposer<G, A> {
    #[must_use]
    pub fn new(ids: G, acceptor: A) -> Self {
        Self::with_backoff(ids, acceptor, BackoffConfig::default())
    }

    #[must_use]
    pub fn with_backoff(ids: G, acceptor: A, backoff: BackoffConfig) -> Self {
        Self {
            ids,
            acceptor,
            backoff,
        }
    }

    pub fn acceptor(&self) -> &A {
        &self.acceptor
    }

    /// Propose `value` until some value is accepted for a round we prepared.
    ///
    /// The result is the accepted value. It differs from `value` when an
    /// acceptor reported a previously accepted value that had to be adopted.
    /// Transport failures and rejections are retried with backoff.
    ///
    /// # Errors
    ///
    /// Only fails if `cancel` fires first.
    #[instrument(skip_all, name = "propose", fields(len = value.len()))]
    pub async fn propose(
        &self,
        cancel: &CancellationToken,
        value: Bytes,
    ) -> Result<Bytes, Report<ProposeError>> {
        let mut retries = 0;
        loop {
            let round = tokio::select! {
                () = cancel.cancelled() => break,
                round = self.round(cancel, &value) => round,
            };
            match round {
                Ok(Some(accepted)) => {
                    debug!(id = accepted.id, "proposal accepted");
                    return Ok(accepted.value);
                }
                Ok(None) => trace!(retries, "round rejected"),
                Err(error) => debug!(retries, ?error, "round failed"),
            }

            if !self.backoff.sleep(retries, cancel).await {
                break;
            }
            retries = retries.saturating_add(1);
        }
        Err(Report::new(ProposeError).attach("cancelled"))
    }

    /// One Prepare then Accept cycle. `None` means the accept was rejected
    /// or the round was cancelled.
    async fn round(
        &self,
        cancel: &CancellationToken,
        value: &Bytes,
    ) -> Result<Option<Proposal>, Report<RpcError>> {
        let Some(promise) = self.prepare(cancel).await? else {
            return Ok(None);
        };

        let value = match promise.accepted {
            Some(accepted) if !accepted.value.is_empty() => {
                trace!(id = accepted.id, "adopting accepted value");
                accepted.value
            }
            _ => value.clone(),
        };

        let proposal = Proposal {
            id: promise.id,
            value,
        };
        let accepted = self.acceptor.accept(proposal.clone()).await?;
        if accepted.is_rejected() || accepted.id != proposal.id {
            return Ok(None);
        }
        Ok(Some(accepted))
    }

    /// Prepare with fresh ids until one is promised.
    async fn prepare(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Option<Promise>, Report<RpcError>> {
        let mut attempt: u64 = 0;
        loop {
            attempt += 1;
            let id = self.ids.next_id();
            let promise = self.acceptor.prepare(Request::prepare(id, attempt)).await?;
            if promise.id == id {
                return Ok(Some(promise));
            }

            trace!(id, attempt, "prepare rejected");
            let retries = u32::try_from(attempt - 1).unwrap_or(u32::MAX);
            if !self.backoff.sleep(retries, cancel).await {
                return Ok(None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::acceptor::Acceptor;
    use crate::id::{ManualClock, ServerIdGenerator};
    use crate::log::{Log, MemoryLog};

    fn acceptor() -> Acceptor<MemoryLog> {
        let log = MemoryLog::new();
        Acceptor::open(log.with_prefix("promised/"), log.with_prefix("accepted/")).unwrap()
    }

    #[tokio::test]
    async fn proposes_against_single_acceptor() {
        let proposer = Proposer::new(ServerIdGenerator::new(1), acceptor());
        let cancel = CancellationToken::new();

        let value = proposer
            .propose(&cancel, Bytes::from_static(b"hello"))
            .await
            .unwrap();
        assert_eq!(value, Bytes::from_static(b"hello"));
        assert_eq!(proposer.acceptor().last_accept().value, value);
    }

    #[tokio::test(start_paused = true)]
    async fn adopts_previously_accepted_value() {
        let acceptor = acceptor();
        acceptor.prepare(Request::prepare(5, 1)).await.unwrap();
        acceptor.accept(Proposal::new(5, "x")).await.unwrap();

        // the first id (1) is below the promise, so the retry carries "x"
        let ids = ServerIdGenerator::with_clock(1, ManualClock::new(0));
        let proposer = Proposer::new(ids, acceptor);
        let cancel = CancellationToken::new();

        let value = proposer
            .propose(&cancel, Bytes::from_static(b"mine"))
            .await
            .unwrap();
        assert_eq!(value, Bytes::from_static(b"x"));
    }

    /// Fails the first `failures` calls of each kind, then delegates.
    struct Flaky<A> {
        inner: A,
        failures: usize,
        prepares: AtomicUsize,
        accepts: AtomicUsize,
    }

    impl<A: AcceptorClient> AcceptorClient for Flaky<A> {
        async fn prepare(&self, request: Request) -> Result<Promise, Report<RpcError>> {
            if self.prepares.fetch_add(1, Ordering::SeqCst) < self.failures {
                return Err(Report::new(RpcError).attach("flaky prepare"));
            }
            self.inner.prepare(request).await
        }

        async fn accept(&self, proposal: Proposal) -> Result<Proposal, Report<RpcError>> {
            if self.accepts.fetch_add(1, Ordering::SeqCst) < self.failures {
                return Err(Report::new(RpcError).attach("flaky accept"));
            }
            self.inner.accept(proposal).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transport_failures() {
        let flaky = Flaky {
            inner: acceptor(),
            failures: 3,
            prepares: AtomicUsize::new(0),
            accepts: AtomicUsize::new(0),
        };
        let proposer = Proposer::new(ServerIdGenerator::new(2), flaky);
        let cancel = CancellationToken::new();

        let value = proposer
            .propose(&cancel, Bytes::from_static(b"v"))
            .await
            .unwrap();
        assert_eq!(value, Bytes::from_static(b"v"));
        assert!(proposer.acceptor().accepts.load(Ordering::SeqCst) > 3);
    }

    struct Rejecting;

    impl AcceptorClient for Rejecting {
        async fn prepare(&self, _: Request) -> Result<Promise, Report<RpcError>> {
            Ok(Promise::rejected())
        }

        async fn accept(&self, _: Proposal) -> Result<Proposal, Report<RpcError>> {
            Ok(Proposal::rejected())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_proposing() {
        let proposer = Proposer::new(ServerIdGenerator::new(3), Rejecting);
        let cancel = CancellationToken::new();

        let canceller = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(3)).await;
                cancel.cancel();
            })
        };

        assert!(
            proposer
                .propose(&cancel, Bytes::from_static(b"v"))
                .await
                .is_err()
        );
        canceller.await.unwrap();
    }
}
