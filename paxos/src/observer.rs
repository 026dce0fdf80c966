//! The observer learns which proposals a quorum of acceptors accepted.

use std::collections::HashMap;

use error_stack::{Report, ResultExt};
use futures::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace, warn};

use crate::config::BackoffConfig;
use crate::error::ObserverError;
use crate::log::Log;
use crate::membership::Membership;
use crate::messages::{Proposal, Request, Vote};
use crate::quorum::Tally;
use crate::transport::{Dialer, ObserverClient};

const VOTE_CAPACITY: usize = 16;

/// Follows every acceptor's Observe stream and records a proposal in its log
/// once a majority of acceptors report it.
pub struct Observer<L, D> {
    log: L,
    dialer: D,
    backoff: BackoffConfig,
    learned: watch::Sender<Proposal>,
}

impl<L, D> Observer<L, D>
where
    L: Log,
    D: Dialer,
    D::Client: ObserverClient,
{
    /// Create an observer that records into `log`, resuming after its last
    /// record.
    ///
    /// This reads from the log and may block.
    ///
    /// # Errors
    ///
    /// Fails if the log cannot be read.
    pub fn open(log: L, dialer: D) -> Result<Self, Report<ObserverError>> {
        let last = log
            .last::<Proposal>()
            .change_context(ObserverError)
            .attach("failed to read last learned proposal")?
            .unwrap_or_default();
        debug!(id = last.id, "observer restored");

        Ok(Self {
            log,
            dialer,
            backoff: BackoffConfig::default(),
            learned: watch::Sender::new(last),
        })
    }

    #[must_use]
    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn log(&self) -> &L {
        &self.log
    }

    /// The learned proposal with the greatest id.
    #[must_use]
    pub fn last_learned(&self) -> Proposal {
        self.learned.borrow().clone()
    }

    /// Watch the learned proposal with the greatest id.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Proposal> {
        self.learned.subscribe()
    }

    /// Follow every active member until `cancel` fires.
    ///
    /// # Errors
    ///
    /// Fails if a learned proposal cannot be recorded. Connection failures
    /// are retried.
    #[instrument(skip_all, name = "observer")]
    pub async fn start(
        &self,
        cancel: &CancellationToken,
        membership: &Membership,
    ) -> Result<(), Report<ObserverError>> {
        let followers_cancel = cancel.child_token();
        let _stop_followers = followers_cancel.clone().drop_guard();

        let (votes_tx, mut votes_rx) = mpsc::channel(VOTE_CAPACITY);
        let mut watch = membership.watch();
        let mut followers: HashMap<String, CancellationToken> = HashMap::new();
        let mut tally = Tally::new(membership.majority());

        loop {
            tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                change = watch.changed() => {
                    let Some(change) = change else {
                        return Ok(());
                    };
                    let ready = tally.set_quorum(membership.majority());
                    debug!(?change, quorum = tally.quorum(), "membership changed");
                    for proposal in ready {
                        self.learn(proposal).await?;
                    }

                    for member in change.active {
                        if followers.contains_key(&member) {
                            continue;
                        }
                        let token = followers_cancel.child_token();
                        followers.insert(member.clone(), token.clone());
                        tokio::spawn(follow(
                            member,
                            self.dialer.clone(),
                            self.backoff.clone(),
                            self.learned.subscribe(),
                            votes_tx.clone(),
                            token,
                        ));
                    }

                    for member in change.left.iter().chain(&change.removed) {
                        if let Some(token) = followers.remove(member) {
                            debug!(%member, "stopped following");
                            token.cancel();
                        }
                    }
                }
                Some(vote) = votes_rx.recv() => {
                    let Vote { member, payload: Some(proposal) } = vote else {
                        continue;
                    };
                    trace!(%member, id = proposal.id, "vote");
                    if let Some(learned) = tally.track(&member, proposal) {
                        self.learn(learned).await?;
                    }
                }
            }
        }
    }

    async fn learn(&self, proposal: Proposal) -> Result<(), Report<ObserverError>> {
        let log = self.log.clone();
        let record = proposal.clone();
        let res = tokio::task::spawn_blocking(move || log.record(record.id, &record))
            .await
            .change_context(ObserverError)?;
        if let Err(error) = res {
            warn!(id = proposal.id, ?error, "failed to record learned proposal");
            return Err(error
                .change_context(ObserverError)
                .attach("failed to record learned proposal"));
        }

        debug!(id = proposal.id, "learned");
        self.learned.send_if_modified(|last| {
            if proposal.id > last.id {
                *last = proposal;
                true
            } else {
                false
            }
        });
        Ok(())
    }
}

/// Stream one member's accepted proposals into `votes`, reconnecting from
/// the last learned id whenever the stream ends.
async fn follow<D>(
    member: String,
    dialer: D,
    backoff: BackoffConfig,
    learned: watch::Receiver<Proposal>,
    votes: mpsc::Sender<Vote<Proposal>>,
    cancel: CancellationToken,
) where
    D: Dialer,
    D::Client: ObserverClient,
{
    let mut retries = 0;
    loop {
        let from = Request::observe(learned.borrow().id);
        let observation = {
            let dialer = &dialer;
            let member = member.as_str();
            backoff
                .retry("observe", &cancel, || async move {
                    let client = dialer.dial(member).await?;
                    client.observe(from).await
                })
                .await
        };
        let Some(mut observation) = observation else {
            return;
        };
        debug!(%member, from = from.id, "following");

        loop {
            let next = tokio::select! {
                () = cancel.cancelled() => return,
                next = observation.next() => next,
            };
            match next {
                Some(Ok(proposal)) => {
                    retries = 0;
                    let vote = Vote {
                        member: member.clone(),
                        payload: Some(proposal),
                    };
                    if votes.send(vote).await.is_err() {
                        return;
                    }
                }
                Some(Err(error)) => {
                    debug!(%member, ?error, "observe stream failed");
                    break;
                }
                None => {
                    debug!(%member, "observe stream closed");
                    break;
                }
            }
        }

        if !backoff.sleep(retries, &cancel).await {
            return;
        }
        retries = retries.saturating_add(1);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::acceptor::Acceptor;
    use crate::local::LocalNetwork;
    use crate::log::MemoryLog;
    use crate::log::failing::FailingLog;

    struct Cluster {
        network: LocalNetwork<MemoryLog>,
        acceptors: Vec<Acceptor<MemoryLog>>,
        membership: Membership,
    }

    fn cluster(members: &[&str]) -> Cluster {
        let network = LocalNetwork::new();
        let mut acceptors = Vec::new();
        for member in members {
            let log = MemoryLog::new();
            let acceptor =
                Acceptor::open(log.with_prefix("promised/"), log.with_prefix("accepted/"))
                    .unwrap();
            network.register(*member, acceptor.clone());
            acceptors.push(acceptor);
        }
        Cluster {
            network,
            acceptors,
            membership: Membership::with_members(members.iter().copied()),
        }
    }

    async fn wait_learned(rx: &mut watch::Receiver<Proposal>, id: u64) -> Proposal {
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|p| p.id >= id))
            .await
            .unwrap()
            .unwrap()
            .clone()
    }

    #[tokio::test]
    async fn learns_once_majority_accepts() {
        let cluster = cluster(&["a", "b", "c"]);
        let observer = Observer::open(MemoryLog::new(), cluster.network.clone()).unwrap();
        let mut learned = observer.subscribe();
        let cancel = CancellationToken::new();

        let run = observer.start(&cancel, &cluster.membership);
        let check = async {
            cluster.acceptors[0].accept(Proposal::new(7, "v")).await.unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
            assert_eq!(learned.borrow().id, 0);

            cluster.acceptors[2].accept(Proposal::new(7, "v")).await.unwrap();
            let got = wait_learned(&mut learned, 7).await;
            assert_eq!(got, Proposal::new(7, "v"));
            cancel.cancel();
        };

        let (res, ()) = tokio::join!(run, check);
        res.unwrap();
        assert_eq!(
            observer.log().last::<Proposal>().unwrap(),
            Some(Proposal::new(7, "v"))
        );
    }

    #[tokio::test]
    async fn split_values_are_not_learned() {
        let cluster = cluster(&["a", "b", "c"]);
        let observer = Observer::open(MemoryLog::new(), cluster.network.clone()).unwrap();
        let cancel = CancellationToken::new();

        let run = observer.start(&cancel, &cluster.membership);
        let check = async {
            cluster.acceptors[0].accept(Proposal::new(3, "x")).await.unwrap();
            cluster.acceptors[1].accept(Proposal::new(3, "y")).await.unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel.cancel();
        };

        let (res, ()) = tokio::join!(run, check);
        res.unwrap();
        assert_eq!(observer.log().last::<Proposal>().unwrap(), None);
        assert_eq!(observer.last_learned(), Proposal::rejected());
    }

    #[tokio::test]
    async fn catches_up_on_history() {
        let cluster = cluster(&["a", "b", "c"]);
        for acceptor in &cluster.acceptors[..2] {
            for id in [1, 2, 3] {
                acceptor.accept(Proposal::new(id, "old")).await.unwrap();
            }
        }

        let observer = Observer::open(MemoryLog::new(), cluster.network.clone()).unwrap();
        let mut learned = observer.subscribe();
        let cancel = CancellationToken::new();

        let run = observer.start(&cancel, &cluster.membership);
        let check = async {
            wait_learned(&mut learned, 3).await;
            cancel.cancel();
        };

        let (res, ()) = tokio::join!(run, check);
        res.unwrap();

        let mut ids = Vec::new();
        observer
            .log()
            .range(0, u64::MAX, |p: Proposal| {
                ids.push(p.id);
                Ok(())
            })
            .unwrap();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn reconnects_after_partition() {
        let cluster = cluster(&["a", "b", "c"]);
        let observer = Observer::open(MemoryLog::new(), cluster.network.clone()).unwrap();
        let mut learned = observer.subscribe();
        let cancel = CancellationToken::new();

        let run = observer.start(&cancel, &cluster.membership);
        let check = async {
            cluster.network.partition("a");
            cluster.network.partition("b");
            for acceptor in &cluster.acceptors {
                acceptor.accept(Proposal::new(9, "late")).await.unwrap();
            }
            // only "c" is reachable, one vote short
            tokio::time::sleep(Duration::from_millis(50)).await;
            assert_eq!(learned.borrow().id, 0);

            cluster.network.heal("a");
            wait_learned(&mut learned, 9).await;
            cancel.cancel();
        };

        let (res, ()) = tokio::join!(run, check);
        res.unwrap();
    }

    #[tokio::test]
    async fn resumes_from_recorded_log() {
        let cluster = cluster(&["a"]);
        let log = MemoryLog::new();
        log.record(4, &Proposal::new(4, "seen")).unwrap();

        let observer = Observer::open(log, cluster.network.clone()).unwrap();
        assert_eq!(observer.last_learned(), Proposal::new(4, "seen"));
    }

    #[tokio::test]
    async fn failed_record_stops_without_advancing() {
        let cluster = cluster(&["a", "b", "c"]);
        let log = FailingLog::new();
        log.fail_writes(true);
        let observer = Observer::open(log, cluster.network.clone()).unwrap();
        let cancel = CancellationToken::new();

        for acceptor in &cluster.acceptors[..2] {
            acceptor.accept(Proposal::new(7, "v")).await.unwrap();
        }
        let res = tokio::time::timeout(
            Duration::from_secs(5),
            observer.start(&cancel, &cluster.membership),
        )
        .await
        .unwrap();

        assert!(res.is_err());
        assert_eq!(observer.last_learned(), Proposal::rejected());
        assert_eq!(observer.log().last::<Proposal>().unwrap(), None);
    }

    #[tokio::test]
    async fn smaller_majority_completes_pending_votes() {
        let cluster = cluster(&["a", "b", "c", "d"]);
        let observer = Observer::open(MemoryLog::new(), cluster.network.clone()).unwrap();
        let mut learned = observer.subscribe();
        let cancel = CancellationToken::new();

        let run = observer.start(&cancel, &cluster.membership);
        let check = async {
            for acceptor in &cluster.acceptors[..2] {
                acceptor.accept(Proposal::new(5, "v")).await.unwrap();
            }
            // two of four is short of a majority of three
            tokio::time::sleep(Duration::from_millis(50)).await;
            assert_eq!(learned.borrow().id, 0);

            // no new votes arrive, the smaller majority alone decides it
            cluster.membership.remove("d");
            let got = wait_learned(&mut learned, 5).await;
            assert_eq!(got, Proposal::new(5, "v"));
            cancel.cancel();
        };

        let (res, ()) = tokio::join!(run, check);
        res.unwrap();
    }
}
