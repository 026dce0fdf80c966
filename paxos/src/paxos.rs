//! One Paxos participant: acceptor, proposer and observer together.

use bytes::Bytes;
use error_stack::{Report, ResultExt};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::acceptor::Acceptor;
use crate::config::BackoffConfig;
use crate::error::{ConfigError, PaxosError, ProposeError};
use crate::id::IdGenerator;
use crate::log::Log;
use crate::membership::Membership;
use crate::multi::MultiAcceptorClient;
use crate::observer::Observer;
use crate::proposer::Proposer;
use crate::transport::{AcceptorClient, Dialer, ObserverClient};

pub const PROMISED_PREFIX: &str = "promised/";
pub const ACCEPTED_PREFIX: &str = "accepted/";
pub const RECORDED_PREFIX: &str = "recorded/";

/// A full participant.
///
/// The acceptor answers other participants' proposers, the proposer reaches
/// every acceptor through a [`MultiAcceptorClient`], and the observer
/// records what a majority accepted.
pub struct Paxos<L, G, AD: Dialer, OD> {
    acceptor: Acceptor<L>,
    proposer: Proposer<G, MultiAcceptorClient<AD>>,
    observer: Observer<L, OD>,
}

impl<L, G, AD, OD> Paxos<L, G, AD, OD>
where
    L: Log,
    G: IdGenerator,
    AD: Dialer,
    AD::Client: AcceptorClient,
    OD: Dialer,
    OD::Client: ObserverClient,
{
    #[must_use]
    pub fn builder() -> PaxosBuilder<L, G, AD, OD> {
        PaxosBuilder::new()
    }

    /// This participant's acceptor, to be served to other participants.
    pub fn acceptor(&self) -> &Acceptor<L> {
        &self.acceptor
    }

    pub fn proposer(&self) -> &Proposer<G, MultiAcceptorClient<AD>> {
        &self.proposer
    }

    pub fn observer(&self) -> &Observer<L, OD> {
        &self.observer
    }

    /// See [`Proposer::propose`].
    ///
    /// # Errors
    ///
    /// Only fails if `cancel` fires first.
    pub async fn propose(
        &self,
        cancel: &CancellationToken,
        value: impl Into<Bytes>,
    ) -> Result<Bytes, Report<ProposeError>> {
        self.proposer.propose(cancel, value.into()).await
    }

    /// Keep acceptor connections and the observer in sync with
    /// `membership` until `cancel` fires.
    ///
    /// If either side fails, both are stopped.
    ///
    /// # Errors
    ///
    /// Fails if the observer cannot record a learned proposal.
    #[instrument(skip_all, name = "paxos")]
    pub async fn start(
        &self,
        cancel: &CancellationToken,
        membership: &Membership,
    ) -> Result<(), Report<PaxosError>> {
        let cancel = cancel.child_token();
        let _stop = cancel.clone().drop_guard();

        let acceptors = async {
            self.proposer
                .acceptor()
                .start(&cancel, membership)
                .await
                .change_context(PaxosError)
                .attach("acceptor connections stopped")
        };
        let observer = async {
            self.observer
                .start(&cancel, membership)
                .await
                .change_context(PaxosError)
                .attach("observer stopped")
        };

        tokio::try_join!(acceptors, observer)?;
        Ok(())
    }
}

/// Collects everything a [`Paxos`] participant needs.
///
/// Missing pieces are reported together by [`validate`](Self::validate)
/// before anything is opened.
pub struct PaxosBuilder<L, G, AD, OD> {
    ids: Option<G>,
    promise_log: Option<L>,
    accepted_log: Option<L>,
    recorded_log: Option<L>,
    acceptor_dialer: Option<AD>,
    observer_dialer: Option<OD>,
    backoff: BackoffConfig,
}

impl<L, G, AD, OD> Default for PaxosBuilder<L, G, AD, OD> {
    fn default() -> Self {
        Self {
            ids: None,
            promise_log: None,
            accepted_log: None,
            recorded_log: None,
            acceptor_dialer: None,
            observer_dialer: None,
            backoff: BackoffConfig::default(),
        }
    }
}

impl<L, G, AD, OD> PaxosBuilder<L, G, AD, OD> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn id_generator(mut self, ids: G) -> Self {
        self.ids = Some(ids);
        self
    }

    #[must_use]
    pub fn promise_log(mut self, log: L) -> Self {
        self.promise_log = Some(log);
        self
    }

    #[must_use]
    pub fn accepted_log(mut self, log: L) -> Self {
        self.accepted_log = Some(log);
        self
    }

    #[must_use]
    pub fn recorded_log(mut self, log: L) -> Self {
        self.recorded_log = Some(log);
        self
    }

    #[must_use]
    pub fn acceptor_dialer(mut self, dialer: AD) -> Self {
        self.acceptor_dialer = Some(dialer);
        self
    }

    #[must_use]
    pub fn observer_dialer(mut self, dialer: OD) -> Self {
        self.observer_dialer = Some(dialer);
        self
    }

    #[must_use]
    pub fn backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Check that every required piece has been provided.
    ///
    /// # Errors
    ///
    /// Lists every missing piece.
    pub fn validate(&self) -> Result<(), Report<ConfigError>> {
        let missing = [
            (self.ids.is_none(), "missing id generator"),
            (self.promise_log.is_none(), "missing promise log"),
            (self.accepted_log.is_none(), "missing accepted log"),
            (self.recorded_log.is_none(), "missing recorded log"),
            (self.acceptor_dialer.is_none(), "missing acceptor dialer"),
            (self.observer_dialer.is_none(), "missing observer dialer"),
        ];

        let mut report: Option<Report<ConfigError>> = None;
        for (is_missing, what) in missing {
            if is_missing {
                report = Some(match report {
                    Some(report) => report.attach(what),
                    None => Report::new(ConfigError).attach(what),
                });
            }
        }
        match report {
            Some(report) => Err(report),
            None => Ok(()),
        }
    }
}

impl<L: Log, G, AD, OD> PaxosBuilder<L, G, AD, OD> {
    /// Derive the promise, accepted and recorded logs from one root log.
    #[must_use]
    pub fn logs(self, root: &L) -> Self {
        self.promise_log(root.with_prefix(PROMISED_PREFIX))
            .accepted_log(root.with_prefix(ACCEPTED_PREFIX))
            .recorded_log(root.with_prefix(RECORDED_PREFIX))
    }
}

impl<L, G, D: Dialer> PaxosBuilder<L, G, D, D> {
    /// Use one dialer for both acceptor and observer connections.
    #[must_use]
    pub fn dialer(self, dialer: D) -> Self {
        self.acceptor_dialer(dialer.clone()).observer_dialer(dialer)
    }
}

impl<L, G, AD, OD> PaxosBuilder<L, G, AD, OD>
where
    L: Log,
    G: IdGenerator,
    AD: Dialer,
    AD::Client: AcceptorClient,
    OD: Dialer,
    OD::Client: ObserverClient,
{
    /// Open the logs and assemble the participant.
    ///
    /// # Errors
    ///
    /// Fails if configuration is incomplete or a log cannot be read.
    pub fn build(self) -> Result<Paxos<L, G, AD, OD>, Report<ConfigError>> {
        self.validate()?;
        let (
            Some(ids),
            Some(promise_log),
            Some(accepted_log),
            Some(recorded_log),
            Some(acceptor_dialer),
            Some(observer_dialer),
        ) = (
            self.ids,
            self.promise_log,
            self.accepted_log,
            self.recorded_log,
            self.acceptor_dialer,
            self.observer_dialer,
        )
        else {
            return Err(Report::new(ConfigError).attach("incomplete configuration"));
        };

        let acceptor = Acceptor::open(promise_log, accepted_log)
            .change_context(ConfigError)
            .attach("failed to open acceptor")?;
        let observer = Observer::open(recorded_log, observer_dialer)
            .change_context(ConfigError)
            .attach("failed to open observer")?
            .with_backoff(self.backoff.clone());
        let client = MultiAcceptorClient::with_backoff(acceptor_dialer, self.backoff.clone());
        let proposer = Proposer::with_backoff(ids, client, self.backoff);

        Ok(Paxos {
            acceptor,
            proposer,
            observer,
        })
    }
}
