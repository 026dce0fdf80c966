//! Per-round vote tallying for learners.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use bytes::Bytes;

use crate::messages::Proposal;

/// Decided rounds remembered so that late votes for them are dropped.
const RETAINED_ROUNDS: usize = 1024;

/// Counts which members reported each `(id, value)` pair.
///
/// A round is reported exactly once, when the number of distinct members
/// reporting one of its values first reaches the quorum. Later votes for a
/// decided round are dropped. Only the newest decided rounds are remembered;
/// votes for rounds older than those are ignored outright, and the oldest
/// pending pairs are evicted once too many are waiting.
#[derive(Debug)]
pub struct Tally {
    votes: BTreeMap<(u64, Bytes), HashSet<String>>,
    decided: BTreeSet<u64>,
    /// Votes for ids below this are too old to track.
    floor: u64,
    quorum: usize,
    retain: usize,
}

impl Tally {
    #[must_use]
    pub fn new(quorum: usize) -> Self {
        Self::with_retention(quorum, RETAINED_ROUNDS)
    }

    /// Like [`new`](Self::new), but remembering at most `rounds` decided
    /// rounds and `rounds` pending pairs.
    #[must_use]
    pub fn with_retention(quorum: usize, rounds: usize) -> Self {
        Self {
            votes: BTreeMap::new(),
            decided: BTreeSet::new(),
            floor: 0,
            quorum,
            retain: rounds.max(1),
        }
    }

    #[must_use]
    pub fn quorum(&self) -> usize {
        self.quorum
    }

    /// Change the quorum, returning every pending pair that already meets
    /// the new one.
    #[must_use]
    pub fn set_quorum(&mut self, quorum: usize) -> Vec<Proposal> {
        self.quorum = quorum;
        let ready: Vec<(u64, Bytes)> = self
            .votes
            .iter()
            .filter(|(_, members)| self.reached(members.len()))
            .map(|(key, _)| key.clone())
            .collect();

        let mut decided = Vec::new();
        for key in ready {
            // a competing value of the same round may have just been decided
            if self.votes.contains_key(&key) {
                decided.push(self.decide(key));
            }
        }
        decided
    }

    /// Record that `member` reported `proposal`.
    ///
    /// Returns the proposal once it has been reported by a quorum. A quorum
    /// of zero is treated as unknown and never completes.
    pub fn track(&mut self, member: &str, proposal: Proposal) -> Option<Proposal> {
        if proposal.is_rejected()
            || proposal.id < self.floor
            || self.decided.contains(&proposal.id)
        {
            return None;
        }

        let Proposal { id, value } = proposal;
        let key = (id, value);
        let members = self.votes.entry(key.clone()).or_default();
        members.insert(member.to_owned());
        let count = members.len();

        if self.reached(count) {
            return Some(self.decide(key));
        }

        while self.votes.len() > self.retain {
            self.votes.pop_first();
        }
        None
    }

    /// Number of `(id, value)` pairs still waiting for a quorum.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.votes.len()
    }

    fn reached(&self, members: usize) -> bool {
        self.quorum != 0 && members >= self.quorum
    }

    fn decide(&mut self, key: (u64, Bytes)) -> Proposal {
        let (id, value) = key;

        let round: Vec<(u64, Bytes)> = self
            .votes
            .range((id, Bytes::new())..)
            .take_while(|((other, _), _)| *other == id)
            .map(|(key, _)| key.clone())
            .collect();
        for key in round {
            self.votes.remove(&key);
        }

        self.decided.insert(id);
        while self.decided.len() > self.retain {
            if let Some(oldest) = self.decided.pop_first() {
                self.floor = self.floor.max(oldest.saturating_add(1));
            }
        }
        self.votes = self.votes.split_off(&(self.floor, Bytes::new()));

        Proposal { id, value }
    }
}
