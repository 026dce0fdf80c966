//! In-process cluster membership.
//!
//! Tracks which peers are active, which have left gracefully and which have
//! been removed, and notifies watchers of every change. Peers that left still
//! count towards the majority; removed peers do not.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;

/// A membership update. The first change delivered to a new [`Watch`] is a
/// snapshot of all active and left peers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MembershipChange {
    pub active: Vec<String>,
    pub left: Vec<String>,
    pub removed: Vec<String>,
}

impl MembershipChange {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.active.is_empty() && self.left.is_empty() && self.removed.is_empty()
    }
}

#[derive(Default)]
struct State {
    active: BTreeSet<String>,
    left: BTreeSet<String>,
    watchers: HashMap<u64, mpsc::UnboundedSender<MembershipChange>>,
    next_watcher: u64,
}

impl State {
    fn publish(&mut self, change: &MembershipChange) {
        self.watchers.retain(|_, tx| tx.send(change.clone()).is_ok());
    }

    fn snapshot(&self) -> MembershipChange {
        MembershipChange {
            active: self.active.iter().cloned().collect(),
            left: self.left.iter().cloned().collect(),
            removed: Vec::new(),
        }
    }
}

#[derive(Clone, Default)]
pub struct Membership {
    state: Arc<Mutex<State>>,
}

impl Membership {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start with `members` already active.
    #[must_use]
    pub fn with_members<I, S>(members: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let membership = Self::new();
        {
            let mut state = membership.lock();
            state.active.extend(members.into_iter().map(Into::into));
        }
        membership
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mark `member` active. A member that had left is re-admitted.
    pub fn add(&self, member: impl Into<String>) {
        let member = member.into();
        let mut state = self.lock();
        state.left.remove(&member);
        if state.active.insert(member.clone()) {
            tracing::debug!(%member, "member joined");
            state.publish(&MembershipChange {
                active: vec![member],
                ..MembershipChange::default()
            });
        }
    }

    /// Mark `member` as gracefully departed. It still counts towards
    /// [`majority`](Self::majority).
    pub fn leave(&self, member: &str) {
        let mut state = self.lock();
        if state.active.remove(member) {
            state.left.insert(member.to_owned());
            tracing::debug!(%member, "member left");
            state.publish(&MembershipChange {
                left: vec![member.to_owned()],
                ..MembershipChange::default()
            });
        }
    }

    /// Forget `member` entirely.
    pub fn remove(&self, member: &str) {
        let mut state = self.lock();
        let was_active = state.active.remove(member);
        let was_left = state.left.remove(member);
        if was_active || was_left {
            tracing::debug!(%member, "member removed");
            state.publish(&MembershipChange {
                removed: vec![member.to_owned()],
                ..MembershipChange::default()
            });
        }
    }

    /// The current active and left members. `removed` is always empty.
    #[must_use]
    pub fn snapshot(&self) -> MembershipChange {
        self.lock().snapshot()
    }

    /// `⌈(active + left + 1) / 2⌉`
    #[must_use]
    pub fn majority(&self) -> usize {
        let state = self.lock();
        let n = state.active.len() + state.left.len();
        (n + 2) / 2
    }

    /// Subscribe to membership changes, starting with a snapshot.
    #[must_use]
    pub fn watch(&self) -> Watch {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.lock();
        let snapshot = state.snapshot();
        // the receiver is alive, so this cannot fail
        let _ = tx.send(snapshot);

        let id = state.next_watcher;
        state.next_watcher += 1;
        state.watchers.insert(id, tx);

        Watch {
            id,
            rx,
            membership: self.clone(),
        }
    }
}

impl std::fmt::Debug for Membership {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("Membership")
            .field("active", &state.active)
            .field("left", &state.left)
            .finish_non_exhaustive()
    }
}

/// A stream of [`MembershipChange`]s. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Watch {
    id: u64,
    rx: mpsc::UnboundedReceiver<MembershipChange>,
    membership: Membership,
}

impl Watch {
    /// The next change, or `None` once the watch has been unsubscribed.
    pub async fn changed(&mut self) -> Option<MembershipChange> {
        self.rx.recv().await
    }
}

impl Drop for Watch {
    fn drop(&mut self) {
        self.membership.lock().watchers.remove(&self.id);
    }
}
