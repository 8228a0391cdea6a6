//! Core identifiers and ordering rules: peers, histories, terms, positions,
//! quorums, and the leader snapshot visible to clients.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

/// Cluster-unique node identifier.
///
/// The string doubles as the transport routing key (`host:port` of the
/// node's cluster endpoint), so knowing a peer is enough to reach it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        PeerId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque epoch label for the cluster's log.
///
/// Every term, vote, and leader is scoped to a history; a history change
/// invalidates all of them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HistoryId(pub u64);

impl fmt::Display for HistoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "H{}", self.0)
    }
}

/// Term: a monotonic number within a history plus the peer that coined it.
///
/// Only the number participates in ordering; the originating peer exists
/// to attribute the term and breaks no ties. Two distinct peers can coin
/// the same number concurrently, so [`Term`] has no `Ord` impl: compare
/// the `number` fields directly.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Term {
    pub number: u64,
    /// Peer that started this term. Absent only for the seed term of a
    /// fresh history.
    pub hint: Option<PeerId>,
}

impl Term {
    /// Seed term of a fresh history.
    pub fn initial() -> Self {
        Term {
            number: 0,
            hint: None,
        }
    }

    /// The successor term coined by `peer`.
    pub fn next(&self, peer: &PeerId) -> Term {
        Term {
            number: self.number + 1,
            hint: Some(peer.clone()),
        }
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.hint {
            Some(peer) => write!(f, "T{}@{}", self.number, peer),
            None => write!(f, "T{}", self.number),
        }
    }
}

/// Position of a node's log: the term it last voted in and its high
/// sequence number.
///
/// Ordered lexicographically by term number, then sequence number. Equal
/// term numbers are required to carry identical term tuples, so the hint
/// never has to break a tie.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogPosition {
    pub term_voted: Term,
    pub high_seqno: u64,
}

impl LogPosition {
    pub fn new(term_voted: Term, high_seqno: u64) -> Self {
        Self {
            term_voted,
            high_seqno,
        }
    }

    /// Total order over positions (term number first, then seqno).
    pub fn compare(&self, other: &LogPosition) -> Ordering {
        self.term_voted
            .number
            .cmp(&other.term_voted.number)
            .then(self.high_seqno.cmp(&other.high_seqno))
    }

    /// True if this position is at least `other`: the vote-grant
    /// criterion.
    pub fn covers(&self, other: &LogPosition) -> bool {
        self.compare(other) != Ordering::Less
    }
}

impl fmt::Display for LogPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}+{}", self.term_voted, self.high_seqno)
    }
}

/// Quorum rule over a peer set.
///
/// `Joint` appears during reconfiguration and requires both sides to hold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Quorum {
    Majority(BTreeSet<PeerId>),
    All(BTreeSet<PeerId>),
    Joint(Box<Quorum>, Box<Quorum>),
}

impl Quorum {
    /// All peers mentioned anywhere in the rule.
    pub fn peers(&self) -> BTreeSet<PeerId> {
        match self {
            Quorum::Majority(set) | Quorum::All(set) => set.clone(),
            Quorum::Joint(a, b) => a.peers().union(&b.peers()).cloned().collect(),
        }
    }

    /// Whether `votes` satisfies the rule.
    pub fn satisfied_by(&self, votes: &BTreeSet<PeerId>) -> bool {
        match self {
            Quorum::Majority(set) => {
                let have = set.iter().filter(|p| votes.contains(*p)).count();
                have * 2 > set.len()
            }
            Quorum::All(set) => set.iter().all(|p| votes.contains(p)),
            Quorum::Joint(a, b) => a.satisfied_by(votes) && b.satisfied_by(votes),
        }
    }
}

/// Cluster configuration as recorded by the agent: the quorum rule plus
/// each member's incarnation id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub quorum: Quorum,
    /// Member peer → incarnation id. A peer that was removed and re-added
    /// gets a fresh id, which is how stale incarnations are told apart.
    pub members: BTreeMap<PeerId, u64>,
}

impl ClusterConfig {
    /// A node is electable when it sits in the quorum peer set under its
    /// current incarnation id.
    pub fn is_electable(&self, peer: &PeerId, peer_incarnation: u64) -> bool {
        self.quorum.peers().contains(peer) && self.members.get(peer) == Some(&peer_incarnation)
    }
}

/// Whether a leader has been confirmed by log commit yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LeaderStatus {
    /// Elected, not yet confirmed. Invisible to [`get_leader`] clients.
    Tentative,
    /// Confirmed by the proposer's quorum commit.
    Established,
}

/// Snapshot of who leads: the payload of heartbeats and of the process-wide
/// publication cell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderInfo {
    pub leader: PeerId,
    pub history_id: HistoryId,
    pub term: Term,
    pub status: LeaderStatus,
}

impl LeaderInfo {
    pub fn incarnation(&self) -> Incarnation {
        Incarnation {
            history_id: self.history_id.clone(),
            term: self.term.clone(),
        }
    }
}

impl fmt::Display for LeaderInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = match self.status {
            LeaderStatus::Tentative => "tentative",
            LeaderStatus::Established => "established",
        };
        write!(
            f,
            "{} ({}, {}, {})",
            self.leader, self.history_id, self.term, status
        )
    }
}

/// A specific leadership incarnation: the `(history, term)` pair clients
/// compare against when waiting for a *different* leader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Incarnation {
    pub history_id: HistoryId,
    pub term: Term,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(s: &str) -> PeerId {
        PeerId::new(s)
    }

    fn set(names: &[&str]) -> BTreeSet<PeerId> {
        names.iter().map(|n| peer(n)).collect()
    }

    #[test]
    fn next_term_bumps_number_and_takes_hint() {
        let t = Term::initial();
        let n = t.next(&peer("a"));
        assert_eq!(n.number, 1);
        assert_eq!(n.hint, Some(peer("a")));

        let n2 = n.next(&peer("b"));
        assert_eq!(n2.number, 2);
        assert_eq!(n2.hint, Some(peer("b")));
    }

    #[test]
    fn position_order_is_term_then_seqno() {
        let t1 = Term::initial().next(&peer("a"));
        let t2 = t1.next(&peer("a"));

        let low = LogPosition::new(t1.clone(), 100);
        let high_term = LogPosition::new(t2, 1);
        let high_seq = LogPosition::new(t1, 101);

        assert!(high_term.covers(&low));
        assert!(!low.covers(&high_term));
        assert!(high_seq.covers(&low));
        assert!(low.covers(&low));
    }

    #[test]
    fn majority_quorum() {
        let q = Quorum::Majority(set(&["a", "b", "c"]));
        assert!(q.satisfied_by(&set(&["a", "b"])));
        assert!(!q.satisfied_by(&set(&["a"])));
        // Votes outside the set don't count.
        assert!(!q.satisfied_by(&set(&["a", "x", "y"])));
    }

    #[test]
    fn all_quorum() {
        let q = Quorum::All(set(&["a", "b"]));
        assert!(q.satisfied_by(&set(&["a", "b"])));
        assert!(!q.satisfied_by(&set(&["a"])));
    }

    #[test]
    fn joint_quorum_needs_both_sides() {
        let q = Quorum::Joint(
            Box::new(Quorum::Majority(set(&["a", "b", "c"]))),
            Box::new(Quorum::Majority(set(&["c", "d", "e"]))),
        );
        assert!(q.satisfied_by(&set(&["a", "b", "c", "d"])));
        // Majority on the old side only.
        assert!(!q.satisfied_by(&set(&["a", "b"])));
        // Majority on the new side only.
        assert!(!q.satisfied_by(&set(&["d", "e"])));
        assert_eq!(q.peers(), set(&["a", "b", "c", "d", "e"]));
    }

    #[test]
    fn single_peer_majority_is_itself() {
        let q = Quorum::Majority(set(&["a"]));
        assert!(q.satisfied_by(&set(&["a"])));
        assert!(!q.satisfied_by(&set(&[])));
    }

    #[test]
    fn electability_requires_membership_and_incarnation() {
        let cfg = ClusterConfig {
            quorum: Quorum::Majority(set(&["a", "b", "c"])),
            members: [(peer("a"), 7), (peer("b"), 1), (peer("c"), 2)]
                .into_iter()
                .collect(),
        };
        assert!(cfg.is_electable(&peer("a"), 7));
        // Stale incarnation: the node was removed and re-added.
        assert!(!cfg.is_electable(&peer("a"), 6));
        assert!(!cfg.is_electable(&peer("x"), 1));
    }
}
