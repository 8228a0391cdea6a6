//! Agent contract and default in-memory implementation.
//!
//! The agent is the metadata/log engine: it persists the current history,
//! the latest term, and the cluster configuration, and it arbitrates vote
//! grants. The leader subsystem only consumes this interface; `MemoryAgent`
//! is a batteries-included implementation for embedding and tests.

use std::sync::Mutex;

use crate::events::{ClusterEvent, EventBus};
use crate::types::{ClusterConfig, HistoryId, LogPosition, PeerId, Term};

// ============================================================================
// Contract types
// ============================================================================

/// Metadata snapshot from the agent.
#[derive(Debug, Clone)]
pub struct Metadata {
    /// The local node.
    pub peer: PeerId,
    /// The local node's incarnation id in the current config.
    pub peer_incarnation: u64,
    pub history_id: HistoryId,
    /// Latest term known to the agent.
    pub term: Term,
    pub config: ClusterConfig,
    /// Sequence number of the highest log entry.
    pub high_seqno: u64,
    /// Term of the highest log entry.
    pub high_term: Term,
    /// Set while a history switch is being negotiated.
    pub pending_branch: Option<HistoryId>,
}

impl Metadata {
    /// The node's log position, as compared during vote grants.
    pub fn position(&self) -> LogPosition {
        LogPosition::new(self.high_term.clone(), self.high_seqno)
    }

    /// Whether the local node may stand for election under this config.
    pub fn is_electable(&self) -> bool {
        self.config.is_electable(&self.peer, self.peer_incarnation)
    }
}

/// Answer to [`Agent::get_system_state`].
#[derive(Debug, Clone)]
pub enum SystemState {
    /// Normal member of a provisioned cluster.
    Provisioned(Metadata),
    /// This node has been removed from the cluster.
    Removed(Metadata),
    /// Still joining; only the history id is meaningful.
    JoiningCluster(Metadata),
    /// Anything else. The leader subsystem treats this as fatal.
    NotProvisioned,
}

/// Errors returned by agent operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AgentError {
    #[error("history mismatch: ours {ours}, requested {requested}")]
    HistoryMismatch {
        ours: HistoryId,
        requested: HistoryId,
    },
    #[error("candidate position {candidate} is behind ours {ours}")]
    PositionBehind {
        candidate: LogPosition,
        ours: LogPosition,
    },
    #[error("already voted for {voted_for} in term {term_number}")]
    AlreadyVoted {
        voted_for: PeerId,
        term_number: u64,
    },
    #[error("system is not provisioned")]
    NotProvisioned,
    #[error("peer {0} is not a member")]
    UnknownPeer(PeerId),
}

/// The metadata/log engine consumed by the leader subsystem.
///
/// Chronicle handles no persistence here; implementations decide how the
/// metadata table is stored. Methods are synchronous and must be cheap:
/// they are called from the leader task's event handlers.
pub trait Agent: Send + Sync + 'static {
    /// Current provisioning state, read at leader-task startup.
    fn get_system_state(&self) -> SystemState;

    /// Snapshot of the current metadata.
    fn get_metadata(&self) -> Result<Metadata, AgentError>;

    /// Vote-grant arbitration: may `candidate` with `position` get this
    /// node's vote in `history_id`? On grant, the vote is recorded and the
    /// latest known term is returned (the candidate outbids it).
    fn check_grant_vote(
        &self,
        candidate: &PeerId,
        history_id: &HistoryId,
        position: &LogPosition,
    ) -> Result<Term, AgentError>;

    /// Whether `peer` at `peer_incarnation` is (still) a member of the
    /// cluster in `history_id`, as far as this node's config knows.
    fn check_member(
        &self,
        history_id: &HistoryId,
        peer: &PeerId,
        peer_incarnation: u64,
        peer_seqno: u64,
    ) -> Result<bool, AgentError>;

    /// Record a term the node has learned is established, whether from
    /// its own proposer or from an established leader's heartbeat.
    /// Advances the latest known term and the log position, so future
    /// vote grants are judged against the progress the node has seen.
    fn record_established_term(
        &self,
        history_id: &HistoryId,
        term: &Term,
    ) -> Result<(), AgentError>;

    /// Record that the local node has been removed from the cluster.
    /// Implementations publish the corresponding system-state event.
    fn mark_removed(&self, peer: &PeerId, peer_incarnation: u64) -> Result<(), AgentError>;

    /// No-op reply used to flush queued events before reading state.
    fn sync(&self);
}

// ============================================================================
// MemoryAgent — default implementation
// ============================================================================

#[derive(Debug)]
struct MemoryAgentInner {
    state: SystemState,
    /// Highest term number this node granted a vote in, and to whom.
    voted: Option<(u64, PeerId)>,
}

/// In-memory [`Agent`] implementation.
///
/// Holds the metadata table behind a mutex and publishes metadata events
/// on the shared [`EventBus`]. Mutations (`provision`, `set_history`, ...)
/// model what the out-of-scope log engine would do as entries commit.
#[derive(Debug)]
pub struct MemoryAgent {
    inner: Mutex<MemoryAgentInner>,
    bus: EventBus,
}

impl MemoryAgent {
    /// Create an unprovisioned agent publishing on `bus`.
    pub fn new(bus: EventBus) -> Self {
        Self {
            inner: Mutex::new(MemoryAgentInner {
                state: SystemState::NotProvisioned,
                voted: None,
            }),
            bus,
        }
    }

    /// Provision (or re-provision) the node with `metadata`.
    pub fn provision(&self, metadata: Metadata) {
        {
            let mut inner = self.lock();
            inner.state = SystemState::Provisioned(metadata.clone());
            inner.voted = None;
        }
        self.bus.publish(ClusterEvent::SystemProvisioned(metadata));
    }

    /// Switch to a new history. Terms are scoped to a history, so both
    /// the latest term and the high entry's term restart, and the vote
    /// record is cleared.
    pub fn set_history(&self, history_id: HistoryId) {
        let metadata = {
            let mut inner = self.lock();
            let Some(meta) = inner.metadata_mut() else {
                return;
            };
            meta.history_id = history_id.clone();
            meta.term = Term::initial();
            meta.high_term = Term::initial();
            meta.pending_branch = None;
            let meta = meta.clone();
            inner.voted = None;
            meta
        };
        self.bus.publish(ClusterEvent::NewHistory {
            history_id,
            metadata,
        });
    }

    /// Commit a new cluster configuration.
    pub fn set_config(&self, config: ClusterConfig) {
        let metadata = {
            let mut inner = self.lock();
            let Some(meta) = inner.metadata_mut() else {
                return;
            };
            meta.config = config.clone();
            meta.clone()
        };
        self.bus.publish(ClusterEvent::NewConfig { config, metadata });
    }

    /// Record `term` as established (the proposer confirmed quorum
    /// commit) and advance the latest known term and the log position.
    pub fn establish_term(&self, term: Term) {
        {
            let mut inner = self.lock();
            let Some(meta) = inner.metadata_mut() else {
                return;
            };
            advance_established(meta, &term);
        }
        self.bus.publish(ClusterEvent::TermEstablished { term });
    }

    /// Advance the high log position (entries were appended).
    pub fn advance_log(&self, high_term: Term, high_seqno: u64) {
        let mut inner = self.lock();
        if let Some(meta) = inner.metadata_mut() {
            meta.high_term = high_term;
            meta.high_seqno = high_seqno;
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryAgentInner> {
        self.inner.lock().expect("agent table poisoned")
    }
}

/// The commit that establishes a term is itself a log entry: the latest
/// term and the high position advance together.
fn advance_established(meta: &mut Metadata, term: &Term) {
    if term.number > meta.term.number {
        meta.term = term.clone();
    }
    if term.number > meta.high_term.number {
        meta.high_term = term.clone();
        meta.high_seqno += 1;
    }
}

impl MemoryAgentInner {
    fn metadata(&self) -> Option<&Metadata> {
        match &self.state {
            SystemState::Provisioned(meta)
            | SystemState::Removed(meta)
            | SystemState::JoiningCluster(meta) => Some(meta),
            SystemState::NotProvisioned => None,
        }
    }

    fn metadata_mut(&mut self) -> Option<&mut Metadata> {
        match &mut self.state {
            SystemState::Provisioned(meta)
            | SystemState::Removed(meta)
            | SystemState::JoiningCluster(meta) => Some(meta),
            SystemState::NotProvisioned => None,
        }
    }
}

impl Agent for MemoryAgent {
    fn get_system_state(&self) -> SystemState {
        self.lock().state.clone()
    }

    fn get_metadata(&self) -> Result<Metadata, AgentError> {
        self.lock().metadata().cloned().ok_or(AgentError::NotProvisioned)
    }

    fn check_grant_vote(
        &self,
        candidate: &PeerId,
        history_id: &HistoryId,
        position: &LogPosition,
    ) -> Result<Term, AgentError> {
        let mut inner = self.lock();
        let Some(meta) = inner.metadata() else {
            return Err(AgentError::NotProvisioned);
        };

        if meta.history_id != *history_id {
            return Err(AgentError::HistoryMismatch {
                ours: meta.history_id.clone(),
                requested: history_id.clone(),
            });
        }
        if !position.covers(&meta.position()) {
            return Err(AgentError::PositionBehind {
                candidate: position.clone(),
                ours: meta.position(),
            });
        }
        // Refuse duplicate-term candidacies: the same term number may only
        // be re-granted to the candidate that already holds the vote.
        if let Some((term_number, voted_for)) = &inner.voted {
            if position.term_voted.number <= *term_number && candidate != voted_for {
                return Err(AgentError::AlreadyVoted {
                    voted_for: voted_for.clone(),
                    term_number: *term_number,
                });
            }
        }

        let latest = meta.term.clone();
        inner.voted = Some((position.term_voted.number, candidate.clone()));
        Ok(latest)
    }

    fn check_member(
        &self,
        history_id: &HistoryId,
        peer: &PeerId,
        peer_incarnation: u64,
        _peer_seqno: u64,
    ) -> Result<bool, AgentError> {
        let inner = self.lock();
        let Some(meta) = inner.metadata() else {
            return Err(AgentError::NotProvisioned);
        };
        if meta.history_id != *history_id {
            return Err(AgentError::HistoryMismatch {
                ours: meta.history_id.clone(),
                requested: history_id.clone(),
            });
        }
        Ok(meta.config.members.get(peer) == Some(&peer_incarnation))
    }

    fn record_established_term(
        &self,
        history_id: &HistoryId,
        term: &Term,
    ) -> Result<(), AgentError> {
        let mut inner = self.lock();
        let Some(meta) = inner.metadata_mut() else {
            return Err(AgentError::NotProvisioned);
        };
        if meta.history_id != *history_id {
            return Err(AgentError::HistoryMismatch {
                ours: meta.history_id.clone(),
                requested: history_id.clone(),
            });
        }
        advance_established(meta, term);
        Ok(())
    }

    fn mark_removed(&self, peer: &PeerId, peer_incarnation: u64) -> Result<(), AgentError> {
        let metadata = {
            let mut inner = self.lock();
            let Some(meta) = inner.metadata().cloned() else {
                return Err(AgentError::NotProvisioned);
            };
            if meta.peer != *peer || meta.peer_incarnation != peer_incarnation {
                return Err(AgentError::UnknownPeer(peer.clone()));
            }
            inner.state = SystemState::Removed(meta.clone());
            meta
        };
        self.bus.publish(ClusterEvent::SystemRemoved(metadata));
        Ok(())
    }

    fn sync(&self) {}
}
