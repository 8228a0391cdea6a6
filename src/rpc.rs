//! Wire protocol types for inter-node leader traffic.
//!
//! Frames come in three flavors: fire-and-forget events (heartbeats,
//! stepping-down announcements), requests tagged with a correlation id,
//! and responses echoing that id. All frames target the `leader` endpoint
//! of the receiving node.

use serde::{Deserialize, Serialize};

use crate::types::{HistoryId, LeaderInfo, LogPosition, PeerId, Term};

/// Tagged envelope for the TCP wire protocol (MessagePack encoded).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub(crate) enum Frame {
    /// Fire-and-forget; no reply is ever produced.
    Event(EventMsg),
    /// Correlated request; the receiver replies with the same id.
    Request { id: u64, request: RequestMsg },
    /// Reply to an earlier `Request` on the same connection.
    Response { id: u64, response: ResponseMsg },
}

// ============================================================================
// Events (one-way)
// ============================================================================

#[derive(Debug, Clone, Deserialize, Serialize)]
pub(crate) enum EventMsg {
    /// Periodic leader liveness announcement carrying the full snapshot.
    Heartbeat(LeaderInfo),
    /// The sending leader is about to leave the leader state.
    SteppingDown(LeaderInfo),
}

// ============================================================================
// Requests / responses
// ============================================================================

#[derive(Debug, Clone, Deserialize, Serialize)]
pub(crate) enum RequestMsg {
    Vote(VoteRequest),
    MemberCheck(MemberCheckRequest),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub(crate) enum ResponseMsg {
    Vote(VoteReply),
    MemberCheck(MemberCheckReply),
}

/// A candidate asking for this node's vote.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub(crate) struct VoteRequest {
    pub candidate: PeerId,
    pub history_id: HistoryId,
    pub position: LogPosition,
}

/// The voter's answer.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub(crate) enum VoteReply {
    /// Vote granted; carries the voter's latest known term so the winner
    /// outbids every term seen by its electorate.
    Granted { latest_term: Term },
    Refused(VoteRefusal),
}

/// Why a vote was withheld.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub(crate) enum VoteRefusal {
    /// The voter is running its own election.
    InElection,
    /// The voter is probing its own membership.
    CheckMember,
    /// The voter already tracks a leader.
    HaveLeader(LeaderInfo),
    /// The voter's agent refused (history mismatch, stale position,
    /// duplicate-term candidacy).
    AgentRefused(String),
}

impl std::fmt::Display for VoteRefusal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VoteRefusal::InElection => write!(f, "in_election"),
            VoteRefusal::CheckMember => write!(f, "check_member"),
            VoteRefusal::HaveLeader(info) => write!(f, "have_leader({info})"),
            VoteRefusal::AgentRefused(reason) => write!(f, "agent: {reason}"),
        }
    }
}

/// A node asking whether it is still a cluster member.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub(crate) struct MemberCheckRequest {
    pub history_id: HistoryId,
    pub peer: PeerId,
    pub peer_incarnation: u64,
    pub peer_seqno: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub(crate) enum MemberCheckReply {
    /// Whether the asking node is a member per the receiver's config.
    Known(bool),
    /// The receiver could not answer (history mismatch, not provisioned).
    Unknown(String),
}
