//! One-shot election worker.
//!
//! Spawned on entering the candidate state. Snapshots the agent's
//! metadata, fans out vote requests to the quorum peers, and reports a
//! single typed outcome back to the leader task. Timing is owned by the
//! leader task: if this worker stalls, the candidate watchdog kills it.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{FuturesUnordered, StreamExt};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::agent::Agent;
use crate::rpc::{RequestMsg, ResponseMsg, VoteReply, VoteRequest};
use crate::transport::PeerTransport;
use crate::types::{HistoryId, PeerId, Term};

/// A won election: the history it was won in and the highest term seen
/// across the electorate. The new leader's term is the successor of
/// `max_term`.
#[derive(Debug, Clone)]
pub(crate) struct ElectionWin {
    pub history_id: HistoryId,
    pub max_term: Term,
}

#[derive(Debug, Clone, thiserror::Error)]
pub(crate) enum ElectionError {
    #[error("this node is not a voter in the current config")]
    NotVoter,
    #[error("no quorum: {granted} of {asked} peers granted")]
    NoQuorum { granted: usize, asked: usize },
    #[error("metadata unavailable: {0}")]
    Metadata(#[from] crate::agent::AgentError),
}

/// Run one election round. Returns when the vote is decided.
pub(crate) async fn run_election(
    me: PeerId,
    agent: Arc<dyn Agent>,
    transport: Arc<PeerTransport>,
    request_timeout: Duration,
    extra_wait: Duration,
) -> Result<ElectionWin, ElectionError> {
    let meta = agent.get_metadata()?;
    let history_id = meta.history_id.clone();
    let position = meta.position();
    let quorum = meta.config.quorum.clone();
    let voters = quorum.peers();

    if !voters.contains(&me) {
        return Err(ElectionError::NotVoter);
    }

    let others: Vec<PeerId> = voters.iter().filter(|p| **p != me).cloned().collect();
    if others.is_empty() {
        // Trivial quorum of one.
        return Ok(ElectionWin {
            history_id,
            max_term: meta.term,
        });
    }

    info!(
        history = %history_id,
        position = %position,
        peers = others.len(),
        "Requesting votes"
    );

    let mut replies: FuturesUnordered<_> = others
        .iter()
        .map(|peer| {
            let peer = peer.clone();
            let transport = Arc::clone(&transport);
            let request = RequestMsg::Vote(VoteRequest {
                candidate: me.clone(),
                history_id: history_id.clone(),
                position: position.clone(),
            });
            async move {
                let result = transport.call(&peer, request, request_timeout).await;
                (peer, result)
            }
        })
        .collect();

    let mut votes: BTreeSet<PeerId> = BTreeSet::from([me]);
    let mut max_term = meta.term;

    while let Some((peer, result)) = replies.next().await {
        if let Some(peer_term) = vote_of(&peer, result) {
            if peer_term.number > max_term.number {
                max_term = peer_term;
            }
            votes.insert(peer);
            if quorum.satisfied_by(&votes) {
                // Quorum is in, but a still-outstanding reply may know a
                // higher term. Keep collecting for a bounded window so the
                // new term outbids everything the electorate saw.
                extra_collect(&mut replies, &mut max_term, extra_wait).await;
                return Ok(ElectionWin {
                    history_id,
                    max_term,
                });
            }
        }
    }

    Err(ElectionError::NoQuorum {
        granted: votes.len(),
        asked: others.len() + 1,
    })
}

type PeerReply = (
    PeerId,
    Result<ResponseMsg, crate::transport::TransportError>,
);

/// Extract the granted term from a vote reply, logging everything else.
fn vote_of(peer: &PeerId, result: Result<ResponseMsg, crate::transport::TransportError>) -> Option<Term> {
    match result {
        Ok(ResponseMsg::Vote(VoteReply::Granted { latest_term })) => {
            debug!(peer = %peer, term = %latest_term, "Vote granted");
            Some(latest_term)
        }
        Ok(ResponseMsg::Vote(VoteReply::Refused(reason))) => {
            debug!(peer = %peer, reason = %reason, "Vote refused");
            None
        }
        Ok(other) => {
            warn!(peer = %peer, ?other, "Unexpected vote response");
            None
        }
        Err(e) => {
            debug!(peer = %peer, error = %e, "Vote request failed");
            None
        }
    }
}

async fn extra_collect(
    replies: &mut FuturesUnordered<impl std::future::Future<Output = PeerReply>>,
    max_term: &mut Term,
    extra_wait: Duration,
) {
    let deadline = Instant::now() + extra_wait;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match tokio::time::timeout(remaining, replies.next()).await {
            Ok(Some((peer, result))) => {
                if let Some(peer_term) = vote_of(&peer, result) {
                    if peer_term.number > max_term.number {
                        *max_term = peer_term;
                    }
                }
            }
            // All replies in, or the window closed.
            Ok(None) | Err(_) => return,
        }
    }
}
