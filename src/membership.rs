//! One-shot membership probe.
//!
//! A node that has been idle (no leader seen, no election running) asks a
//! random sample of peers whether the cluster still considers it a member.
//! A removed node would otherwise never find out: nobody heartbeats it and
//! its own elections go nowhere.

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{FuturesUnordered, StreamExt};
use rand::seq::SliceRandom;
use tracing::{debug, info, warn};

use crate::agent::Agent;
use crate::rpc::{MemberCheckReply, MemberCheckRequest, RequestMsg, ResponseMsg};
use crate::transport::PeerTransport;
use crate::types::PeerId;

/// How many peers a single probe asks at most.
const SAMPLE_SIZE: usize = 5;

#[derive(Debug, Clone)]
pub(crate) enum MemberCheckOutcome {
    /// Either confirmed as a member or no peer could say otherwise.
    Retained,
    /// A peer's config no longer lists this node.
    Removed { confirmed_by: PeerId },
}

/// Run one membership probe round.
///
/// Only a definite "you are not a member" answer counts as removal; peer
/// failures and history mismatches are logged and ignored, and the next
/// idle period retries.
pub(crate) async fn run_member_check(
    me: PeerId,
    agent: Arc<dyn Agent>,
    transport: Arc<PeerTransport>,
    request_timeout: Duration,
) -> MemberCheckOutcome {
    let meta = match agent.get_metadata() {
        Ok(meta) => meta,
        Err(e) => {
            debug!(error = %e, "Skipping membership probe, metadata unavailable");
            return MemberCheckOutcome::Retained;
        }
    };

    let mut peers: Vec<PeerId> = meta
        .config
        .members
        .keys()
        .filter(|p| **p != me)
        .cloned()
        .collect();
    if peers.is_empty() {
        return MemberCheckOutcome::Retained;
    }
    peers.shuffle(&mut rand::thread_rng());
    peers.truncate(SAMPLE_SIZE);

    debug!(sample = peers.len(), history = %meta.history_id, "Probing own membership");

    let mut replies: FuturesUnordered<_> = peers
        .into_iter()
        .map(|peer| {
            let transport = Arc::clone(&transport);
            let request = RequestMsg::MemberCheck(MemberCheckRequest {
                history_id: meta.history_id.clone(),
                peer: me.clone(),
                peer_incarnation: meta.peer_incarnation,
                peer_seqno: meta.high_seqno,
            });
            async move {
                let result = transport.call(&peer, request, request_timeout).await;
                (peer, result)
            }
        })
        .collect();

    while let Some((peer, result)) = replies.next().await {
        match result {
            Ok(ResponseMsg::MemberCheck(MemberCheckReply::Known(true))) => {
                debug!(peer = %peer, "Membership confirmed");
            }
            Ok(ResponseMsg::MemberCheck(MemberCheckReply::Known(false))) => {
                info!(peer = %peer, "Peer reports this node removed from the cluster");
                return MemberCheckOutcome::Removed { confirmed_by: peer };
            }
            Ok(ResponseMsg::MemberCheck(MemberCheckReply::Unknown(reason))) => {
                debug!(peer = %peer, reason = %reason, "Peer could not answer membership probe");
            }
            Ok(other) => {
                warn!(peer = %peer, ?other, "Unexpected membership response");
            }
            Err(e) => {
                debug!(peer = %peer, error = %e, "Membership probe failed");
            }
        }
    }

    MemberCheckOutcome::Retained
}
