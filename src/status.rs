//! Process-wide leader publication and waiting clients.
//!
//! The leader task is the single writer of a watch cell holding the latest
//! leader snapshot. Readers take lock-free snapshots; waiters subscribe to
//! the same cell, so no explicit registry is needed: a waiter's
//! registration is its subscription, dropped when the call returns or
//! times out.

use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;

use crate::types::{Incarnation, LeaderInfo, LeaderStatus, PeerId};

/// Raised when no established leader is visible within the allowed time.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("no leader")]
pub struct NoLeader;

/// Writer half, owned by the leader task.
#[derive(Clone)]
pub(crate) struct LeaderPublisher {
    tx: watch::Sender<Option<LeaderInfo>>,
}

impl LeaderPublisher {
    /// Publish a new snapshot. Waiters are woken even if the value is
    /// unchanged, which is what a forced re-announce wants.
    pub fn publish(&self, info: Option<LeaderInfo>) {
        self.tx.send_replace(info);
    }

    pub fn current(&self) -> Option<LeaderInfo> {
        self.tx.borrow().clone()
    }
}

/// Read side of the leader publication. Cheap to clone.
#[derive(Debug, Clone)]
pub struct LeaderWatch {
    rx: watch::Receiver<Option<LeaderInfo>>,
}

pub(crate) fn leader_cell() -> (LeaderPublisher, LeaderWatch) {
    let (tx, rx) = watch::channel(None);
    (LeaderPublisher { tx }, LeaderWatch { rx })
}

impl LeaderWatch {
    /// The current leader, if one is established.
    ///
    /// Tentative leaders are never returned: a leader only becomes visible
    /// once the proposer has confirmed quorum commit in its term.
    pub fn get_leader(&self) -> Option<(PeerId, Incarnation)> {
        visible(self.rx.borrow().as_ref())
    }

    /// Raw snapshot including tentative leaders. For diagnostics, not for
    /// client routing.
    pub fn peek(&self) -> Option<LeaderInfo> {
        self.rx.borrow().clone()
    }

    /// Wait until an established leader with an incarnation different from
    /// `prev` is visible, or `timeout` elapses.
    ///
    /// Passing `None` as `prev` waits for any established leader. Returns
    /// immediately when the current snapshot already qualifies.
    pub async fn wait_for_leader(
        &self,
        prev: Option<&Incarnation>,
        timeout: Duration,
    ) -> Result<(PeerId, Incarnation), NoLeader> {
        let mut rx = self.rx.clone();
        let result = {
            let wait = rx.wait_for(|info| match visible(info.as_ref()) {
                Some((_, incarnation)) => prev != Some(&incarnation),
                None => false,
            });

            match tokio::time::timeout(timeout, wait).await {
                Ok(Ok(info)) => Ok(visible(info.as_ref()).expect("predicate guarantees a leader")),
                // The publisher is gone: the subsystem shut down.
                Ok(Err(_)) => Err(NoLeader),
                Err(_) => Err(NoLeader),
            }
        };
        result
    }

    /// Subscribe to every published snapshot change.
    pub fn subscribe(&self) -> watch::Receiver<Option<LeaderInfo>> {
        self.rx.clone()
    }
}

fn visible(info: Option<&LeaderInfo>) -> Option<(PeerId, Incarnation)> {
    match info {
        Some(info) if info.status == LeaderStatus::Established => {
            Some((info.leader.clone(), info.incarnation()))
        }
        _ => None,
    }
}
