//! Process-wide event plumbing consumed by the leader task: the metadata
//! event bus fed by the agent, and the peer liveness monitor.

use std::collections::BTreeSet;
use std::sync::{Arc, RwLock};

use tokio::sync::broadcast;

use crate::agent::Metadata;
use crate::types::{ClusterConfig, HistoryId, PeerId, Term};

const BUS_CAPACITY: usize = 128;

/// Metadata events, delivered in commit order.
#[derive(Debug, Clone)]
pub enum ClusterEvent {
    /// The system became provisioned (including re-provisioning of a
    /// previously removed node).
    SystemProvisioned(Metadata),
    /// The local node was removed from the cluster.
    SystemRemoved(Metadata),
    /// The log switched to a new history. Invalidates all leader state.
    NewHistory {
        history_id: HistoryId,
        metadata: Metadata,
    },
    /// The proposer confirmed quorum commit in `term`.
    TermEstablished { term: Term },
    /// A new cluster configuration was committed.
    NewConfig {
        config: ClusterConfig,
        metadata: Metadata,
    },
}

/// Broadcast bus carrying [`ClusterEvent`]s from the agent to subscribers.
///
/// Write-only for the leader subsystem; the agent (or the embedding
/// process) publishes.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ClusterEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    /// Publish an event. A send with no subscribers is not an error.
    pub fn publish(&self, event: ClusterEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Peer reachability change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    Up(PeerId),
    Down(PeerId),
}

/// Shared view of which remote peers are currently reachable.
///
/// The liveness decision itself is made elsewhere (the embedding process,
/// or the test harness); the leader task only reads the set and reacts to
/// up/down notifications.
#[derive(Debug, Clone)]
pub struct PeerMonitor {
    live: Arc<RwLock<BTreeSet<PeerId>>>,
    tx: broadcast::Sender<PeerEvent>,
}

impl PeerMonitor {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self {
            live: Arc::new(RwLock::new(BTreeSet::new())),
            tx,
        }
    }

    /// Record `peer` as reachable. Notifies subscribers only on change.
    pub fn mark_up(&self, peer: PeerId) {
        let changed = self.live.write().expect("peer set poisoned").insert(peer.clone());
        if changed {
            tracing::debug!(peer = %peer, "Peer up");
            let _ = self.tx.send(PeerEvent::Up(peer));
        }
    }

    /// Record `peer` as unreachable. Notifies subscribers only on change.
    pub fn mark_down(&self, peer: &PeerId) {
        let changed = self.live.write().expect("peer set poisoned").remove(peer);
        if changed {
            tracing::debug!(peer = %peer, "Peer down");
            let _ = self.tx.send(PeerEvent::Down(peer.clone()));
        }
    }

    pub fn is_live(&self, peer: &PeerId) -> bool {
        self.live.read().expect("peer set poisoned").contains(peer)
    }

    pub fn live_peers(&self) -> BTreeSet<PeerId> {
        self.live.read().expect("peer set poisoned").clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.tx.subscribe()
    }
}

impl Default for PeerMonitor {
    fn default() -> Self {
        Self::new()
    }
}
