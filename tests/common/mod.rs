//! Shared test helpers for chronicle integration tests.
//!
//! Spins up multi-node clusters on localhost with real TCP, in-memory
//! agents, and a stub proposer that plays the proposer's part of the
//! contract: confirming tentative leaders via term establishment.

// Each test binary compiles this module independently and only uses a subset
// of exports, so unused items are expected.
#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use chronicle::{
    ClusterConfig, Config, EventBus, HistoryId, LeaderHandle, LeaderStatus, LeaderWatch,
    MemoryAgent, Metadata, PeerId, PeerMonitor, Quorum, Term,
};

// ============================================================================
// Port allocation
// ============================================================================

/// Bind to port 0 and return the OS-assigned port.
///
/// The listener is dropped immediately so the port is available for the
/// node to bind. There's a small race window, but it's fine for tests.
pub fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

// ============================================================================
// Cluster helpers
// ============================================================================

/// A running test node.
pub struct TestNode {
    pub peer_id: PeerId,
    pub handle: LeaderHandle,
    pub agent: Arc<MemoryAgent>,
    pub monitor: PeerMonitor,
    pub history_id: HistoryId,
    proposer: Option<tokio::task::JoinHandle<()>>,
}

impl TestNode {
    /// Whether this node currently sees itself as the established leader.
    pub fn is_leader(&self) -> bool {
        matches!(self.handle.get_leader(), Some((leader, _)) if leader == self.peer_id)
    }

    pub async fn shutdown(mut self) {
        if let Some(proposer) = self.proposer.take() {
            proposer.abort();
        }
        self.handle.shutdown().await;
    }
}

/// Fast timings so clusters converge quickly in tests.
pub fn test_config(peer_id: PeerId, listen_addr: String) -> Config {
    Config {
        peer_id,
        listen_addr,
        heartbeat_interval: Duration::from_millis(50),
        check_member_after: Duration::from_millis(300),
        check_member_timeout: Duration::from_secs(2),
        ..Config::default()
    }
}

pub fn cluster_metadata(
    me: &PeerId,
    members: &BTreeMap<PeerId, u64>,
    history_id: HistoryId,
) -> Metadata {
    let voters: BTreeSet<PeerId> = members.keys().cloned().collect();
    Metadata {
        peer: me.clone(),
        peer_incarnation: members[me],
        history_id,
        term: Term::initial(),
        config: ClusterConfig {
            quorum: Quorum::Majority(voters),
            members: members.clone(),
        },
        high_seqno: 0,
        high_term: Term::initial(),
        pending_branch: None,
    }
}

/// The proposer's side of the contract: whenever this node wins a
/// tentative term, commit it so the leadership becomes established.
fn stub_proposer(
    peer_id: PeerId,
    agent: Arc<MemoryAgent>,
    watch: LeaderWatch,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut rx = watch.subscribe();
        loop {
            let tentative = {
                let info = rx.borrow_and_update();
                info.as_ref().and_then(|info| {
                    (info.leader == peer_id && info.status == LeaderStatus::Tentative)
                        .then(|| info.term.clone())
                })
            };
            if let Some(term) = tentative {
                agent.establish_term(term);
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    })
}

/// Spawn a single provisioned node.
pub fn spawn_node(
    me: &PeerId,
    listen_addr: String,
    members: &BTreeMap<PeerId, u64>,
    history_id: HistoryId,
    with_proposer: bool,
) -> TestNode {
    let bus = EventBus::new();
    let agent = Arc::new(MemoryAgent::new(bus.clone()));
    agent.provision(cluster_metadata(me, members, history_id.clone()));

    let monitor = PeerMonitor::new();
    let handle = LeaderHandle::spawn(
        test_config(me.clone(), listen_addr),
        Arc::clone(&agent) as Arc<dyn chronicle::Agent>,
        monitor.clone(),
        &bus,
    );

    let proposer = with_proposer
        .then(|| stub_proposer(me.clone(), Arc::clone(&agent), handle.leader_watch()));

    TestNode {
        peer_id: me.clone(),
        handle,
        agent,
        monitor,
        history_id,
        proposer,
    }
}

/// Spawn a cluster of N nodes on localhost with random ports.
pub async fn spawn_cluster(n: usize) -> Vec<TestNode> {
    spawn_cluster_opts(n, true).await
}

/// Like [`spawn_cluster`], optionally without the stub proposers (so
/// leaders stay tentative forever).
pub async fn spawn_cluster_opts(n: usize, with_proposer: bool) -> Vec<TestNode> {
    assert!(n >= 1, "cluster must have at least 1 node");

    // Allocate ports first so every node knows the full member list at
    // startup.
    let ports: Vec<u16> = (0..n).map(|_| free_port()).collect();
    let members: BTreeMap<PeerId, u64> = ports
        .iter()
        .map(|port| (PeerId::new(format!("127.0.0.1:{port}")), 1))
        .collect();

    let mut nodes = Vec::with_capacity(n);
    for port in &ports {
        let me = PeerId::new(format!("127.0.0.1:{port}"));
        let listen_addr = format!("127.0.0.1:{port}");
        nodes.push(spawn_node(&me, listen_addr, &members, HistoryId(1), with_proposer));
    }

    // Everybody considers everybody else reachable to begin with.
    for node in &nodes {
        for peer in members.keys() {
            if *peer != node.peer_id {
                node.monitor.mark_up(peer.clone());
            }
        }
    }

    nodes
}

// ============================================================================
// Waiting
// ============================================================================

/// Wait until exactly one node sees itself as the established leader (up
/// to `timeout`). Returns the index of the leader node.
pub async fn wait_for_leader(nodes: &[TestNode], timeout: Duration) -> Option<usize> {
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        let leaders: Vec<usize> = nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.is_leader())
            .map(|(i, _)| i)
            .collect();

        if leaders.len() == 1 {
            return Some(leaders[0]);
        }

        if tokio::time::Instant::now() >= deadline {
            return None;
        }

        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

/// Wait until every node reports the same established leader (up to
/// `timeout`). Returns that leader.
pub async fn wait_for_agreement(nodes: &[TestNode], timeout: Duration) -> Option<PeerId> {
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        let views: Vec<Option<PeerId>> = nodes
            .iter()
            .map(|n| n.handle.get_leader().map(|(leader, _)| leader))
            .collect();

        if let Some(Some(first)) = views.first() {
            if views.iter().all(|v| v.as_ref() == Some(first)) {
                return Some(first.clone());
            }
        }

        if tokio::time::Instant::now() >= deadline {
            return None;
        }

        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

/// Wait until `predicate` holds (up to `timeout`).
pub async fn wait_until(timeout: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if predicate() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}
