//! Integration tests for membership self-verification.

mod common;

use std::collections::BTreeMap;
use std::time::Duration;

use chronicle::{Agent, ClusterConfig, PeerId, Quorum, SystemState};
use common::{spawn_cluster, wait_for_leader, wait_until};

fn config_without(members: &BTreeMap<PeerId, u64>, excluded: &PeerId) -> ClusterConfig {
    let members: BTreeMap<PeerId, u64> = members
        .iter()
        .filter(|(p, _)| *p != excluded)
        .map(|(p, i)| (p.clone(), *i))
        .collect();
    ClusterConfig {
        quorum: Quorum::Majority(members.keys().cloned().collect()),
        members,
    }
}

/// A node removed behind its back stops hearing heartbeats, probes its
/// peers, learns it is gone, and marks its own agent removed.
#[tokio::test]
async fn silently_removed_node_marks_itself_removed() {
    let nodes = spawn_cluster(3).await;

    let leader_idx = wait_for_leader(&nodes, Duration::from_secs(10))
        .await
        .expect("cluster should elect a leader");

    // Pick a follower to remove.
    let victim_idx = (leader_idx + 1) % nodes.len();
    let victim = nodes[victim_idx].peer_id.clone();
    let members: BTreeMap<PeerId, u64> =
        nodes.iter().map(|n| (n.peer_id.clone(), 1)).collect();

    // Commit the new config everywhere except on the victim itself: from
    // its point of view the removal is silent.
    for (i, n) in nodes.iter().enumerate() {
        if i != victim_idx {
            n.agent.set_config(config_without(&members, &victim));
        }
    }

    let removed = wait_until(Duration::from_secs(15), || {
        matches!(
            nodes[victim_idx].agent.get_system_state(),
            SystemState::Removed(_)
        )
    })
    .await;
    assert!(removed, "the victim should learn of its removal and self-mark");

    // The rest of the cluster keeps its leader.
    assert!(nodes
        .iter()
        .enumerate()
        .any(|(i, n)| i != victim_idx && n.is_leader()));
}

/// A member that merely lost contact with the leader probes its peers,
/// hears it is still wanted, and stays provisioned.
#[tokio::test]
async fn member_in_good_standing_stays_provisioned() {
    let nodes = spawn_cluster(3).await;

    let leader_idx = wait_for_leader(&nodes, Duration::from_secs(10))
        .await
        .expect("cluster should elect a leader");

    // The leader stops considering one follower reachable: its heartbeats
    // no longer flow there, but the config still lists the node.
    let isolated_idx = (leader_idx + 1) % nodes.len();
    let isolated = nodes[isolated_idx].peer_id.clone();
    nodes[leader_idx].monitor.mark_down(&isolated);

    // Long enough for the follower timeout plus several probe windows.
    tokio::time::sleep(Duration::from_secs(3)).await;

    for n in &nodes {
        assert!(matches!(
            n.agent.get_system_state(),
            SystemState::Provisioned(_)
        ));
    }
    assert!(nodes[leader_idx].is_leader(), "the leader should be undisturbed");
}
