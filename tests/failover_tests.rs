//! Integration tests for leadership loss and handover.

mod common;

use std::time::Duration;

use common::{spawn_cluster, wait_for_leader, wait_until};

/// When the leader dies and peers observe it down, the survivors elect a
/// replacement without waiting for the full follower timeout.
#[tokio::test]
async fn leader_death_triggers_reelection() {
    let mut nodes = spawn_cluster(3).await;

    let leader_idx = wait_for_leader(&nodes, Duration::from_secs(10))
        .await
        .expect("cluster should elect a leader");
    let (old_leader, old_incarnation) = nodes[leader_idx].handle.get_leader().unwrap();

    // Kill the leader and tell the survivors.
    let dead = nodes.remove(leader_idx);
    dead.shutdown().await;
    for n in &nodes {
        n.monitor.mark_down(&old_leader);
    }

    let new_idx = wait_for_leader(&nodes, Duration::from_secs(10))
        .await
        .expect("survivors should elect a replacement");
    let (new_leader, new_incarnation) = nodes[new_idx].handle.get_leader().unwrap();

    assert_ne!(new_leader, old_leader);
    assert!(
        new_incarnation.term.number > old_incarnation.term.number,
        "the replacement must outbid the dead leader's term"
    );
}

/// A proposer giving up its term dethrones the leader; the cluster moves
/// on to a fresh incarnation.
#[tokio::test]
async fn finished_term_steps_the_leader_down() {
    let nodes = spawn_cluster(3).await;

    let leader_idx = wait_for_leader(&nodes, Duration::from_secs(10))
        .await
        .expect("cluster should elect a leader");
    let (_, old_incarnation) = nodes[leader_idx].handle.get_leader().unwrap();

    nodes[leader_idx]
        .handle
        .note_term_finished(
            old_incarnation.history_id.clone(),
            old_incarnation.term.clone(),
        )
        .await;

    let changed = wait_until(Duration::from_secs(10), || {
        nodes.iter().any(|n| {
            n.handle
                .get_leader()
                .is_some_and(|(_, incarnation)| incarnation != old_incarnation)
        })
    })
    .await;
    assert!(changed, "a fresh incarnation should take over");
}

/// `wait_for_leader` with a previous incarnation blocks until a different
/// incarnation is established.
#[tokio::test]
async fn waiter_outlives_the_incarnation_it_knew() {
    let mut nodes = spawn_cluster(3).await;

    let leader_idx = wait_for_leader(&nodes, Duration::from_secs(10))
        .await
        .expect("cluster should elect a leader");
    let (old_leader, old_incarnation) = nodes[leader_idx].handle.get_leader().unwrap();

    let follower_idx = (leader_idx + 1) % nodes.len();
    let watch = nodes[follower_idx].handle.leader_watch();
    let waiter = {
        let prev = old_incarnation.clone();
        tokio::spawn(async move { watch.wait_for_leader(Some(&prev), Duration::from_secs(15)).await })
    };

    let dead = nodes.remove(leader_idx);
    dead.shutdown().await;
    for n in &nodes {
        n.monitor.mark_down(&old_leader);
    }

    let (new_leader, new_incarnation) = waiter
        .await
        .unwrap()
        .expect("the waiter should see the replacement");
    assert_ne!(new_incarnation, old_incarnation);
    assert!(nodes.iter().any(|n| n.peer_id == new_leader));
}
