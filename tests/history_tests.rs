//! Integration tests for history changes.

mod common;

use std::time::Duration;

use chronicle::HistoryId;
use common::{spawn_cluster, wait_for_agreement, wait_for_leader, wait_until};

/// A history switch invalidates the current leadership everywhere and the
/// cluster elects afresh in the new history.
#[tokio::test]
async fn new_history_resets_leadership() {
    let nodes = spawn_cluster(3).await;

    wait_for_agreement(&nodes, Duration::from_secs(10))
        .await
        .expect("cluster should agree on a leader");

    for n in &nodes {
        n.agent.set_history(HistoryId(2));
    }

    // The old leadership is cleared before any new one can be won.
    let cleared = wait_until(Duration::from_millis(200), || {
        nodes.iter().all(|n| {
            match n.handle.leader_watch().peek() {
                None => true,
                // A new-history leader is also fine; only history-1
                // leadership must be gone.
                Some(info) => info.history_id == HistoryId(2),
            }
        })
    })
    .await;
    assert!(cleared, "history-1 leadership should be withdrawn");

    let elected = wait_until(Duration::from_secs(10), || {
        nodes.iter().any(|n| {
            n.handle
                .get_leader()
                .is_some_and(|(_, incarnation)| incarnation.history_id == HistoryId(2))
        })
    })
    .await;
    assert!(elected, "a leader should be established in the new history");
}

/// Leadership established in an old history is never reported once the
/// node has moved on.
#[tokio::test]
async fn stale_history_heartbeats_are_ignored() {
    let nodes = spawn_cluster(3).await;

    let leader_idx = wait_for_leader(&nodes, Duration::from_secs(10))
        .await
        .expect("cluster should elect a leader");

    // One follower moves to a new history on its own; the leader keeps
    // heartbeating in the old one.
    let follower_idx = (leader_idx + 1) % nodes.len();
    nodes[follower_idx].agent.set_history(HistoryId(2));

    let withdrawn = wait_until(Duration::from_secs(5), || {
        nodes[follower_idx].handle.get_leader().is_none()
    })
    .await;
    assert!(withdrawn, "the follower should drop the old-history leader");

    // The old-history heartbeats keep arriving and keep being dropped.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(nodes[follower_idx].handle.get_leader(), None);
}
