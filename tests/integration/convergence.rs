//! Integration test: two peers converge to half the universe each.

use std::collections::HashSet;
use std::time::Duration;

use covey_integration_tests::{TestCluster, wait_for};

#[tokio::test]
#[ntest::timeout(15000)]
async fn test_two_peers_split_the_universe() {
    let mut cluster = TestCluster::new(1, &["a", "b", "c", "d"]).await;

    // Alone, the first peer ends up holding everything.
    let held = cluster
        .peer(0)
        .acquire_until(4, Duration::from_secs(5))
        .await;
    assert_eq!(held.len(), 4);

    // A second peer joins; both recompute share = ⌊4/2⌋ = 2. The first
    // peer's consumer drains (we release on every poll) and restarts
    // with prefetch 2, returning the overflow to the queue for the
    // newcomer.
    cluster.add_peer().await;

    let first = cluster.peer(0).acquire_until(2, Duration::from_secs(10)).await;
    let second = cluster.peer(1).acquire_until(2, Duration::from_secs(10)).await;

    let union: HashSet<String> = first.union(&second).cloned().collect();
    assert_eq!(union.len(), 4, "shares must not overlap");

    cluster.shutdown().await;
}

#[tokio::test]
#[ntest::timeout(15000)]
async fn test_both_peers_learn_the_full_membership() {
    let cluster = TestCluster::new(2, &["a", "b"]).await;

    for i in 0..2 {
        let peer = cluster.peer(i);
        wait_for(Duration::from_secs(5), || async {
            peer.distributor.peers().len() == 2
        })
        .await;
    }

    cluster.shutdown().await;
}
