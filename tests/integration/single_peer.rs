//! Integration test: a single peer seeds the pool and acquires every
//! bucket once its share converges to the full universe.

use std::time::Duration;

use covey_integration_tests::{TestCluster, wait_for};

#[tokio::test]
#[ntest::timeout(10000)]
async fn test_single_peer_acquires_all_buckets() {
    let cluster = TestCluster::new(1, &["a", "b", "c"]).await;

    // The pool was seeded exactly once.
    assert!(cluster.broker().queue_exists(&cluster.bucket_queue()));

    // Once the self-announce lands, |peers| = 1 and the share becomes 3.
    let peer = cluster.peer(0);
    wait_for(Duration::from_secs(5), || async {
        peer.distributor.partition_size() == 3
    })
    .await;

    let held = peer.acquire_until(3, Duration::from_secs(5)).await;
    assert_eq!(
        held,
        ["a", "b", "c"].iter().map(|s| s.to_string()).collect()
    );

    cluster.shutdown().await;
}

#[tokio::test]
#[ntest::timeout(10000)]
async fn test_single_peer_sees_itself() {
    let cluster = TestCluster::new(1, &["a"]).await;

    let peer = cluster.peer(0);
    wait_for(Duration::from_secs(5), || async {
        peer.distributor
            .peers()
            .contains(peer.distributor.peer_id())
    })
    .await;

    cluster.shutdown().await;
}

#[tokio::test]
#[ntest::timeout(10000)]
async fn test_more_peers_than_buckets_clamps_share_to_one() {
    let cluster = TestCluster::new(3, &["only"]).await;

    // ⌊1/3⌋ = 0, clamped to 1 on every peer.
    for i in 0..3 {
        let peer = cluster.peer(i);
        wait_for(Duration::from_secs(5), || async {
            peer.distributor.peers().len() == 3 && peer.distributor.partition_size() == 1
        })
        .await;
    }

    // The broker hands the one bucket to a single peer; the others idle.
    wait_for(Duration::from_secs(5), || async {
        let holders = (0..3)
            .filter(|i| !cluster.peer(*i).acquire().is_empty())
            .count();
        holders == 1
    })
    .await;

    cluster.shutdown().await;
}
