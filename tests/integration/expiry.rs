//! Integration test: a peer killed without retracting is expired by the
//! survivors, and its orphaned buckets are re-acquired.

use std::time::Duration;

use covey_integration_tests::{TestCluster, wait_for};

#[tokio::test]
#[ntest::timeout(15000)]
async fn test_killed_peer_expires_and_buckets_return() {
    let mut cluster = TestCluster::new(2, &["a", "b", "c", "d"]).await;

    // Converge to two buckets each.
    cluster.peer(0).acquire_until(2, Duration::from_secs(10)).await;
    cluster.peer(1).acquire_until(2, Duration::from_secs(10)).await;

    // Kill the second peer: no retract, channel close requeues its
    // deliveries.
    cluster.kill(1).await;

    // The survivor drops the silent peer after the expiration period...
    let survivor = cluster.peer(0);
    wait_for(Duration::from_secs(5), || async {
        survivor.distributor.peers().len() == 1
    })
    .await;

    // ...raises its share to the full universe, and re-acquires the
    // orphaned buckets.
    wait_for(Duration::from_secs(5), || async {
        survivor.distributor.partition_size() == 4
    })
    .await;
    let held = survivor.acquire_until(4, Duration::from_secs(10)).await;
    assert_eq!(held.len(), 4);

    cluster.shutdown().await;
}
