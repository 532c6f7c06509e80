//! Integration test: a graceful stop drains — it blocks until the
//! client releases every active bucket, then returns everything to the
//! broker.

use std::time::Duration;

use covey_integration_tests::TestCluster;
use tokio::time;

#[tokio::test]
#[ntest::timeout(15000)]
async fn test_stop_blocks_until_client_releases() {
    let cluster = TestCluster::new(1, &["a", "b"]).await;
    let peer = cluster.peer(0);

    let held = peer.acquire_until(2, Duration::from_secs(5)).await;

    // Stop on a clone of the handle while the client still holds both.
    let stopper = peer.distributor.clone();
    let stopping = tokio::spawn(async move { stopper.stop().await });

    time::sleep(Duration::from_millis(100)).await;
    assert!(
        !stopping.is_finished(),
        "stop must wait for the active set to drain"
    );

    // The original handle keeps working mid-stop.
    peer.release(&held).await;

    time::timeout(Duration::from_secs(2), stopping)
        .await
        .expect("stop should return once drained")
        .expect("stop task");

    // Both deliveries are back with the broker, nothing in flight.
    assert_eq!(
        cluster.broker().ready_messages(&cluster.bucket_queue()),
        Some(2)
    );
    assert_eq!(cluster.broker().unacked_total(), 0);

    // The stopped distributor answers with empty sets, never errors.
    assert!(peer.acquire().is_empty());

    cluster.shutdown().await;
}

#[tokio::test]
#[ntest::timeout(15000)]
async fn test_retract_on_stop_removes_peer_from_survivors() {
    let cluster = TestCluster::new(2, &["a", "b"]).await;

    // Wait until both peers know each other.
    for i in 0..2 {
        let peer = cluster.peer(i);
        covey_integration_tests::wait_for(Duration::from_secs(5), || async {
            peer.distributor.peers().len() == 2
        })
        .await;
    }

    let leaving = cluster.peer(1);
    let held = leaving.acquire();
    leaving.release(&held).await;
    leaving.distributor.stop().await;

    // The retract removes the peer well before any expiry could.
    let survivor = cluster.peer(0);
    covey_integration_tests::wait_for(Duration::from_secs(2), || async {
        survivor.distributor.peers().len() == 1
    })
    .await;

    cluster.shutdown().await;
}
