//! Integration test: a starting peer's `poll` prompts immediate
//! announces, so it learns the membership without waiting out a full
//! announce period.

use std::time::Duration;

use covey_integration_tests::{TestCluster, wait_for};
use covey_types::DistributorOptions;

#[tokio::test]
#[ntest::timeout(10000)]
async fn test_poll_shortcuts_convergence() {
    // Announce period far beyond the test horizon: membership knowledge
    // can only travel via poll responses.
    let options = DistributorOptions {
        peers_period: Duration::from_secs(30),
        expiration_period: Duration::from_secs(60),
        partition_delay: Duration::from_millis(25),
        partition_period: Duration::from_millis(25),
    };
    let mut cluster = TestCluster::with_options(1, &["a", "b"], options).await;

    let first_id = cluster.peer(0).distributor.peer_id().clone();

    // The newcomer polls on startup; the first peer answers with an
    // announce, which is the only way its identity can arrive this soon.
    cluster.add_peer().await;
    let newcomer = cluster.peer(1);
    wait_for(Duration::from_secs(2), || async {
        newcomer.distributor.peers().contains(&first_id)
    })
    .await;

    cluster.shutdown().await;
}
