//! Integration test: announce / retract semantics of the peer map.

use std::time::Duration;

use covey_broker::Connection;
use covey_cluster::send_broadcast;
use covey_integration_tests::{TestCluster, wait_for};
use covey_types::{DistributorOptions, Gossip, PeerId};

fn no_expiry_options() -> DistributorOptions {
    DistributorOptions {
        peers_period: Duration::from_millis(50),
        expiration_period: Duration::from_secs(60),
        partition_delay: Duration::from_millis(25),
        partition_period: Duration::from_millis(25),
    }
}

#[tokio::test]
#[ntest::timeout(10000)]
async fn test_announce_is_idempotent_and_retract_reversible() {
    let cluster = TestCluster::with_options(1, &["a", "b", "c", "d"], no_expiry_options()).await;
    let peer = cluster.peer(0);
    let exchange = cluster.broadcast_exchange();

    let ghost = PeerId::new("elsewhere/ghost");
    let sender = cluster.broker().connect();

    // First announce creates the entry.
    send_broadcast(&sender, &exchange, &ghost, &Gossip::Announce(ghost.clone()))
        .await
        .expect("announce");
    wait_for(Duration::from_secs(2), || async {
        peer.distributor.peers().contains(&ghost)
    })
    .await;

    // Repeating it only refreshes the stamp; the map does not grow.
    for _ in 0..3 {
        send_broadcast(&sender, &exchange, &ghost, &Gossip::Announce(ghost.clone()))
            .await
            .expect("announce again");
    }
    wait_for(Duration::from_secs(2), || async {
        peer.distributor.peers().len() == 2
    })
    .await;

    // Retract removes it.
    send_broadcast(&sender, &exchange, &ghost, &Gossip::Retract(ghost.clone()))
        .await
        .expect("retract");
    wait_for(Duration::from_secs(2), || async {
        !peer.distributor.peers().contains(&ghost)
    })
    .await;

    // An announce after a retract re-creates the entry: a restarted
    // peer re-appears.
    send_broadcast(&sender, &exchange, &ghost, &Gossip::Announce(ghost.clone()))
        .await
        .expect("announce after retract");
    wait_for(Duration::from_secs(2), || async {
        peer.distributor.peers().contains(&ghost)
    })
    .await;

    sender.close().await;
    cluster.shutdown().await;
}

#[tokio::test]
#[ntest::timeout(10000)]
async fn test_share_follows_membership() {
    let cluster = TestCluster::with_options(1, &["a", "b", "c", "d"], no_expiry_options()).await;
    let peer = cluster.peer(0);
    let exchange = cluster.broadcast_exchange();

    wait_for(Duration::from_secs(2), || async {
        peer.distributor.partition_size() == 4
    })
    .await;

    // Three phantom peers join: share drops to ⌊4/4⌋ = 1.
    let sender = cluster.broker().connect();
    for n in 0..3 {
        let ghost = PeerId::new(format!("elsewhere/ghost-{n}"));
        send_broadcast(&sender, &exchange, &ghost, &Gossip::Announce(ghost.clone()))
            .await
            .expect("announce");
    }
    wait_for(Duration::from_secs(2), || async {
        peer.distributor.partition_size() == 1
    })
    .await;

    sender.close().await;
    cluster.shutdown().await;
}
