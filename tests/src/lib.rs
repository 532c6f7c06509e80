//! Shared test harness for Covey integration tests.
//!
//! Provides [`TestCluster`] — N distributor peers over one in-process
//! broker, each with its own connection, plus polling helpers that play
//! the role of the embedding client (acquire, release when asked to
//! shrink, wait for convergence).

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use covey_broker::{Connection, MemoryBroker};
use covey_cluster::Distributor;
use covey_types::{DistributorOptions, PeerId};
use tokio::time;

/// Timing options tight enough for tests to converge in milliseconds.
pub fn fast_options() -> DistributorOptions {
    DistributorOptions {
        peers_period: Duration::from_millis(50),
        expiration_period: Duration::from_millis(300),
        partition_delay: Duration::from_millis(25),
        partition_period: Duration::from_millis(25),
    }
}

/// Wait for a condition to become true within a timeout.
pub async fn wait_for<F, Fut>(timeout: Duration, condition: F)
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = time::Instant::now() + timeout;
    loop {
        if condition().await {
            return;
        }
        if time::Instant::now() >= deadline {
            panic!("condition not met within {timeout:?}");
        }
        time::sleep(Duration::from_millis(10)).await;
    }
}

/// One peer: its broker connection and its distributor handle.
pub struct TestPeer {
    pub connection: Arc<dyn Connection>,
    pub distributor: Distributor,
}

impl TestPeer {
    /// Current active set.
    pub fn acquire(&self) -> HashSet<String> {
        self.distributor.acquire_buckets()
    }

    /// Release a set of names.
    pub async fn release(&self, names: &HashSet<String>) {
        self.distributor.release_buckets(names).await;
    }

    /// Poll until the active set has exactly `expected` buckets,
    /// releasing everything held on each miss so that drains and
    /// rebalances can proceed. Returns the final set.
    pub async fn acquire_until(&self, expected: usize, timeout: Duration) -> HashSet<String> {
        let deadline = time::Instant::now() + timeout;
        loop {
            let held = self.acquire();
            if held.len() == expected {
                return held;
            }
            self.release(&held).await;
            if time::Instant::now() >= deadline {
                panic!(
                    "peer {} held {} buckets, wanted {expected}",
                    self.distributor.peer_id(),
                    held.len()
                );
            }
            time::sleep(Duration::from_millis(10)).await;
        }
    }
}

/// A cluster of distributor peers sharing one in-process broker.
pub struct TestCluster {
    broker: MemoryBroker,
    cluster_name: String,
    buckets: Vec<String>,
    options: DistributorOptions,
    peers: Vec<TestPeer>,
    next_peer: u8,
}

impl TestCluster {
    /// Start `count` peers over the given bucket universe with
    /// [`fast_options`].
    pub async fn new(count: usize, buckets: &[&str]) -> Self {
        Self::with_options(count, buckets, fast_options()).await
    }

    /// Start `count` peers with explicit timing options.
    pub async fn with_options(
        count: usize,
        buckets: &[&str],
        options: DistributorOptions,
    ) -> Self {
        let mut cluster = Self {
            broker: MemoryBroker::new(),
            cluster_name: "test".to_string(),
            buckets: buckets.iter().map(|b| b.to_string()).collect(),
            options,
            peers: Vec::new(),
            next_peer: 0,
        };
        for _ in 0..count {
            cluster.add_peer().await;
        }
        cluster
    }

    /// Start one more peer. Returns its index.
    pub async fn add_peer(&mut self) -> usize {
        self.next_peer += 1;
        let peer_id = PeerId::new(format!("test-host/peer-{}", self.next_peer));
        let connection = self.broker.connect();
        let distributor = Distributor::start_with_id(
            Arc::clone(&connection),
            &self.cluster_name,
            self.buckets.clone(),
            peer_id,
            self.options.clone(),
        )
        .await
        .expect("start distributor");

        self.peers.push(TestPeer {
            connection,
            distributor,
        });
        self.peers.len() - 1
    }

    /// Access a peer by index.
    pub fn peer(&self, index: usize) -> &TestPeer {
        &self.peers[index]
    }

    /// The shared broker, for topology assertions.
    pub fn broker(&self) -> &MemoryBroker {
        &self.broker
    }

    /// The bucket queue name for this cluster.
    pub fn bucket_queue(&self) -> String {
        format!("{}.bucket", self.cluster_name)
    }

    /// The broadcast exchange name for this cluster.
    pub fn broadcast_exchange(&self) -> String {
        format!("{}.bucket.broadcast", self.cluster_name)
    }

    /// Simulate a crash: abandon buckets, close the connection, send no
    /// retract. Remaining peers only notice through expiry.
    pub async fn kill(&mut self, index: usize) {
        let peer = self.peers.remove(index);
        peer.distributor.abort().await;
        peer.connection.close().await;
    }

    /// Tear everything down without graceful drains.
    pub async fn shutdown(self) {
        for peer in self.peers {
            peer.distributor.abort().await;
            peer.connection.close().await;
        }
    }
}
