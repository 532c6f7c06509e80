//! The distributor: composes pool seeding, gossip, share recomputation,
//! and the bucket consumer into one peer-local orchestrator.
//!
//! Membership is eventually convergent: every peer periodically
//! announces itself on the fanout exchange, tracks every announce it
//! hears (its own included), and expires peers that fall silent. The
//! per-peer share is `max(1, ⌊buckets / peers⌋)`; whenever it changes,
//! the bucket consumer is drained, stopped, and restarted with the new
//! share as its prefetch, letting the broker re-ration deliveries
//! without any global coordination.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use covey_broker::{BrokerError, Connection};
use covey_types::{ClusterNames, DistributorOptions, Gossip, PeerId, now_millis};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::broadcast::{BroadcastConsumer, BroadcastHandler, send_broadcast};
use crate::consumer::{BucketConsumer, ConsumerStatus};
use crate::pool::init_buckets;

/// One share recomputation result, published to the coordinator.
struct ShareChange {
    old: usize,
    new: usize,
}

/// Membership view and the share computed from it.
struct ClusterView {
    peers: HashMap<PeerId, u64>,
    partition_size: usize,
}

struct DistributorInner {
    peer_id: PeerId,
    names: ClusterNames,
    connection: Arc<dyn Connection>,
    default_buckets: Vec<String>,
    options: DistributorOptions,
    view: Mutex<ClusterView>,
    consumer: BucketConsumer,
    share_tx: mpsc::UnboundedSender<ShareChange>,
}

impl DistributorInner {
    fn lock_view(&self) -> std::sync::MutexGuard<'_, ClusterView> {
        self.view.lock().expect("cluster view lock poisoned")
    }
}

/// Everything that runs on behalf of a distributor and is torn down by
/// [`Distributor::stop`] or [`Distributor::abort`]. Taken exactly once.
struct DistributorRuntime {
    broadcast: BroadcastConsumer,
    shutdown: watch::Sender<bool>,
    peers_task: JoinHandle<()>,
    partitions_task: JoinHandle<()>,
    coordinator_task: JoinHandle<()>,
}

impl DistributorRuntime {
    fn halt_tasks(&self) {
        let _ = self.shutdown.send(true);
        self.peers_task.abort();
        self.partitions_task.abort();
        self.coordinator_task.abort();
    }
}

/// A running bucket distributor for one peer.
///
/// Cheap to clone; clones share the same peer. This lets one part of an
/// application block in [`stop`](Self::stop) while another keeps calling
/// [`release_buckets`](Self::release_buckets) to finish the drain.
#[derive(Clone)]
pub struct Distributor {
    inner: Arc<DistributorInner>,
    runtime: Arc<Mutex<Option<DistributorRuntime>>>,
}

impl Distributor {
    /// Start a distributor with a generated peer identity.
    ///
    /// The connection is owned by the caller and must outlive the
    /// distributor.
    pub async fn start(
        connection: Arc<dyn Connection>,
        cluster: &str,
        default_buckets: Vec<String>,
        options: DistributorOptions,
    ) -> Result<Self, BrokerError> {
        Self::start_with_id(
            connection,
            cluster,
            default_buckets,
            PeerId::generate(),
            options,
        )
        .await
    }

    /// Start a distributor under an explicit peer identity.
    ///
    /// Identities must be unique per process; reusing one across live
    /// peers merges them in every peer map.
    pub async fn start_with_id(
        connection: Arc<dyn Connection>,
        cluster: &str,
        default_buckets: Vec<String>,
        peer_id: PeerId,
        options: DistributorOptions,
    ) -> Result<Self, BrokerError> {
        let names = ClusterNames::for_cluster(cluster);
        info!(peer = %peer_id, cluster, buckets = default_buckets.len(), "starting distributor");

        init_buckets(&connection, &names, &default_buckets).await?;

        let consumer =
            BucketConsumer::start(&connection, &names.bucket_queue, 1, peer_id.clone()).await?;

        let (share_tx, share_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(DistributorInner {
            peer_id,
            names,
            connection,
            default_buckets,
            options,
            view: Mutex::new(ClusterView {
                peers: HashMap::new(),
                partition_size: 1,
            }),
            consumer,
            share_tx,
        });

        let coordinator_task = tokio::spawn(share_coordinator(Arc::clone(&inner), share_rx));

        let handler = Arc::new(GossipContext {
            inner: Arc::clone(&inner),
        });
        let broadcast = match BroadcastConsumer::start(
            &inner.connection,
            &inner.names.broadcast_exchange,
            handler,
        )
        .await
        {
            Ok(broadcast) => broadcast,
            Err(e) => {
                coordinator_task.abort();
                inner.consumer.stop(true).await;
                return Err(e);
            }
        };

        // Prompt immediate announces so a new joiner converges without
        // waiting out a full peers period.
        if let Err(e) = send_broadcast(
            &inner.connection,
            &inner.names.broadcast_exchange,
            &inner.peer_id,
            &Gossip::Poll,
        )
        .await
        {
            coordinator_task.abort();
            broadcast.stop().await;
            inner.consumer.stop(true).await;
            return Err(e);
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let peers_task = tokio::spawn(update_peers_loop(
            Arc::clone(&inner),
            shutdown_rx.clone(),
        ));
        let partitions_task = tokio::spawn(update_partitions_loop(Arc::clone(&inner), shutdown_rx));

        Ok(Self {
            inner,
            runtime: Arc::new(Mutex::new(Some(DistributorRuntime {
                broadcast,
                shutdown,
                peers_task,
                partitions_task,
                coordinator_task,
            }))),
        })
    }

    fn take_runtime(&self) -> Option<DistributorRuntime> {
        self.runtime
            .lock()
            .expect("distributor runtime lock poisoned")
            .take()
    }

    /// This peer's identity.
    pub fn peer_id(&self) -> &PeerId {
        &self.inner.peer_id
    }

    /// Currently known peers, self included once gossip has cycled.
    pub fn peers(&self) -> Vec<PeerId> {
        self.inner.lock_view().peers.keys().cloned().collect()
    }

    /// The share most recently computed for this peer.
    pub fn partition_size(&self) -> usize {
        self.inner.lock_view().partition_size
    }

    /// The bucket names this peer is currently responsible for.
    ///
    /// Promotes freshly delivered buckets into the active set. Never
    /// fails; returns the empty set once the consumer is stopped.
    pub fn acquire_buckets(&self) -> HashSet<String> {
        self.inner.consumer.buckets()
    }

    /// Release a subset of the active buckets back to the broker, which
    /// redelivers them across the cluster. Never fails.
    pub async fn release_buckets(&self, names: &HashSet<String>) {
        self.inner.consumer.release(names).await;
    }

    /// Graceful stop: cancel the periodic tasks, leave the gossip plane,
    /// drain and stop the bucket consumer, and retract this peer.
    ///
    /// Blocks until the client has released every active bucket; a clone
    /// of this handle stays usable for those releases. Idempotent.
    pub async fn stop(&self) {
        let Some(runtime) = self.take_runtime() else {
            return;
        };
        info!(peer = %self.inner.peer_id, "stopping distributor");
        runtime.halt_tasks();
        runtime.broadcast.stop().await;
        self.inner.consumer.stop(false).await;

        if let Err(e) = send_broadcast(
            &self.inner.connection,
            &self.inner.names.broadcast_exchange,
            &self.inner.peer_id,
            &Gossip::Retract(self.inner.peer_id.clone()),
        )
        .await
        {
            warn!(error = %e, "retract broadcast failed");
        }
    }

    /// Crash-style teardown: no drain, no retract.
    ///
    /// Active buckets are abandoned; the broker requeues their
    /// deliveries on channel close and the remaining peers pick them up
    /// once this peer's announcements expire.
    pub async fn abort(&self) {
        let Some(runtime) = self.take_runtime() else {
            return;
        };
        warn!(peer = %self.inner.peer_id, "aborting distributor");
        runtime.halt_tasks();
        runtime.broadcast.stop().await;
        self.inner.consumer.stop(true).await;
    }
}

impl std::fmt::Debug for Distributor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let view = self.inner.lock_view();
        f.debug_struct("Distributor")
            .field("peer_id", &self.inner.peer_id)
            .field("peers", &view.peers.len())
            .field("partition_size", &view.partition_size)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Gossip handling
// ---------------------------------------------------------------------------

/// Handler context: everything the broadcast plane needs from the
/// distributor, without holding the distributor itself.
struct GossipContext {
    inner: Arc<DistributorInner>,
}

#[async_trait::async_trait]
impl BroadcastHandler for GossipContext {
    async fn on_message(
        &self,
        _sender: Option<&PeerId>,
        message: Gossip,
    ) -> Result<(), BrokerError> {
        match message {
            // Self-announces flow through here too, keeping this peer in
            // its own map.
            Gossip::Announce(id) => {
                debug!(peer = %id, "announce received");
                self.inner.lock_view().peers.insert(id, now_millis());
                Ok(())
            }
            Gossip::Retract(id) => {
                debug!(peer = %id, "retract received");
                self.inner.lock_view().peers.remove(&id);
                Ok(())
            }
            Gossip::Poll => {
                send_broadcast(
                    &self.inner.connection,
                    &self.inner.names.broadcast_exchange,
                    &self.inner.peer_id,
                    &Gossip::Announce(self.inner.peer_id.clone()),
                )
                .await
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Periodic tasks
// ---------------------------------------------------------------------------

/// Announce ourselves, then expire peers that have fallen silent.
async fn update_peers_loop(inner: Arc<DistributorInner>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(inner.options.peers_period);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }

        if let Err(e) = send_broadcast(
            &inner.connection,
            &inner.names.broadcast_exchange,
            &inner.peer_id,
            &Gossip::Announce(inner.peer_id.clone()),
        )
        .await
        {
            warn!(error = %e, "self-announce failed");
        }

        expire_peers(&inner);
    }
}

fn expire_peers(inner: &DistributorInner) {
    let expiration = inner.options.expiration_period.as_millis() as u64;
    let now = now_millis();
    let mut view = inner.lock_view();
    view.peers.retain(|id, last_seen| {
        let alive = now.saturating_sub(*last_seen) <= expiration;
        if !alive {
            info!(peer = %id, "peer expired");
        }
        alive
    });
}

/// Recompute the per-peer share and publish it to the coordinator.
async fn update_partitions_loop(inner: Arc<DistributorInner>, mut shutdown: watch::Receiver<bool>) {
    tokio::select! {
        _ = tokio::time::sleep(inner.options.partition_delay) => {}
        _ = shutdown.changed() => return,
    }

    let mut ticker = tokio::time::interval(inner.options.partition_period);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }

        let change = {
            let mut view = inner.lock_view();
            // Before the first announce lands the membership is unknown;
            // stay at a share of one rather than claiming the universe.
            let new = match view.peers.len() {
                0 => 1,
                peers => (inner.default_buckets.len() / peers).max(1),
            };
            let old = view.partition_size;
            view.partition_size = new;
            ShareChange { old, new }
        };

        // Published every tick: the coordinator also uses the stream to
        // retry a consumer whose previous start failed.
        if inner.share_tx.send(change).is_err() {
            break;
        }
    }
}

/// Single linearization point for consumer restarts.
///
/// Consumes share changes in order. On an actual change the consumer is
/// drained, stopped, and restarted with the new share as prefetch; on a
/// no-change tick a stopped consumer (prior start failure) is retried.
async fn share_coordinator(
    inner: Arc<DistributorInner>,
    mut share_rx: mpsc::UnboundedReceiver<ShareChange>,
) {
    while let Some(ShareChange { old, new }) = share_rx.recv().await {
        if new != old {
            info!(
                peer = %inner.peer_id,
                old, new,
                "partition size changed, restarting bucket consumer"
            );
            inner.consumer.stop(false).await;
            if let Err(e) = inner
                .consumer
                .restart(&inner.connection, &inner.names.bucket_queue, new as u16)
                .await
            {
                warn!(error = %e, "bucket consumer restart failed, will retry");
            }
        } else if inner.consumer.status() == ConsumerStatus::Stopped {
            debug!(peer = %inner.peer_id, share = new, "retrying stopped bucket consumer");
            if let Err(e) = inner
                .consumer
                .restart(&inner.connection, &inner.names.bucket_queue, new as u16)
                .await
            {
                warn!(error = %e, "bucket consumer retry failed");
            }
        }
    }
}
