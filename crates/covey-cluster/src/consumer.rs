//! The per-peer bucket consumer state machine.
//!
//! A [`BucketConsumer`] subscribes to the shared bucket queue and tracks
//! every in-flight delivery through three ordered lists:
//!
//! - `incoming` — delivered by the broker, not yet exposed to the client.
//! - `active` — currently exposed; the client's responsibility.
//! - `released` — returned by the client, awaiting reject-with-requeue.
//!
//! A `(name, delivery_tag)` pair lives in exactly one list at any
//! consistent snapshot. Stopping without `force` drains first: no new
//! promotion happens, and the channel is closed only once the client has
//! released every active bucket, so the broker requeues nothing the
//! client still holds.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use covey_broker::{BrokerError, Channel, Connection, Delivery, DeliveryHandler};
use covey_types::{Bucket, PeerId};
use tokio::sync::Notify;
use tracing::{debug, trace, warn};

use crate::best_effort;

/// Lifecycle of a bucket consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerStatus {
    /// Subscribed; deliveries flow and polls promote them.
    Running,
    /// Stop requested; draining. No promotion, deliveries still tracked.
    Stopping,
    /// Channel released. All operations are no-ops returning empty sets.
    Stopped,
}

struct ConsumerState {
    channel: Option<Arc<dyn Channel>>,
    consumer_tag: String,
    incoming: Vec<Bucket>,
    active: Vec<Bucket>,
    released: Vec<Bucket>,
    status: ConsumerStatus,
}

impl ConsumerState {
    fn stopped() -> Self {
        Self {
            channel: None,
            consumer_tag: String::new(),
            incoming: Vec::new(),
            active: Vec::new(),
            released: Vec::new(),
            status: ConsumerStatus::Stopped,
        }
    }
}

struct ConsumerCell {
    instance_id: PeerId,
    state: Mutex<ConsumerState>,
    /// Wakes a drain-waiting stopper once `active` empties while
    /// `Stopping`, or once another stopper completes the transition.
    drained: Notify,
}

impl ConsumerCell {
    fn lock(&self) -> std::sync::MutexGuard<'_, ConsumerState> {
        self.state.lock().expect("consumer state lock poisoned")
    }

    /// Delivery path: track `(name, tag)` in `incoming`.
    ///
    /// Non-UTF-8 payloads are rejected back to the queue. Deliveries
    /// racing a teardown are dropped here; channel recovery returns them
    /// to the broker.
    fn on_delivery(&self, channel: &Arc<dyn Channel>, delivery: Delivery) {
        let name = match std::str::from_utf8(&delivery.payload) {
            Ok(name) => name.to_string(),
            Err(_) => {
                warn!(
                    instance = %self.instance_id,
                    tag = delivery.delivery_tag,
                    "rejecting non-UTF-8 bucket payload"
                );
                let channel = Arc::clone(channel);
                let tag = delivery.delivery_tag;
                tokio::spawn(async move {
                    let _ = channel.reject_requeue(tag).await;
                });
                return;
            }
        };

        let mut state = self.lock();
        if state.status == ConsumerStatus::Stopped {
            return;
        }
        trace!(instance = %self.instance_id, bucket = %name, "bucket delivered");
        state.incoming.push(Bucket::new(name, delivery.delivery_tag));
    }
}

/// Handle to a bucket consumer. Cheap to clone; clones share the same
/// state cell, so the handle stays valid across restarts.
#[derive(Clone)]
pub struct BucketConsumer {
    cell: Arc<ConsumerCell>,
}

impl BucketConsumer {
    /// Open a channel with the given prefetch, subscribe to `queue`, and
    /// return the consumer handle.
    pub async fn start(
        connection: &Arc<dyn Connection>,
        queue: &str,
        prefetch: u16,
        instance_id: PeerId,
    ) -> Result<Self, BrokerError> {
        let consumer = Self {
            cell: Arc::new(ConsumerCell {
                instance_id,
                state: Mutex::new(ConsumerState::stopped()),
                drained: Notify::new(),
            }),
        };
        consumer.restart(connection, queue, prefetch).await?;
        Ok(consumer)
    }

    /// Replace the channel, subscription, lists, and status of this cell
    /// with a fresh subscription at the given prefetch.
    ///
    /// On failure the consumer is left `Stopped`; callers may retry
    /// later. A predecessor subscription that was never stopped is torn
    /// down first.
    pub async fn restart(
        &self,
        connection: &Arc<dyn Connection>,
        queue: &str,
        prefetch: u16,
    ) -> Result<(), BrokerError> {
        let leftover = {
            let mut state = self.cell.lock();
            if state.status == ConsumerStatus::Stopped {
                None
            } else {
                state.status = ConsumerStatus::Stopped;
                Some((
                    state.channel.take(),
                    std::mem::take(&mut state.consumer_tag),
                ))
            }
        };
        if let Some((Some(channel), tag)) = leftover {
            Self::teardown(channel, &tag).await;
        }

        let channel = connection.open_channel().await?;
        if let Err(e) = channel.set_prefetch(prefetch).await {
            channel.close().await;
            return Err(e);
        }

        // Install the fresh state before subscribing so that deliveries
        // arriving mid-subscribe land in the new `incoming`.
        {
            let mut state = self.cell.lock();
            *state = ConsumerState {
                channel: Some(Arc::clone(&channel)),
                consumer_tag: String::new(),
                incoming: Vec::new(),
                active: Vec::new(),
                released: Vec::new(),
                status: ConsumerStatus::Running,
            };
        }

        let cell = Arc::clone(&self.cell);
        let delivery_channel = Arc::clone(&channel);
        let handler: DeliveryHandler =
            Arc::new(move |delivery| cell.on_delivery(&delivery_channel, delivery));

        match channel.subscribe(queue, handler).await {
            Ok(tag) => {
                debug!(
                    instance = %self.cell.instance_id,
                    queue,
                    prefetch,
                    "bucket consumer subscribed"
                );
                self.cell.lock().consumer_tag = tag;
                Ok(())
            }
            Err(e) => {
                {
                    let mut state = self.cell.lock();
                    *state = ConsumerState::stopped();
                }
                channel.close().await;
                Err(e)
            }
        }
    }

    /// Promote everything delivered so far and return the active set.
    ///
    /// While `Running`, `incoming` moves to the tail of `active` in
    /// arrival order. In any other state the active set is returned
    /// without mutation (empty once stopped).
    pub fn buckets(&self) -> HashSet<String> {
        let mut state = self.cell.lock();
        if state.status == ConsumerStatus::Running {
            let incoming = std::mem::take(&mut state.incoming);
            state.active.extend(incoming);
        }
        state.active.iter().map(|b| b.name.clone()).collect()
    }

    /// Return the named buckets to the broker.
    ///
    /// The active list is atomically split into kept and released; each
    /// released delivery is then rejected-with-requeue. Broker failures
    /// during the requeue are logged, never propagated.
    pub async fn release(&self, names: &HashSet<String>) {
        let (channel, released) = {
            let mut state = self.cell.lock();
            if state.status == ConsumerStatus::Stopped {
                return;
            }
            let active = std::mem::take(&mut state.active);
            let (released, kept): (Vec<Bucket>, Vec<Bucket>) =
                active.into_iter().partition(|b| names.contains(&b.name));
            state.active = kept;
            state.released = released.clone();
            (state.channel.clone(), released)
        };

        if let Some(channel) = &channel {
            for bucket in &released {
                if let Err(e) = channel.reject_requeue(bucket.delivery_tag).await {
                    debug!(
                        instance = %self.cell.instance_id,
                        bucket = %bucket.name,
                        error = %e,
                        "release requeue failed"
                    );
                }
            }
        }

        // Wake a drain-waiting stopper only after the requeues are done,
        // so stop() returning implies the broker has everything back.
        let drained = {
            let state = self.cell.lock();
            state.status == ConsumerStatus::Stopping && state.active.is_empty()
        };
        if drained {
            self.cell.drained.notify_one();
        }
    }

    /// Stop the consumer.
    ///
    /// Without `force`, blocks until the client has released every
    /// active bucket, then cancels the subscription, recovers unacked
    /// deliveries back to the queue, and closes the channel. With
    /// `force`, active buckets are abandoned immediately and the broker
    /// requeues them on channel close. Idempotent.
    pub async fn stop(&self, force: bool) {
        loop {
            let notified = self.cell.drained.notified();
            let teardown = {
                let mut state = self.cell.lock();
                match state.status {
                    ConsumerStatus::Stopped => return,
                    _ if force || state.active.is_empty() => {
                        state.status = ConsumerStatus::Stopped;
                        state.incoming.clear();
                        state.active.clear();
                        state.released.clear();
                        Some((
                            state.channel.take(),
                            std::mem::take(&mut state.consumer_tag),
                        ))
                    }
                    _ => {
                        debug!(
                            instance = %self.cell.instance_id,
                            held = state.active.len(),
                            "stop waiting for client to release active buckets"
                        );
                        state.status = ConsumerStatus::Stopping;
                        None
                    }
                }
            };

            match teardown {
                Some((channel, tag)) => {
                    // Cascade so any concurrent stopper observes Stopped.
                    self.cell.drained.notify_one();
                    if let Some(channel) = channel {
                        Self::teardown(channel, &tag).await;
                    }
                    return;
                }
                None => notified.await,
            }
        }
    }

    /// Current lifecycle state.
    pub fn status(&self) -> ConsumerStatus {
        self.cell.lock().status
    }

    /// The peer identity this consumer was started for.
    pub fn instance_id(&self) -> &PeerId {
        &self.cell.instance_id
    }

    async fn teardown(channel: Arc<dyn Channel>, consumer_tag: &str) {
        if !consumer_tag.is_empty() {
            best_effort("subscription cancel", channel.cancel(consumer_tag).await);
        }
        best_effort("in-flight recovery", channel.recover_requeue().await);
        channel.close().await;
    }

    /// Snapshot of (incoming, active, released) for invariant checks.
    #[cfg(test)]
    pub(crate) fn snapshot(&self) -> (Vec<Bucket>, Vec<Bucket>, Vec<Bucket>) {
        let state = self.cell.lock();
        (
            state.incoming.clone(),
            state.active.clone(),
            state.released.clone(),
        )
    }
}

impl std::fmt::Debug for BucketConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.cell.lock();
        f.debug_struct("BucketConsumer")
            .field("instance_id", &self.cell.instance_id)
            .field("status", &state.status)
            .field("incoming", &state.incoming.len())
            .field("active", &state.active.len())
            .field("released", &state.released.len())
            .finish()
    }
}
