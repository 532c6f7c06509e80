//! Fanout gossip plane.
//!
//! Every peer binds one auto-named private queue to the cluster's fanout
//! exchange and speaks three verbs on it: `announce`, `retract`, `poll`
//! (see [`Gossip`]). Fanout means every peer — the sender included —
//! receives every message; the sender's identity travels in the
//! `peer-id` header so handlers can tell who spoke.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use covey_broker::{BrokerError, Channel, Connection, Delivery, QueueOptions};
use covey_types::{Gossip, PEER_ID_HEADER, PeerId};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::best_effort;

/// Prefetch applied to the broadcast consumer channel.
const BROADCAST_PREFETCH: u16 = 10;

/// Receives parsed gossip messages.
///
/// Implemented by a small context struct rather than the distributor
/// itself, breaking the handle cycle between the two. Failures are
/// logged by the dispatch loop and the delivery is acked regardless, so
/// a broken handler cannot create a poison-message storm.
#[async_trait::async_trait]
pub trait BroadcastHandler: Send + Sync {
    /// Handle one gossip message. `sender` is taken from the `peer-id`
    /// header when present; self-sent messages are delivered too.
    async fn on_message(
        &self,
        sender: Option<&PeerId>,
        message: Gossip,
    ) -> Result<(), BrokerError>;
}

/// Publish one gossip message on a short-lived channel.
pub async fn send_broadcast(
    connection: &Arc<dyn Connection>,
    exchange: &str,
    peer_id: &PeerId,
    message: &Gossip,
) -> Result<(), BrokerError> {
    let channel = connection.open_channel().await?;

    let mut headers = HashMap::new();
    headers.insert(PEER_ID_HEADER.to_string(), peer_id.to_string());
    let result = channel
        .publish(exchange, "", Bytes::from(message.encode()), headers)
        .await;

    channel.close().await;
    result
}

/// A running subscription to the broadcast exchange.
pub struct BroadcastConsumer {
    channel: Arc<dyn Channel>,
    consumer_tag: String,
    dispatch: JoinHandle<()>,
}

impl BroadcastConsumer {
    /// Declare the fanout exchange, bind a fresh private queue to it,
    /// and start dispatching deliveries to `handler`.
    pub async fn start(
        connection: &Arc<dyn Connection>,
        exchange: &str,
        handler: Arc<dyn BroadcastHandler>,
    ) -> Result<Self, BrokerError> {
        let channel = connection.open_channel().await?;
        match Self::subscribe(&channel, exchange, handler).await {
            Ok((consumer_tag, dispatch)) => Ok(Self {
                channel,
                consumer_tag,
                dispatch,
            }),
            Err(e) => {
                channel.close().await;
                Err(e)
            }
        }
    }

    async fn subscribe(
        channel: &Arc<dyn Channel>,
        exchange: &str,
        handler: Arc<dyn BroadcastHandler>,
    ) -> Result<(String, JoinHandle<()>), BrokerError> {
        channel.declare_fanout_exchange(exchange).await?;
        let queue = channel
            .declare_queue(
                "",
                QueueOptions {
                    durable: false,
                    exclusive: true,
                    auto_delete: false,
                },
            )
            .await?;
        channel.bind_queue(&queue, exchange).await?;
        channel.set_prefetch(BROADCAST_PREFETCH).await?;

        // Deliveries hop through a channel so the async handler runs on
        // our own task, off the broker's delivery path.
        let (tx, rx) = mpsc::unbounded_channel::<Delivery>();
        let consumer_tag = channel
            .subscribe(
                &queue,
                Arc::new(move |delivery| {
                    let _ = tx.send(delivery);
                }),
            )
            .await?;

        debug!(exchange, queue = %queue, "broadcast consumer bound");
        let dispatch = tokio::spawn(dispatch_loop(Arc::clone(channel), rx, handler));
        Ok((consumer_tag, dispatch))
    }

    /// Cancel the subscription and close the channel.
    pub async fn stop(self) {
        best_effort(
            "broadcast subscription cancel",
            self.channel.cancel(&self.consumer_tag).await,
        );
        self.channel.close().await;
        self.dispatch.abort();
    }
}

async fn dispatch_loop(
    channel: Arc<dyn Channel>,
    mut rx: mpsc::UnboundedReceiver<Delivery>,
    handler: Arc<dyn BroadcastHandler>,
) {
    while let Some(delivery) = rx.recv().await {
        let sender = delivery
            .headers
            .get(PEER_ID_HEADER)
            .map(|id| PeerId::new(id.clone()));

        match std::str::from_utf8(&delivery.payload)
            .ok()
            .and_then(Gossip::parse)
        {
            Some(message) => {
                if let Err(e) = handler.on_message(sender.as_ref(), message).await {
                    warn!(error = %e, "broadcast handler failed");
                }
            }
            None => debug!("ignoring unrecognized broadcast payload"),
        }

        // Ack fires even when the handler failed.
        best_effort("broadcast ack", channel.ack(delivery.delivery_tag).await);
    }
}
