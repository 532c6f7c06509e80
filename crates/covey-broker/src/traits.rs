//! Gateway traits and message types.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;

use crate::error::BrokerError;

/// Declaration parameters for a queue.
///
/// Redeclaring an existing queue with different parameters fails with
/// [`BrokerError::QueueConflict`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueOptions {
    /// Survive broker restart. The Covey topology never sets this.
    pub durable: bool,
    /// Owned by a single connection; other connections' declarations
    /// fail with [`BrokerError::ResourceLocked`], and the queue is
    /// removed when the owning connection closes.
    pub exclusive: bool,
    /// Deleted once the last consumer cancels.
    pub auto_delete: bool,
}

/// A single message handed to a subscriber.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Broker-assigned tag identifying this in-flight delivery on its
    /// channel. Used for [`Channel::ack`] and [`Channel::reject_requeue`].
    pub delivery_tag: u64,
    /// Application headers attached at publish time.
    pub headers: HashMap<String, String>,
    /// Message body.
    pub payload: Bytes,
}

/// Callback invoked for each delivery on a subscription.
///
/// Handlers must be cheap and non-blocking: they run on the delivery
/// path and typically push into consumer-owned state or a channel.
/// Consumers needing async work forward deliveries to their own task.
pub type DeliveryHandler = Arc<dyn Fn(Delivery) + Send + Sync>;

/// A broker connection. Owned by the embedding application and expected
/// to outlive every component built on top of it.
#[async_trait::async_trait]
pub trait Connection: Send + Sync {
    /// Open a new channel on this connection.
    async fn open_channel(&self) -> Result<Arc<dyn Channel>, BrokerError>;

    /// Close the connection and every channel opened on it. Idempotent.
    async fn close(&self);
}

/// A broker channel: the unit of prefetch, delivery tagging, and
/// subscription. Short-lived operations open a channel, use it, and
/// close it on every exit path; long-lived consumers own their channel
/// and release it only through their own shutdown.
#[async_trait::async_trait]
pub trait Channel: Send + Sync {
    /// Declare a queue, or assert compatibility with an existing one.
    ///
    /// An empty `name` requests a broker-assigned name. Returns the
    /// effective queue name.
    async fn declare_queue(
        &self,
        name: &str,
        options: QueueOptions,
    ) -> Result<String, BrokerError>;

    /// Existence probe: `Ok` means the queue exists, `Err(NotFound)`
    /// means it does not (or cannot be confirmed). Leaves the channel
    /// usable either way.
    async fn declare_queue_passive(&self, name: &str) -> Result<(), BrokerError>;

    /// Declare a fanout exchange. Idempotent.
    async fn declare_fanout_exchange(&self, name: &str) -> Result<(), BrokerError>;

    /// Bind a queue to an exchange. Idempotent.
    async fn bind_queue(&self, queue: &str, exchange: &str) -> Result<(), BrokerError>;

    /// Delete a queue, dropping its messages and consumers. Succeeds if
    /// the queue is already gone.
    async fn delete_queue(&self, name: &str) -> Result<(), BrokerError>;

    /// Publish a message. An empty `exchange` addresses the default
    /// exchange, which routes directly to the queue named by
    /// `routing_key`.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Bytes,
        headers: HashMap<String, String>,
    ) -> Result<(), BrokerError>;

    /// Bound the number of unacknowledged deliveries outstanding on this
    /// channel. Zero means unlimited. Applied before [`subscribe`](Self::subscribe).
    async fn set_prefetch(&self, count: u16) -> Result<(), BrokerError>;

    /// Subscribe to a queue. Returns the consumer tag.
    async fn subscribe(
        &self,
        queue: &str,
        handler: DeliveryHandler,
    ) -> Result<String, BrokerError>;

    /// Acknowledge a delivery, removing it from this channel's
    /// unacknowledged window.
    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError>;

    /// Reject a delivery and return it to the head of its queue for
    /// redelivery.
    async fn reject_requeue(&self, delivery_tag: u64) -> Result<(), BrokerError>;

    /// Cancel a subscription. Unacknowledged deliveries stay outstanding
    /// until acked, rejected, recovered, or the channel closes.
    async fn cancel(&self, consumer_tag: &str) -> Result<(), BrokerError>;

    /// Return every unacknowledged delivery on this channel to its queue.
    async fn recover_requeue(&self) -> Result<(), BrokerError>;

    /// Close the channel, cancelling its subscriptions and requeueing
    /// its unacknowledged deliveries. Idempotent; never raises.
    async fn close(&self);
}
