//! In-process broker backend.
//!
//! [`MemoryBroker`] implements the full gateway contract against plain
//! process memory: named queues with asserted declaration options,
//! exclusive ownership, auto-named queues, fanout exchanges, the default
//! exchange, per-channel prefetch windows, acknowledgement,
//! reject-with-requeue, recovery, and close-requeues-unacked semantics.
//!
//! Useful for tests and for embedders running an entire cluster inside
//! one process. Delivery is push-based: whenever a queue gains a message
//! or a channel gains credit, ready messages are handed round-robin to
//! subscribed consumers with available credit. Handlers are never
//! invoked while internal locks are held.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tracing::{debug, trace};

use crate::error::BrokerError;
use crate::traits::{Channel, Connection, Delivery, DeliveryHandler, QueueOptions};

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct Message {
    payload: Bytes,
    headers: HashMap<String, String>,
}

struct Consumer {
    tag: String,
    channel: u64,
    handler: DeliveryHandler,
}

struct Queue {
    options: QueueOptions,
    exclusive_owner: Option<u64>,
    messages: VecDeque<Message>,
    consumers: Vec<Consumer>,
    /// Round-robin cursor over `consumers`.
    cursor: usize,
}

struct Exchange {
    bindings: Vec<String>,
}

struct Unacked {
    queue: String,
    message: Message,
}

struct ChannelRecord {
    connection: u64,
    open: bool,
    prefetch: u16,
    unacked: HashMap<u64, Unacked>,
}

struct ConnectionRecord {
    open: bool,
    channels: Vec<u64>,
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, Queue>,
    exchanges: HashMap<String, Exchange>,
    channels: HashMap<u64, ChannelRecord>,
    connections: HashMap<u64, ConnectionRecord>,
}

/// Deliveries staged under the lock, dispatched after it is released.
type Staged = Vec<(DeliveryHandler, Delivery)>;

impl BrokerState {
    fn channel_has_credit(&self, channel_id: u64) -> bool {
        self.channels.get(&channel_id).is_some_and(|ch| {
            ch.open && (ch.prefetch == 0 || ch.unacked.len() < ch.prefetch as usize)
        })
    }

    /// Hand ready messages on `queue_name` to consumers with credit,
    /// round-robin, until the queue drains or credit runs out.
    fn pump(&mut self, queue_name: &str, next_tag: &AtomicU64, out: &mut Staged) {
        loop {
            let Some(queue) = self.queues.get(queue_name) else {
                return;
            };
            if queue.messages.is_empty() || queue.consumers.is_empty() {
                return;
            }

            let count = queue.consumers.len();
            let mut pick = None;
            for i in 0..count {
                let idx = (queue.cursor + i) % count;
                let consumer = &queue.consumers[idx];
                if self.channel_has_credit(consumer.channel) {
                    pick = Some((idx, consumer.channel));
                    break;
                }
            }
            let Some((idx, channel_id)) = pick else {
                return;
            };

            let queue = self.queues.get_mut(queue_name).expect("queue exists");
            let message = queue.messages.pop_front().expect("message exists");
            let handler = queue.consumers[idx].handler.clone();
            queue.cursor = (idx + 1) % queue.consumers.len();

            let tag = next_tag.fetch_add(1, Ordering::Relaxed);
            let channel = self.channels.get_mut(&channel_id).expect("channel exists");
            channel.unacked.insert(
                tag,
                Unacked {
                    queue: queue_name.to_string(),
                    message: message.clone(),
                },
            );

            trace!(queue = queue_name, tag, "delivering message");
            out.push((
                handler,
                Delivery {
                    delivery_tag: tag,
                    headers: message.headers,
                    payload: message.payload,
                },
            ));
        }
    }

    /// Push unacked entries back to the head of their queues, preserving
    /// delivery order, and pump every touched queue.
    fn requeue(&mut self, unacked: HashMap<u64, Unacked>, next_tag: &AtomicU64, out: &mut Staged) {
        let mut entries: Vec<(u64, Unacked)> = unacked.into_iter().collect();
        // Descending by tag: repeated push_front leaves the oldest in front.
        entries.sort_by_key(|(tag, _)| std::cmp::Reverse(*tag));

        let mut touched = BTreeSet::new();
        for (_, entry) in entries {
            if let Some(queue) = self.queues.get_mut(&entry.queue) {
                queue.messages.push_front(entry.message);
                touched.insert(entry.queue);
            }
        }
        for name in touched {
            self.pump(&name, next_tag, out);
        }
    }

    /// Remove a consumer by tag, deleting its queue if the queue is
    /// auto-delete and now has no consumers.
    fn remove_consumer(&mut self, consumer_tag: &str) {
        let mut emptied = None;
        for (name, queue) in self.queues.iter_mut() {
            let before = queue.consumers.len();
            queue.consumers.retain(|c| c.tag != consumer_tag);
            if queue.consumers.len() != before {
                queue.cursor = 0;
                if queue.options.auto_delete && queue.consumers.is_empty() {
                    emptied = Some(name.clone());
                }
                break;
            }
        }
        if let Some(name) = emptied {
            debug!(queue = %name, "auto-deleting queue after last cancel");
            self.queues.remove(&name);
        }
    }

    /// Close a channel: drop its consumers and return its unacked
    /// deliveries to their queues.
    fn close_channel(&mut self, channel_id: u64, next_tag: &AtomicU64, out: &mut Staged) {
        let Some(channel) = self.channels.get_mut(&channel_id) else {
            return;
        };
        if !channel.open {
            return;
        }
        channel.open = false;
        let unacked = std::mem::take(&mut channel.unacked);

        let mut emptied = Vec::new();
        for (name, queue) in self.queues.iter_mut() {
            let before = queue.consumers.len();
            queue.consumers.retain(|c| c.channel != channel_id);
            if queue.consumers.len() != before {
                queue.cursor = 0;
                if queue.options.auto_delete && queue.consumers.is_empty() {
                    emptied.push(name.clone());
                }
            }
        }
        for name in emptied {
            self.queues.remove(&name);
        }

        self.requeue(unacked, next_tag, out);
    }
}

struct BrokerInner {
    state: Mutex<BrokerState>,
    next_connection: AtomicU64,
    next_channel: AtomicU64,
    next_tag: AtomicU64,
    next_queue_name: AtomicU64,
    next_consumer_tag: AtomicU64,
}

impl BrokerInner {
    /// Run `f` under the state lock, then invoke any staged deliveries
    /// with the lock released.
    fn with_state<T>(
        &self,
        f: impl FnOnce(&mut BrokerState, &mut Staged) -> Result<T, BrokerError>,
    ) -> Result<T, BrokerError> {
        let mut staged = Staged::new();
        let result = {
            let mut state = self.state.lock().expect("broker lock poisoned");
            f(&mut state, &mut staged)
        };
        for (handler, delivery) in staged {
            handler(delivery);
        }
        result
    }
}

// ---------------------------------------------------------------------------
// Public broker
// ---------------------------------------------------------------------------

/// An in-process broker implementing the gateway contract.
///
/// Cheap to clone; all clones share the same queues and exchanges.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

impl MemoryBroker {
    /// Create an empty broker.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                state: Mutex::new(BrokerState::default()),
                next_connection: AtomicU64::new(1),
                next_channel: AtomicU64::new(1),
                next_tag: AtomicU64::new(1),
                next_queue_name: AtomicU64::new(1),
                next_consumer_tag: AtomicU64::new(1),
            }),
        }
    }

    /// Open a connection. Each call simulates a distinct peer process;
    /// exclusive-queue ownership is scoped to one connection.
    pub fn connect(&self) -> Arc<dyn Connection> {
        let id = self.inner.next_connection.fetch_add(1, Ordering::Relaxed);
        let mut state = self.inner.state.lock().expect("broker lock poisoned");
        state.connections.insert(
            id,
            ConnectionRecord {
                open: true,
                channels: Vec::new(),
            },
        );
        drop(state);
        Arc::new(MemoryConnection {
            id,
            inner: Arc::clone(&self.inner),
        })
    }

    /// Number of ready (undelivered) messages in a queue, if it exists.
    pub fn ready_messages(&self, queue: &str) -> Option<usize> {
        let state = self.inner.state.lock().expect("broker lock poisoned");
        state.queues.get(queue).map(|q| q.messages.len())
    }

    /// Whether a queue currently exists.
    pub fn queue_exists(&self, queue: &str) -> bool {
        let state = self.inner.state.lock().expect("broker lock poisoned");
        state.queues.contains_key(queue)
    }

    /// Total unacknowledged deliveries across all channels.
    pub fn unacked_total(&self) -> usize {
        let state = self.inner.state.lock().expect("broker lock poisoned");
        state.channels.values().map(|ch| ch.unacked.len()).sum()
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock().expect("broker lock poisoned");
        f.debug_struct("MemoryBroker")
            .field("queues", &state.queues.len())
            .field("exchanges", &state.exchanges.len())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

struct MemoryConnection {
    id: u64,
    inner: Arc<BrokerInner>,
}

#[async_trait::async_trait]
impl Connection for MemoryConnection {
    async fn open_channel(&self) -> Result<Arc<dyn Channel>, BrokerError> {
        let channel_id = self.inner.next_channel.fetch_add(1, Ordering::Relaxed);
        let connection_id = self.id;
        self.inner.with_state(|state, _| {
            let connection = state
                .connections
                .get_mut(&connection_id)
                .filter(|c| c.open)
                .ok_or_else(|| BrokerError::Unavailable("connection closed".into()))?;
            connection.channels.push(channel_id);
            state.channels.insert(
                channel_id,
                ChannelRecord {
                    connection: connection_id,
                    open: true,
                    prefetch: 0,
                    unacked: HashMap::new(),
                },
            );
            Ok(())
        })?;
        Ok(Arc::new(MemoryChannel {
            id: channel_id,
            inner: Arc::clone(&self.inner),
        }))
    }

    async fn close(&self) {
        let connection_id = self.id;
        let _ = self.inner.with_state(|state, staged| {
            let Some(connection) = state.connections.get_mut(&connection_id) else {
                return Ok(());
            };
            if !connection.open {
                return Ok(());
            }
            connection.open = false;
            let channels = std::mem::take(&mut connection.channels);
            for channel_id in channels {
                state.close_channel(channel_id, &self.inner.next_tag, staged);
            }
            // Exclusive queues die with their connection.
            let owned: Vec<String> = state
                .queues
                .iter()
                .filter(|(_, q)| q.exclusive_owner == Some(connection_id))
                .map(|(name, _)| name.clone())
                .collect();
            for name in owned {
                debug!(queue = %name, "dropping exclusive queue with connection");
                state.queues.remove(&name);
            }
            Ok(())
        });
    }
}

// ---------------------------------------------------------------------------
// Channel
// ---------------------------------------------------------------------------

struct MemoryChannel {
    id: u64,
    inner: Arc<BrokerInner>,
}

impl MemoryChannel {
    fn require_open(state: &BrokerState, channel_id: u64) -> Result<u64, BrokerError> {
        let channel = state
            .channels
            .get(&channel_id)
            .filter(|ch| ch.open)
            .ok_or(BrokerError::ChannelClosed)?;
        Ok(channel.connection)
    }
}

#[async_trait::async_trait]
impl Channel for MemoryChannel {
    async fn declare_queue(
        &self,
        name: &str,
        options: QueueOptions,
    ) -> Result<String, BrokerError> {
        let channel_id = self.id;
        let auto_name = if name.is_empty() {
            Some(format!(
                "amq.gen-{}",
                self.inner.next_queue_name.fetch_add(1, Ordering::Relaxed)
            ))
        } else {
            None
        };
        let name = auto_name.unwrap_or_else(|| name.to_string());

        self.inner.with_state(move |state, _| {
            let connection_id = Self::require_open(state, channel_id)?;
            if let Some(existing) = state.queues.get(&name) {
                if let Some(owner) = existing.exclusive_owner
                    && owner != connection_id
                {
                    return Err(BrokerError::ResourceLocked { queue: name });
                }
                if existing.options != options {
                    return Err(BrokerError::QueueConflict { queue: name });
                }
                return Ok(name);
            }
            debug!(queue = %name, ?options, "declaring queue");
            state.queues.insert(
                name.clone(),
                Queue {
                    options,
                    exclusive_owner: options.exclusive.then_some(connection_id),
                    messages: VecDeque::new(),
                    consumers: Vec::new(),
                    cursor: 0,
                },
            );
            Ok(name)
        })
    }

    async fn declare_queue_passive(&self, name: &str) -> Result<(), BrokerError> {
        let channel_id = self.id;
        let name = name.to_string();
        self.inner.with_state(move |state, _| {
            Self::require_open(state, channel_id)?;
            if state.queues.contains_key(&name) {
                Ok(())
            } else {
                Err(BrokerError::NotFound(name))
            }
        })
    }

    async fn declare_fanout_exchange(&self, name: &str) -> Result<(), BrokerError> {
        let channel_id = self.id;
        let name = name.to_string();
        self.inner.with_state(move |state, _| {
            Self::require_open(state, channel_id)?;
            state.exchanges.entry(name).or_insert(Exchange {
                bindings: Vec::new(),
            });
            Ok(())
        })
    }

    async fn bind_queue(&self, queue: &str, exchange: &str) -> Result<(), BrokerError> {
        let channel_id = self.id;
        let queue = queue.to_string();
        let exchange = exchange.to_string();
        self.inner.with_state(move |state, _| {
            Self::require_open(state, channel_id)?;
            if !state.queues.contains_key(&queue) {
                return Err(BrokerError::NotFound(queue));
            }
            let record = state
                .exchanges
                .get_mut(&exchange)
                .ok_or(BrokerError::NotFound(exchange))?;
            if !record.bindings.contains(&queue) {
                record.bindings.push(queue);
            }
            Ok(())
        })
    }

    async fn delete_queue(&self, name: &str) -> Result<(), BrokerError> {
        let channel_id = self.id;
        let name = name.to_string();
        self.inner.with_state(move |state, _| {
            Self::require_open(state, channel_id)?;
            state.queues.remove(&name);
            for exchange in state.exchanges.values_mut() {
                exchange.bindings.retain(|q| q != &name);
            }
            Ok(())
        })
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Bytes,
        headers: HashMap<String, String>,
    ) -> Result<(), BrokerError> {
        let channel_id = self.id;
        let exchange = exchange.to_string();
        let routing_key = routing_key.to_string();
        let next_tag = &self.inner.next_tag;
        self.inner.with_state(move |state, staged| {
            Self::require_open(state, channel_id)?;
            let message = Message { payload, headers };

            if exchange.is_empty() {
                // Default exchange: route straight to the named queue.
                if let Some(queue) = state.queues.get_mut(&routing_key) {
                    queue.messages.push_back(message);
                    state.pump(&routing_key, next_tag, staged);
                } else {
                    debug!(queue = %routing_key, "dropping unroutable message");
                }
                return Ok(());
            }

            let targets = state
                .exchanges
                .get(&exchange)
                .ok_or(BrokerError::NotFound(exchange))?
                .bindings
                .clone();
            for target in targets {
                if let Some(queue) = state.queues.get_mut(&target) {
                    queue.messages.push_back(message.clone());
                    state.pump(&target, next_tag, staged);
                }
            }
            Ok(())
        })
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), BrokerError> {
        let channel_id = self.id;
        self.inner.with_state(move |state, _| {
            Self::require_open(state, channel_id)?;
            state
                .channels
                .get_mut(&channel_id)
                .expect("channel exists")
                .prefetch = count;
            Ok(())
        })
    }

    async fn subscribe(
        &self,
        queue: &str,
        handler: DeliveryHandler,
    ) -> Result<String, BrokerError> {
        let channel_id = self.id;
        let queue = queue.to_string();
        let tag = format!(
            "ctag-{}",
            self.inner.next_consumer_tag.fetch_add(1, Ordering::Relaxed)
        );
        let next_tag = &self.inner.next_tag;
        self.inner.with_state(move |state, staged| {
            Self::require_open(state, channel_id)?;
            let record = state
                .queues
                .get_mut(&queue)
                .ok_or_else(|| BrokerError::NotFound(queue.clone()))?;
            record.consumers.push(Consumer {
                tag: tag.clone(),
                channel: channel_id,
                handler,
            });
            state.pump(&queue, next_tag, staged);
            Ok(tag)
        })
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        let channel_id = self.id;
        let next_tag = &self.inner.next_tag;
        self.inner.with_state(move |state, staged| {
            Self::require_open(state, channel_id)?;
            let channel = state.channels.get_mut(&channel_id).expect("channel exists");
            if let Some(entry) = channel.unacked.remove(&delivery_tag) {
                // Credit freed; ready messages may now flow.
                state.pump(&entry.queue, next_tag, staged);
            }
            Ok(())
        })
    }

    async fn reject_requeue(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        let channel_id = self.id;
        let next_tag = &self.inner.next_tag;
        self.inner.with_state(move |state, staged| {
            Self::require_open(state, channel_id)?;
            let channel = state.channels.get_mut(&channel_id).expect("channel exists");
            if let Some(entry) = channel.unacked.remove(&delivery_tag) {
                if let Some(queue) = state.queues.get_mut(&entry.queue) {
                    queue.messages.push_front(entry.message);
                    state.pump(&entry.queue, next_tag, staged);
                }
            }
            Ok(())
        })
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), BrokerError> {
        let channel_id = self.id;
        let consumer_tag = consumer_tag.to_string();
        self.inner.with_state(move |state, _| {
            Self::require_open(state, channel_id)?;
            state.remove_consumer(&consumer_tag);
            Ok(())
        })
    }

    async fn recover_requeue(&self) -> Result<(), BrokerError> {
        let channel_id = self.id;
        let next_tag = &self.inner.next_tag;
        self.inner.with_state(move |state, staged| {
            Self::require_open(state, channel_id)?;
            let channel = state.channels.get_mut(&channel_id).expect("channel exists");
            let unacked = std::mem::take(&mut channel.unacked);
            state.requeue(unacked, next_tag, staged);
            Ok(())
        })
    }

    async fn close(&self) {
        let channel_id = self.id;
        let next_tag = &self.inner.next_tag;
        let _ = self.inner.with_state(move |state, staged| {
            state.close_channel(channel_id, next_tag, staged);
            Ok(())
        });
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
