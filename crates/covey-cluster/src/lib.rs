//! Bucket distribution across a dynamic cluster of peers, with a message
//! broker as the only shared substrate.
//!
//! This crate provides:
//!
//! - [`pool`] — exactly-once seeding of the shared bucket queue under an
//!   exclusive-queue lock.
//! - [`consumer`] — the per-peer bucket consumer state machine with
//!   drain-before-stop semantics.
//! - [`broadcast`] — fanout-based gossip carrying the announce / retract /
//!   poll verbs.
//! - [`distributor`] — the orchestrator: peer identity, cluster view,
//!   periodic self-announce and share recomputation, and the consumer
//!   restart coordination.

pub mod broadcast;
pub mod consumer;
pub mod distributor;
pub mod pool;


pub use broadcast::{BroadcastConsumer, BroadcastHandler, send_broadcast};
pub use consumer::{BucketConsumer, ConsumerStatus};
pub use distributor::Distributor;
pub use pool::init_buckets;

use tracing::debug;

/// Log-and-continue for teardown paths.
///
/// Broker channels become unusable after a single protocol error, so
/// failures while tearing one down carry no information worth acting on.
pub(crate) fn best_effort<E: std::fmt::Display>(what: &str, result: Result<(), E>) {
    if let Err(e) = result {
        debug!(error = %e, "{what} failed, continuing");
    }
}
