//! Broker gateway for Covey.
//!
//! This crate provides:
//!
//! - [`Connection`] / [`Channel`] — the thin adapter traits exposing the
//!   broker capabilities the core needs: queue and exchange declaration,
//!   publish, subscribe with per-channel prefetch, acknowledgement,
//!   reject-with-requeue, and recovery.
//! - [`MemoryBroker`] — a complete in-process implementation of the
//!   gateway contract, used by tests and by embedders running a
//!   single-process cluster.

mod error;
pub mod memory;
mod traits;

pub use error::BrokerError;
pub use memory::MemoryBroker;
pub use traits::{Channel, Connection, Delivery, DeliveryHandler, QueueOptions};
