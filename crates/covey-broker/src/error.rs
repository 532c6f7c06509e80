//! Error types for the broker gateway.

/// Errors surfaced by broker gateway operations.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// The broker refused a connection or channel.
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    /// A queue was declared with parameters that differ from the
    /// existing declaration. Fatal at startup; requires operator
    /// intervention.
    #[error("queue declaration conflict: {queue}")]
    QueueConflict {
        /// The conflicting queue name.
        queue: String,
    },

    /// An exclusive declaration lost to another connection. For the
    /// pool-seeding lock this signals that another peer is seeding, not
    /// a failure.
    #[error("resource locked by another connection: {queue}")]
    ResourceLocked {
        /// The exclusively-owned queue name.
        queue: String,
    },

    /// A passive declare probe missed, or an operation referenced an
    /// unknown queue or exchange.
    #[error("not found: {0}")]
    NotFound(String),

    /// The channel is no longer usable.
    #[error("channel closed")]
    ChannelClosed,
}
