//! Shared types and identifiers for Covey.
//!
//! This crate defines the core types used across the Covey workspace:
//! peer identity ([`PeerId`]), the unit of tracked work ([`Bucket`]),
//! the gossip message grammar ([`Gossip`]), broker naming conventions
//! ([`ClusterNames`]), and distributor tuning ([`DistributorOptions`]).

pub mod identity;

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

// ---------------------------------------------------------------------------
// Peer identity
// ---------------------------------------------------------------------------

/// Header key carrying the sender's peer id on every broadcast message.
pub const PEER_ID_HEADER: &str = "peer-id";

/// Stable identity of a peer process for the lifetime of that process.
///
/// Rendered as `<hostname>/<fragment>`, where the fragment is a random
/// pick from the bundled word list. The fragment is cosmetic: membership
/// is keyed by the full identity string, and colliding peers simply
/// refresh each other's map entry until one of them expires.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(String);

impl PeerId {
    /// Wrap an existing identity string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh identity for this process: `<hostname>/<fragment>`.
    pub fn generate() -> Self {
        Self(format!(
            "{}/{}",
            identity::detect_hostname(),
            identity::random_fragment()
        ))
    }

    /// Return the identity as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// ---------------------------------------------------------------------------
// Buckets
// ---------------------------------------------------------------------------

/// A named unit of partitionable work, paired with the broker delivery
/// tag that identifies the in-flight delivery carrying it.
///
/// The `(name, delivery_tag)` pair is the unit of consumer-side tracking;
/// clients only ever see the name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bucket {
    /// Opaque bucket name, as seeded into the pool.
    pub name: String,
    /// Broker-assigned tag for the delivery currently carrying this bucket.
    pub delivery_tag: u64,
}

impl Bucket {
    /// Create a bucket record for a delivery.
    pub fn new(name: impl Into<String>, delivery_tag: u64) -> Self {
        Self {
            name: name.into(),
            delivery_tag,
        }
    }
}

// ---------------------------------------------------------------------------
// Gossip grammar
// ---------------------------------------------------------------------------

/// The three verbs spoken on the broadcast exchange.
///
/// Wire encoding is plain UTF-8: `announce:<peer-id>`, `retract:<peer-id>`,
/// or the literal `poll`. Anything else is ignored by receivers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Gossip {
    /// Periodic liveness signal; also sent in response to [`Gossip::Poll`].
    Announce(PeerId),
    /// Sent once on graceful departure.
    Retract(PeerId),
    /// Sent once by a starting peer to prompt immediate announces.
    Poll,
}

impl Gossip {
    /// Encode for the wire.
    pub fn encode(&self) -> String {
        match self {
            Gossip::Announce(id) => format!("announce:{id}"),
            Gossip::Retract(id) => format!("retract:{id}"),
            Gossip::Poll => "poll".to_string(),
        }
    }

    /// Parse a wire message. Returns `None` for unknown or malformed input.
    pub fn parse(raw: &str) -> Option<Self> {
        if let Some(id) = raw.strip_prefix("announce:") {
            if id.is_empty() {
                return None;
            }
            return Some(Gossip::Announce(PeerId::new(id)));
        }
        if let Some(id) = raw.strip_prefix("retract:") {
            if id.is_empty() {
                return None;
            }
            return Some(Gossip::Retract(PeerId::new(id)));
        }
        if raw == "poll" {
            return Some(Gossip::Poll);
        }
        None
    }
}

impl fmt::Display for Gossip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

// ---------------------------------------------------------------------------
// Broker naming
// ---------------------------------------------------------------------------

/// Broker resource names derived from a cluster name.
///
/// These names are compatibility-critical: every peer of a cluster must
/// derive the same queue and exchange names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterNames {
    /// Exclusive queue used as the pool-seeding lock.
    pub owner_queue: String,
    /// Shared queue holding one message per undelivered bucket.
    pub bucket_queue: String,
    /// Fanout exchange carrying the gossip verbs.
    pub broadcast_exchange: String,
}

impl ClusterNames {
    /// Derive all broker names for the given cluster.
    pub fn for_cluster(cluster: &str) -> Self {
        Self {
            owner_queue: format!("{cluster}.bucket.owner"),
            bucket_queue: format!("{cluster}.bucket"),
            broadcast_exchange: format!("{cluster}.bucket.broadcast"),
        }
    }
}

// ---------------------------------------------------------------------------
// Distributor tuning
// ---------------------------------------------------------------------------

/// Timing knobs for the distributor's periodic work.
#[derive(Debug, Clone)]
pub struct DistributorOptions {
    /// Cadence of the self-announce / peer-expiry task.
    pub peers_period: Duration,
    /// Age after which a silent peer is dropped from the map.
    pub expiration_period: Duration,
    /// Delay before the first share recomputation.
    pub partition_delay: Duration,
    /// Cadence of share recomputation.
    pub partition_period: Duration,
}

impl Default for DistributorOptions {
    fn default() -> Self {
        Self {
            peers_period: Duration::from_secs(60),
            expiration_period: Duration::from_secs(120),
            partition_delay: Duration::from_secs(5),
            partition_period: Duration::from_secs(5),
        }
    }
}

/// Current wall-clock time in milliseconds since UNIX epoch.
///
/// Used for peer last-seen stamps. Clock jumps can cause spurious
/// expiries or keepalives but never violate safety: the broker remains
/// the source of truth for bucket ownership.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
