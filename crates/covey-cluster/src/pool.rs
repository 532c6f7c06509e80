//! Exactly-once seeding of the shared bucket pool.
//!
//! The bucket queue must be populated with one message per bucket name
//! exactly once in the cluster's life. Racing peers are serialized by an
//! exclusive-queue lock: declaring the owner queue exclusively succeeds
//! for one connection at a time, so exactly one peer runs the critical
//! section while the rest observe the lock as held and back off.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use covey_broker::{BrokerError, Channel, Connection, QueueOptions};
use covey_types::ClusterNames;
use tracing::{debug, info};

use crate::best_effort;

/// Ensure the bucket queue exists and has been seeded with one message
/// per name in `default_buckets`.
///
/// Returns `Ok(())` both when this peer seeded the pool and when another
/// peer holds (or already released) the seeding lock. A channel error
/// mid-seed can leave the queue partially populated; the lock is still
/// released, and callers may retry the whole call on startup.
pub async fn init_buckets(
    connection: &Arc<dyn Connection>,
    names: &ClusterNames,
    default_buckets: &[String],
) -> Result<(), BrokerError> {
    let channel = connection.open_channel().await?;

    let lock = QueueOptions {
        durable: false,
        exclusive: true,
        auto_delete: false,
    };
    match channel.declare_queue(&names.owner_queue, lock).await {
        Ok(_) => {}
        Err(BrokerError::ResourceLocked { .. }) => {
            // Another peer is seeding; complete-by-someone-else.
            debug!(queue = %names.owner_queue, "seed lock held by another peer");
            channel.close().await;
            return Ok(());
        }
        Err(e) => {
            channel.close().await;
            return Err(e);
        }
    }

    let result = seed_pool(&channel, names, default_buckets).await;

    best_effort(
        "seed lock release",
        channel.delete_queue(&names.owner_queue).await,
    );
    channel.close().await;
    result
}

/// The critical section: probe for a previous seeding, otherwise declare
/// the bucket queue and publish every name through the default exchange.
async fn seed_pool(
    channel: &Arc<dyn Channel>,
    names: &ClusterNames,
    default_buckets: &[String],
) -> Result<(), BrokerError> {
    if channel
        .declare_queue_passive(&names.bucket_queue)
        .await
        .is_ok()
    {
        debug!(queue = %names.bucket_queue, "bucket queue already seeded");
        return Ok(());
    }

    channel
        .declare_queue(
            &names.bucket_queue,
            QueueOptions {
                durable: false,
                exclusive: false,
                auto_delete: false,
            },
        )
        .await?;

    for name in default_buckets {
        channel
            .publish(
                "",
                &names.bucket_queue,
                Bytes::from(name.clone()),
                HashMap::new(),
            )
            .await?;
    }

    info!(
        queue = %names.bucket_queue,
        count = default_buckets.len(),
        "seeded bucket pool"
    );
    Ok(())
}
