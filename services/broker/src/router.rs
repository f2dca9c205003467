//! The fan-out drain: the single consumer of the router queue.
//!
//! Batches arrive from publisher connections in queue order; each one is
//! wrapped in an `Arc` and offered to every matching subscriber.  The
//! periodic sweep runs between dispatches — the quiescent point where
//! expired subscriptions are purged and disconnected subscribers reaped.

use crate::batch::MessageBatch;
use crate::registry::SubscriberRegistry;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::debug;

/// Drain the router queue until shutdown (or every publisher sender gone).
pub async fn run_router(
    mut queue: mpsc::Receiver<MessageBatch>,
    registry: Arc<SubscriberRegistry>,
    sweep_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut sweep = tokio::time::interval(sweep_interval);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.wait_for(|stop| *stop) => break,
            _ = sweep.tick() => registry.sweep(),
            batch = queue.recv() => {
                let Some(batch) = batch else { break };
                let batch = Arc::new(batch);
                let delivered = registry.dispatch(&batch);
                debug!(
                    topic = %batch.topic(),
                    bytes = batch.len(),
                    delivered,
                    "batch routed"
                );
            }
        }
    }

    // Late arrivals from publishers mid-push are drained once and
    // discarded; nothing is delivered after shutdown.
    queue.close();
    while queue.try_recv().is_ok() {}
}
