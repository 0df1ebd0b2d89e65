use crate::aggregator::BatchAggregator;
use crate::channel::ConfirmationEvent;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Periodically seals due batches and submits anything sealed but not yet
/// accepted by the settlement channel.
pub fn spawn_flush_loop(
    aggregator: Arc<BatchAggregator>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = Duration::from_millis(aggregator.config().flush_interval_ms.max(1));
        let mut ticker = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => {
                    info!("flush loop stopping");
                    return;
                }
            }
            if let Err(err) = aggregator.flush_due().await {
                warn!(error = %err, "flush failed");
            }
            for batch_id in aggregator.unsubmitted().await {
                if let Err(err) = aggregator.submit(&batch_id).await {
                    warn!(batch_id = %batch_id, error = %err, "batch submission failed");
                }
            }
        }
    })
}

pub fn spawn_confirmation_listener(
    aggregator: Arc<BatchAggregator>,
    mut events: broadcast::Receiver<ConfirmationEvent>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                received = events.recv() => received,
                _ = shutdown.changed() => {
                    info!("confirmation listener stopping");
                    return;
                }
            };
            match event {
                Ok(event) => {
                    if let Err(err) = aggregator.handle_event(event).await {
                        warn!(error = %err, "confirmation event not applied");
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "confirmation listener lagged");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("confirmation channel closed");
                    return;
                }
            }
        }
    })
}
