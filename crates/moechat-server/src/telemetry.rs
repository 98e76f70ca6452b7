//! Fire-and-forget expert-activation publishing.
//!
//! Sessions hand batches to [`TelemetryPublisher::try_publish`], which is
//! synchronous and non-blocking: a bounded queue accepts the batch or drops
//! it when full, so telemetry can never apply backpressure to the client
//! stream. A forwarder task fans accepted batches out to a broadcast topic
//! keyed by deployment; any number of visualization subscribers attach
//! independently.

use metrics::counter;
use moechat_core::telemetry::ActivationBatch;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::metrics::{TELEMETRY_DROPPED_TOTAL, TELEMETRY_PUBLISHED_TOTAL};

/// Publishing handle shared by all relay sessions.
#[derive(Clone, Debug)]
pub struct TelemetryPublisher {
    tx: mpsc::Sender<ActivationBatch>,
    topic: broadcast::Sender<ActivationBatch>,
}

impl TelemetryPublisher {
    /// Create the publisher and spawn its forwarder task.
    ///
    /// The forwarder exits when every publisher clone is dropped.
    pub fn spawn(capacity: usize) -> (Self, JoinHandle<()>) {
        let capacity = capacity.max(1);
        let (tx, mut rx) = mpsc::channel::<ActivationBatch>(capacity);
        let (topic, _) = broadcast::channel(capacity);

        let fanout = topic.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(batch) = rx.recv().await {
                counter!(TELEMETRY_PUBLISHED_TOTAL).increment(1);
                // Err means no subscribers are attached; that is fine.
                let _ = fanout.send(batch);
            }
        });

        (Self { tx, topic }, forwarder)
    }

    /// Hand off a batch without waiting.
    ///
    /// Empty batches are ignored; a full queue drops the batch (counted);
    /// failures never reach the caller.
    pub fn try_publish(&self, batch: ActivationBatch) {
        if batch.is_empty() {
            return;
        }
        match self.tx.try_send(batch) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                counter!(TELEMETRY_DROPPED_TOTAL).increment(1);
                debug!("telemetry queue full, dropping batch");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("telemetry forwarder gone, dropping batch");
            }
        }
    }

    /// Attach a subscriber to the deployment topic.
    pub fn subscribe(&self) -> broadcast::Receiver<ActivationBatch> {
        self.topic.subscribe()
    }
}
