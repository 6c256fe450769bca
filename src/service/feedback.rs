use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::message::{FeedbackBatch, FeedbackRecord};
use crate::transport::ServiceTransport;
use crate::utils::error::{AckError, ReceiveError};

/// Pulls delivery feedback from the hub's feedback queue.
///
/// Delivery is at-least-once: a batch that is never committed comes back on
/// a later pull.
pub struct FeedbackCollector {
    service: Arc<dyn ServiceTransport>,
    wait: Duration,
}

impl FeedbackCollector {
    pub fn new(service: Arc<dyn ServiceTransport>, wait: Duration) -> Self {
        Self { service, wait }
    }

    /// Returns the next batch, or an empty one if nothing arrived within the
    /// wait timeout.
    pub async fn pull_feedback(&self) -> Result<FeedbackBatch, ReceiveError> {
        let batch = self.service.receive_feedback(self.wait).await.map_err(|e| {
            warn!(error = %e, "feedback receive failed");
            ReceiveError::from(e)
        })?;
        if !batch.is_empty() {
            info!(
                records = batch.len(),
                statuses = %batch
                    .records
                    .iter()
                    .map(|r| r.status.to_string())
                    .collect::<Vec<_>>()
                    .join(", "),
                "received feedback"
            );
        }
        Ok(batch)
    }

    /// Marks `batch` consumed. Committing an empty batch does nothing.
    pub async fn commit(&self, batch: &FeedbackBatch) -> Result<(), AckError> {
        let Some(batch_id) = batch.batch_id.as_deref() else {
            return Ok(());
        };
        match self.service.complete_feedback(batch_id).await {
            Ok(()) => {
                debug!(batch_id, "feedback batch committed");
                Ok(())
            }
            Err(source) => {
                let err = AckError {
                    target: format!("feedback batch {batch_id}"),
                    source,
                };
                warn!(error = %err, "feedback commit failed, batch will be redelivered");
                Err(err)
            }
        }
    }

    /// Pulls one batch, commits it straight away and returns its records. A
    /// failed commit is logged only; the records may show up again later.
    pub async fn drain(&self) -> Result<Vec<FeedbackRecord>, ReceiveError> {
        let batch = self.pull_feedback().await?;
        let _ = self.commit(&batch).await;
        Ok(batch.records)
    }
}
