//! Partitioned stream reader
//!
//! Every read opens a fresh reader anchored at `now - lookback`; no offsets
//! are kept between calls or across restarts. Two consequences callers must
//! live with:
//! - reading the same partition twice within the window returns the same
//!   first record again
//! - a record older than the window is never seen, however it was missed
//!
//! Callers wanting continuous consumption loop over `read_next` themselves.

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use futures::future::join_all;
use tracing::{debug, error, info};

use crate::message::EventRecord;
use crate::transport::ServiceTransport;
use crate::utils::error::ReceiveError;

pub struct PartitionedReader {
    service: Arc<dyn ServiceTransport>,
    lookback: Duration,
    wait: Duration,
}

impl PartitionedReader {
    /// `lookback` is the default window for `read_next_per_partition`;
    /// `wait` bounds how long one read waits for a record.
    pub fn new(service: Arc<dyn ServiceTransport>, lookback: Duration, wait: Duration) -> Self {
        Self {
            service,
            lookback,
            wait,
        }
    }

    pub fn lookback(&self) -> Duration {
        self.lookback
    }

    /// Partition ids from the hub's runtime information.
    pub async fn list_partitions(&self) -> Result<Vec<String>, ReceiveError> {
        let ids = self.service.partition_ids().await.map_err(|e| {
            error!(error = %e, "partition discovery failed");
            ReceiveError::from(e)
        })?;
        debug!(partitions = ids.len(), "partitions discovered");
        Ok(ids)
    }

    /// Returns the first record of `partition_id` enqueued within
    /// `lookback`, or `None` if none shows up before the wait timeout.
    pub async fn read_next(
        &self,
        partition_id: &str,
        lookback: Duration,
    ) -> Result<Option<EventRecord>, ReceiveError> {
        let window = TimeDelta::from_std(lookback)
            .map_err(|e| ReceiveError::InvalidWindow(e.to_string()))?;
        let since = Utc::now()
            .checked_sub_signed(window)
            .ok_or_else(|| ReceiveError::InvalidWindow(format!("{lookback:?} is out of range")))?;

        let record = self
            .service
            .read_partition(partition_id, since, self.wait)
            .await?;
        match &record {
            Some(record) => info!(
                partition = partition_id,
                offset = record.offset,
                data = %record.text(),
                "message received"
            ),
            None => debug!(partition = partition_id, "no data within window"),
        }
        Ok(record)
    }

    /// Reads the next record of every partition concurrently, using the
    /// reader's default lookback.
    pub async fn read_next_per_partition(
        &self,
    ) -> Result<Vec<(String, Option<EventRecord>)>, ReceiveError> {
        let partitions = self.list_partitions().await?;
        let reads = partitions
            .iter()
            .map(|partition| self.read_next(partition, self.lookback));
        let results = join_all(reads).await;

        partitions
            .into_iter()
            .zip(results)
            .map(|(partition, result)| result.map(|record| (partition, record)))
            .collect()
    }
}
