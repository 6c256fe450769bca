//! In-process hub
//!
//! `MemoryHub` keeps everything a real hub would hold for this layer:
//! - per-device command queues with peek-lock delivery: a received command is
//!   leased under a lock token until completed; an expired lease puts it back
//!   at the head of the queue until `max_delivery_count` is reached
//! - a partitioned device-to-cloud stream (device id hashed onto a partition)
//! - the feedback queue, handed out in locked batches that are released back
//!   to the queue if not completed before their lock expires
//! - a blob container
//!
//! Concurrency notes:
//! - State sits behind one `std::sync::Mutex` which is never held across an
//!   await. Waiters long-poll on a shared `Notify` that is signalled whenever
//!   something new is queued.
//! - Lease and TTL expiry is swept lazily whenever a waiter inspects the
//!   state rather than by a background task. Expired feedback locks are only
//!   released by the next feedback pull.

use std::collections::{HashMap, VecDeque};
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::message::{
    DeliveryHandle, DeviceIdentity, EventRecord, FeedbackBatch, FeedbackRecord, FeedbackStatus,
    InboundMessage, OutboundMessage,
};
use crate::transport::{DeviceConnector, DeviceTransport, ServiceTransport};
use crate::utils::error::TransportError;

/// Operating limits of a `MemoryHub`.
#[derive(Debug, Clone)]
pub struct HubConfig {
    pub partitions: usize,
    pub max_message_bytes: usize,
    /// How long an undelivered command stays queued.
    pub message_ttl: Duration,
    /// How long a received command stays locked before it is redelivered.
    pub lock_duration: Duration,
    pub max_delivery_count: u32,
    pub feedback_batch_size: usize,
    /// Zero releases an uncommitted batch at the next pull.
    pub feedback_lock_duration: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            partitions: 4,
            max_message_bytes: 256 * 1024,
            message_ttl: Duration::from_secs(3600),
            lock_duration: Duration::from_secs(60),
            max_delivery_count: 10,
            feedback_batch_size: 64,
            feedback_lock_duration: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone)]
struct QueuedCommand {
    device_id: String,
    message: OutboundMessage,
    enqueued_at: DateTime<Utc>,
    delivery_count: u32,
}

#[derive(Debug)]
struct Lease {
    command: QueuedCommand,
    locked_until: Instant,
}

#[derive(Debug)]
struct LockedBatch {
    records: Vec<FeedbackRecord>,
    locked_until: Instant,
}

#[derive(Debug, Default)]
struct HubState {
    devices: HashMap<String, String>,
    queues: HashMap<String, VecDeque<QueuedCommand>>,
    leases: HashMap<String, Lease>,
    partitions: Vec<Vec<EventRecord>>,
    feedback: VecDeque<FeedbackRecord>,
    locked_feedback: HashMap<String, LockedBatch>,
    blobs: HashMap<String, Vec<u8>>,
    completed: Vec<String>,
}

#[derive(Debug)]
struct HubInner {
    config: HubConfig,
    state: Mutex<HubState>,
    changed: Notify,
}

/// Cloneable handle to one in-process hub.
#[derive(Debug, Clone)]
pub struct MemoryHub {
    inner: Arc<HubInner>,
}

impl Default for MemoryHub {
    fn default() -> Self {
        Self::new(HubConfig::default())
    }
}

impl MemoryHub {
    pub fn new(config: HubConfig) -> Self {
        let state = HubState {
            partitions: vec![Vec::new(); config.partitions.max(1)],
            ..HubState::default()
        };
        Self {
            inner: Arc::new(HubInner {
                config,
                state: Mutex::new(state),
                changed: Notify::new(),
            }),
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.inner.config
    }

    /// Makes `device_id` known to the hub with the given symmetric key.
    pub fn register_device(&self, device_id: impl Into<String>, key: impl Into<String>) {
        let device_id = device_id.into();
        debug!(device_id = %device_id, "device registered");
        self.lock().devices.insert(device_id, key.into());
    }

    /// Checks the identity and returns a device channel bound to it.
    pub fn device_transport(
        &self,
        identity: &DeviceIdentity,
    ) -> Result<MemoryDeviceTransport, TransportError> {
        let state = self.lock();
        match state.devices.get(&identity.device_id) {
            Some(key) if *key == identity.symmetric_key => Ok(MemoryDeviceTransport {
                hub: self.clone(),
                device_id: identity.device_id.clone(),
            }),
            Some(_) => Err(TransportError::Unauthorized(format!(
                "invalid key for device {}",
                identity.device_id
            ))),
            None => Err(TransportError::Unauthorized(format!(
                "unknown device {}",
                identity.device_id
            ))),
        }
    }

    /// Index of the partition that receives events from `device_id`.
    pub fn partition_for(&self, device_id: &str) -> usize {
        partition_index(device_id, self.lock().partitions.len())
    }

    /// Message ids of every command completed so far, in completion order.
    pub fn completed_message_ids(&self) -> Vec<String> {
        self.lock().completed.clone()
    }

    /// Commands for `device_id` that are queued or locked by a receiver.
    pub fn pending_commands(&self, device_id: &str) -> usize {
        let state = self.lock();
        let queued = state.queues.get(device_id).map_or(0, VecDeque::len);
        let leased = state
            .leases
            .values()
            .filter(|lease| lease.command.device_id == device_id)
            .count();
        queued + leased
    }

    pub fn events(&self, partition: usize) -> Vec<EventRecord> {
        self.lock()
            .partitions
            .get(partition)
            .cloned()
            .unwrap_or_default()
    }

    pub fn blob(&self, name: &str) -> Option<Vec<u8>> {
        self.lock().blobs.get(name).cloned()
    }

    /// Appends a record with an explicit enqueue time, e.g. to place it
    /// outside a reader's lookback window.
    pub fn inject_event(
        &self,
        partition: usize,
        device_id: &str,
        body: impl Into<Vec<u8>>,
        enqueued_at: DateTime<Utc>,
    ) -> Option<EventRecord> {
        let record = {
            let mut state = self.lock();
            let records = state.partitions.get_mut(partition)?;
            let record = EventRecord {
                partition_id: partition.to_string(),
                offset: records.len() as u64,
                device_id: device_id.to_string(),
                message_id: Uuid::new_v4().to_string(),
                enqueued_at,
                body: body.into(),
            };
            records.push(record.clone());
            record
        };
        self.inner.changed.notify_waiters();
        Some(record)
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut HubState, &HubConfig) -> T) -> T {
        let mut state = self.lock();
        f(&mut state, &self.inner.config)
    }

    /// Runs `poll` until it yields a value or `wait` elapses.
    async fn wait_for<T>(
        &self,
        wait: Duration,
        mut poll: impl FnMut(&mut HubState, &HubConfig) -> Option<T>,
    ) -> Option<T> {
        let deadline = deadline_after(wait);
        loop {
            // registered before polling so a notify in between is not lost
            let notified = self.inner.changed.notified();
            if let Some(value) = self.with_state(&mut poll) {
                return Some(value);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return None;
            }
        }
    }

    fn notify(&self) {
        self.inner.changed.notify_waiters();
    }
}

fn deadline_after(wait: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(wait)
        .unwrap_or_else(|| now + Duration::from_secs(365 * 24 * 3600))
}

fn partition_index(device_id: &str, partitions: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    device_id.hash(&mut hasher);
    (hasher.finish() % partitions.max(1) as u64) as usize
}

fn check_size(config: &HubConfig, message: &OutboundMessage) -> Result<(), TransportError> {
    if message.len() > config.max_message_bytes {
        return Err(TransportError::PayloadTooLarge {
            size: message.len(),
            limit: config.max_message_bytes,
        });
    }
    Ok(())
}

impl HubState {
    fn sweep(&mut self, config: &HubConfig) {
        let now = Instant::now();
        self.release_expired_leases(config, now);
        self.expire_commands(config, Utc::now());
    }

    fn release_expired_leases(&mut self, config: &HubConfig, now: Instant) {
        let expired: Vec<String> = self
            .leases
            .iter()
            .filter(|(_, lease)| lease.locked_until <= now)
            .map(|(token, _)| token.clone())
            .collect();

        for token in expired {
            let Some(lease) = self.leases.remove(&token) else {
                continue;
            };
            let command = lease.command;
            if command.delivery_count >= config.max_delivery_count {
                warn!(
                    message_id = command.message.message_id(),
                    device_id = %command.device_id,
                    deliveries = command.delivery_count,
                    "command dropped after max deliveries"
                );
                self.push_feedback(
                    &command,
                    FeedbackStatus::DeliveryCountExceeded,
                    "delivery count exceeded",
                );
            } else {
                debug!(
                    message_id = command.message.message_id(),
                    device_id = %command.device_id,
                    "lock expired, requeueing command"
                );
                self.queues
                    .entry(command.device_id.clone())
                    .or_default()
                    .push_front(command);
            }
        }
    }

    fn expire_commands(&mut self, config: &HubConfig, now: DateTime<Utc>) {
        let ttl = TimeDelta::from_std(config.message_ttl).unwrap_or(TimeDelta::MAX);
        let mut expired = Vec::new();
        for queue in self.queues.values_mut() {
            let (live, dead): (VecDeque<_>, VecDeque<_>) = queue
                .drain(..)
                .partition(|command| now - command.enqueued_at < ttl);
            *queue = live;
            expired.extend(dead);
        }
        for command in expired {
            debug!(
                message_id = command.message.message_id(),
                device_id = %command.device_id,
                "command expired"
            );
            self.push_feedback(&command, FeedbackStatus::Expired, "message expired");
        }
    }

    fn release_expired_feedback(&mut self, now: Instant) {
        let expired: Vec<String> = self
            .locked_feedback
            .iter()
            .filter(|(_, batch)| batch.locked_until <= now)
            .map(|(id, _)| id.clone())
            .collect();

        for batch_id in expired {
            if let Some(batch) = self.locked_feedback.remove(&batch_id) {
                debug!(batch_id = %batch_id, "feedback batch not committed, releasing");
                for record in batch.records.into_iter().rev() {
                    self.feedback.push_front(record);
                }
            }
        }
    }

    fn push_feedback(&mut self, command: &QueuedCommand, status: FeedbackStatus, description: &str) {
        let wanted = if status.is_success() {
            command.message.ack().wants_positive()
        } else {
            command.message.ack().wants_negative()
        };
        if wanted {
            self.feedback.push_back(FeedbackRecord {
                original_message_id: command.message.message_id().to_string(),
                device_id: command.device_id.clone(),
                status,
                description: description.to_string(),
                enqueued_time: Utc::now(),
            });
        }
    }

    fn append_event(
        &mut self,
        config: &HubConfig,
        device_id: &str,
        message: OutboundMessage,
    ) -> Result<String, TransportError> {
        check_size(config, &message)?;

        let partition = partition_index(device_id, self.partitions.len());
        let message_id = message.message_id().to_string();
        if message.ack().wants_positive() {
            let accepted = QueuedCommand {
                device_id: device_id.to_string(),
                message: message.clone(),
                enqueued_at: Utc::now(),
                delivery_count: 0,
            };
            self.push_feedback(&accepted, FeedbackStatus::Success, "accepted");
        }

        let records = &mut self.partitions[partition];
        records.push(EventRecord {
            partition_id: partition.to_string(),
            offset: records.len() as u64,
            device_id: device_id.to_string(),
            message_id: message_id.clone(),
            enqueued_at: Utc::now(),
            body: message.into_payload(),
        });
        Ok(message_id)
    }

    fn enqueue_command(
        &mut self,
        config: &HubConfig,
        device_id: &str,
        message: OutboundMessage,
    ) -> Result<String, TransportError> {
        if !self.devices.contains_key(device_id) {
            return Err(TransportError::NotFound(format!("device {device_id}")));
        }
        check_size(config, &message)?;

        let message_id = message.message_id().to_string();
        self.queues
            .entry(device_id.to_string())
            .or_default()
            .push_back(QueuedCommand {
                device_id: device_id.to_string(),
                message,
                enqueued_at: Utc::now(),
                delivery_count: 0,
            });
        Ok(message_id)
    }

    fn next_command(&mut self, config: &HubConfig, device_id: &str) -> Option<InboundMessage> {
        self.sweep(config);

        let mut command = self.queues.get_mut(device_id)?.pop_front()?;
        command.delivery_count += 1;

        let token = Uuid::new_v4().to_string();
        let message = InboundMessage::new(
            command.message.message_id(),
            command.message.payload().to_vec(),
            command.enqueued_at,
            command.delivery_count,
            DeliveryHandle::new(token.clone()),
        );
        self.leases.insert(
            token,
            Lease {
                command,
                locked_until: Instant::now() + config.lock_duration,
            },
        );
        Some(message)
    }

    fn complete(
        &mut self,
        config: &HubConfig,
        device_id: &str,
        token: &str,
    ) -> Result<String, TransportError> {
        self.release_expired_leases(config, Instant::now());

        let owned = self
            .leases
            .get(token)
            .is_some_and(|lease| lease.command.device_id == device_id);
        let lease = match self.leases.remove(token) {
            Some(lease) if owned => lease,
            Some(lease) => {
                self.leases.insert(token.to_string(), lease);
                return Err(TransportError::NotFound(format!("delivery handle {token}")));
            }
            None => return Err(TransportError::NotFound(format!("delivery handle {token}"))),
        };

        let command = lease.command;
        let message_id = command.message.message_id().to_string();
        self.push_feedback(&command, FeedbackStatus::Success, "delivered");
        self.completed.push(message_id.clone());
        Ok(message_id)
    }

    /// Expired batch locks are released here and nowhere else.
    fn lock_feedback(&mut self, config: &HubConfig) -> Option<FeedbackBatch> {
        self.sweep(config);
        self.release_expired_feedback(Instant::now());
        if self.feedback.is_empty() {
            return None;
        }

        let take = config.feedback_batch_size.max(1).min(self.feedback.len());
        let records: Vec<FeedbackRecord> = self.feedback.drain(..take).collect();
        let batch_id = Uuid::new_v4().to_string();
        self.locked_feedback.insert(
            batch_id.clone(),
            LockedBatch {
                records: records.clone(),
                locked_until: Instant::now() + config.feedback_lock_duration,
            },
        );
        Some(FeedbackBatch {
            batch_id: Some(batch_id),
            records,
        })
    }

    fn partition(&self, partition_id: &str) -> Result<usize, TransportError> {
        partition_id
            .parse::<usize>()
            .ok()
            .filter(|index| *index < self.partitions.len())
            .ok_or_else(|| TransportError::NotFound(format!("partition {partition_id}")))
    }
}

/// Device channel into a `MemoryHub`, bound to one authenticated device.
#[derive(Debug, Clone)]
pub struct MemoryDeviceTransport {
    hub: MemoryHub,
    device_id: String,
}

impl MemoryDeviceTransport {
    pub fn device_id(&self) -> &str {
        &self.device_id
    }
}

#[async_trait]
impl DeviceTransport for MemoryDeviceTransport {
    async fn send_event(&self, message: OutboundMessage) -> Result<String, TransportError> {
        let message_id = self
            .hub
            .with_state(|state, config| state.append_event(config, &self.device_id, message))?;
        debug!(device_id = %self.device_id, message_id = %message_id, "event accepted");
        self.hub.notify();
        Ok(message_id)
    }

    async fn receive(&self, wait: Duration) -> Result<Option<InboundMessage>, TransportError> {
        let device_id = self.device_id.as_str();
        Ok(self
            .hub
            .wait_for(wait, |state, config| state.next_command(config, device_id))
            .await)
    }

    async fn complete(&self, handle: &DeliveryHandle) -> Result<(), TransportError> {
        let message_id = self
            .hub
            .with_state(|state, config| state.complete(config, &self.device_id, handle.token()))?;
        debug!(device_id = %self.device_id, message_id = %message_id, "command completed");
        self.hub.notify();
        Ok(())
    }

    async fn upload_blob(&self, name: &str, data: Vec<u8>) -> Result<(), TransportError> {
        if name.trim().is_empty() {
            return Err(TransportError::Rejected(
                "blob name must not be empty".to_string(),
            ));
        }
        let size = data.len();
        self.hub.lock().blobs.insert(name.to_string(), data);
        info!(device_id = %self.device_id, blob = name, size, "blob stored");
        Ok(())
    }
}

#[async_trait]
impl DeviceConnector for MemoryHub {
    async fn connect(
        &self,
        identity: &DeviceIdentity,
        _endpoint: &str,
    ) -> Result<Arc<dyn DeviceTransport>, TransportError> {
        Ok(Arc::new(self.device_transport(identity)?))
    }
}

#[async_trait]
impl ServiceTransport for MemoryHub {
    async fn send_command(
        &self,
        device_id: &str,
        message: OutboundMessage,
    ) -> Result<String, TransportError> {
        let message_id =
            self.with_state(|state, config| state.enqueue_command(config, device_id, message))?;
        debug!(device_id, message_id = %message_id, "command queued");
        self.notify();
        Ok(message_id)
    }

    async fn receive_feedback(&self, wait: Duration) -> Result<FeedbackBatch, TransportError> {
        Ok(self
            .wait_for(wait, |state, config| state.lock_feedback(config))
            .await
            .unwrap_or_else(FeedbackBatch::empty))
    }

    async fn complete_feedback(&self, batch_id: &str) -> Result<(), TransportError> {
        match self.lock().locked_feedback.remove(batch_id) {
            Some(batch) => {
                debug!(batch_id, records = batch.records.len(), "feedback committed");
                Ok(())
            }
            None => Err(TransportError::NotFound(format!("feedback batch {batch_id}"))),
        }
    }

    async fn partition_ids(&self) -> Result<Vec<String>, TransportError> {
        let count = self.lock().partitions.len();
        Ok((0..count).map(|index| index.to_string()).collect())
    }

    async fn read_partition(
        &self,
        partition_id: &str,
        since: DateTime<Utc>,
        wait: Duration,
    ) -> Result<Option<EventRecord>, TransportError> {
        let index = self.lock().partition(partition_id)?;
        Ok(self
            .wait_for(wait, |state, _| {
                state.partitions[index]
                    .iter()
                    .find(|record| record.enqueued_at >= since)
                    .cloned()
            })
            .await)
    }
}
