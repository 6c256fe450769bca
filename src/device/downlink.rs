//! Downlink receive loop
//!
//! `DownlinkReceiver` drives a state machine on a dedicated tokio task:
//!
//! ```text
//! Idle --start--> Listening --message--> Dispatching --completed--> Listening
//!   ^                 |  (timeout: stay)                                 |
//!   +------stop-------+--------------------------------------------------+
//! ```
//!
//! Per message the order is strictly decode -> dispatch to every listener ->
//! complete. Nothing that happens inside the loop is propagated: listener
//! failures, malformed payloads, failed completions and transport errors are
//! logged, counted in `ReceiverStats`, and the loop carries on.
//!
//! There is no backpressure: the next receive starts only after every
//! listener has returned, so a slow listener slows the whole downlink.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::device::listeners::{ListenerId, ListenerRegistry, MessageListener};
use crate::device::session::TransportSession;
use crate::message::InboundMessage;
use crate::transport::DeviceTransport;
use crate::utils::error::{AckError, ReceiveError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverState {
    Idle,
    Listening,
    Dispatching,
}

/// What to do with a message whose payload cannot be decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecodeFailurePolicy {
    /// Complete it anyway so the hub does not redeliver it forever.
    #[default]
    Complete,
    /// Leave it locked; the hub redelivers it once the lock expires.
    Abandon,
}

#[derive(Debug, Clone)]
pub struct ReceiverOptions {
    /// Long-poll timeout of each receive call. Also bounds how long `stop`
    /// may wait for the loop to notice the stop signal.
    pub poll_timeout: Duration,
    /// Pause after a failed receive before trying again.
    pub error_backoff: Duration,
    pub on_decode_failure: DecodeFailurePolicy,
}

impl Default for ReceiverOptions {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_secs(5),
            error_backoff: Duration::from_secs(1),
            on_decode_failure: DecodeFailurePolicy::Complete,
        }
    }
}

#[derive(Debug, Default)]
struct ReceiverStats {
    received: AtomicU64,
    dispatched: AtomicU64,
    listener_failures: AtomicU64,
    decode_failures: AtomicU64,
    completed: AtomicU64,
    ack_failures: AtomicU64,
    receive_errors: AtomicU64,
}

/// Counters of the receive loop since the receiver was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub received: u64,
    pub dispatched: u64,
    pub listener_failures: u64,
    pub decode_failures: u64,
    pub completed: u64,
    pub ack_failures: u64,
    pub receive_errors: u64,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<ReceiverState>,
    stats: ReceiverStats,
}

impl Shared {
    fn set_state(&self, state: ReceiverState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    fn state(&self) -> ReceiverState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

struct Worker {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Receives cloud-to-device messages in the background and fans them out to
/// registered listeners.
pub struct DownlinkReceiver {
    session: Arc<TransportSession>,
    listeners: Arc<ListenerRegistry>,
    options: ReceiverOptions,
    shared: Arc<Shared>,
    worker: Mutex<Option<Worker>>,
}

impl DownlinkReceiver {
    pub fn new(session: Arc<TransportSession>, options: ReceiverOptions) -> Self {
        Self {
            session,
            listeners: Arc::new(ListenerRegistry::new()),
            options,
            shared: Arc::new(Shared {
                state: Mutex::new(ReceiverState::Idle),
                stats: ReceiverStats::default(),
            }),
            worker: Mutex::new(None),
        }
    }

    pub fn listeners(&self) -> &Arc<ListenerRegistry> {
        &self.listeners
    }

    /// See [`ListenerRegistry::register`].
    pub fn register<L>(&self, id: impl Into<ListenerId>, listener: L) -> bool
    where
        L: MessageListener + 'static,
    {
        self.listeners.register(id, listener)
    }

    pub fn subscribe<L>(&self, listener: L) -> ListenerId
    where
        L: MessageListener + 'static,
    {
        self.listeners.subscribe(listener)
    }

    pub fn unregister(&self, id: &str) -> bool {
        self.listeners.unregister(id)
    }

    pub fn state(&self) -> ReceiverState {
        self.shared.state()
    }

    pub fn stats(&self) -> StatsSnapshot {
        let stats = &self.shared.stats;
        StatsSnapshot {
            received: stats.received.load(Ordering::Relaxed),
            dispatched: stats.dispatched.load(Ordering::Relaxed),
            listener_failures: stats.listener_failures.load(Ordering::Relaxed),
            decode_failures: stats.decode_failures.load(Ordering::Relaxed),
            completed: stats.completed.load(Ordering::Relaxed),
            ack_failures: stats.ack_failures.load(Ordering::Relaxed),
            receive_errors: stats.receive_errors.load(Ordering::Relaxed),
        }
    }

    /// Spawns the receive loop on the current tokio runtime using the
    /// session that is open right now.
    pub fn start(&self) -> Result<(), ReceiveError> {
        let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        if worker
            .as_ref()
            .is_some_and(|running| !running.handle.is_finished())
        {
            return Err(ReceiveError::AlreadyRunning);
        }
        let session = self.session.current().ok_or(ReceiveError::NotOpen)?;

        let (stop_tx, stop_rx) = watch::channel(false);
        let receive_loop = ReceiveLoop {
            device_id: session.device_id().to_string(),
            transport: session.transport().clone(),
            listeners: self.listeners.clone(),
            shared: self.shared.clone(),
            options: self.options.clone(),
        };
        self.shared.set_state(ReceiverState::Listening);
        let handle = tokio::spawn(receive_loop.run(stop_rx));

        *worker = Some(Worker {
            stop: stop_tx,
            handle,
        });
        Ok(())
    }

    /// Signals the loop to stop and waits for it. A receive or completion
    /// already in flight finishes first.
    pub async fn stop(&self) {
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            let _ = worker.stop.send(true);
            if let Err(e) = worker.handle.await {
                error!(error = %e, "receive loop ended abnormally");
            }
        }
        self.shared.set_state(ReceiverState::Idle);
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|worker| !worker.handle.is_finished())
    }
}

impl Drop for DownlinkReceiver {
    fn drop(&mut self) {
        let worker = self
            .worker
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            let _ = worker.stop.send(true);
        }
    }
}

struct ReceiveLoop {
    device_id: String,
    transport: Arc<dyn DeviceTransport>,
    listeners: Arc<ListenerRegistry>,
    shared: Arc<Shared>,
    options: ReceiverOptions,
}

impl ReceiveLoop {
    async fn run(self, mut stop: watch::Receiver<bool>) {
        info!(device_id = %self.device_id, "receive loop started");
        loop {
            if *stop.borrow() {
                break;
            }
            self.shared.set_state(ReceiverState::Listening);

            match self.transport.receive(self.options.poll_timeout).await {
                Ok(None) => continue,
                Ok(Some(message)) => {
                    self.shared.set_state(ReceiverState::Dispatching);
                    self.process(message).await;
                }
                Err(e) => {
                    bump(&self.shared.stats.receive_errors);
                    warn!(device_id = %self.device_id, error = %e, "receive failed");
                    tokio::select! {
                        _ = tokio::time::sleep(self.options.error_backoff) => {}
                        _ = stop.changed() => {}
                    }
                }
            }
        }
        self.shared.set_state(ReceiverState::Idle);
        info!(device_id = %self.device_id, "receive loop stopped");
    }

    async fn process(&self, message: InboundMessage) {
        let stats = &self.shared.stats;
        bump(&stats.received);

        match message.text() {
            Ok(text) => {
                debug!(
                    device_id = %self.device_id,
                    message_id = %message.message_id,
                    delivery_count = message.delivery_count,
                    payload = text,
                    "message received"
                );
                let report = self.listeners.dispatch(&message);
                bump(&stats.dispatched);
                stats
                    .listener_failures
                    .fetch_add(report.failed as u64, Ordering::Relaxed);
            }
            Err(e) => {
                bump(&stats.decode_failures);
                warn!(device_id = %self.device_id, error = %e, policy = ?self.options.on_decode_failure, "undecodable message");
                if self.options.on_decode_failure == DecodeFailurePolicy::Abandon {
                    return;
                }
            }
        }

        let message_id = message.message_id.clone();
        let handle = message.into_delivery_handle();
        match self.transport.complete(&handle).await {
            Ok(()) => {
                bump(&stats.completed);
                debug!(device_id = %self.device_id, message_id = %message_id, "message completed");
            }
            Err(source) => {
                bump(&stats.ack_failures);
                let err = AckError {
                    target: format!("message {message_id}"),
                    source,
                };
                warn!(device_id = %self.device_id, error = %err, "completion failed, hub will redeliver");
            }
        }
    }
}
