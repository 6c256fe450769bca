use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{error, warn};
use uuid::Uuid;

use crate::message::InboundMessage;

pub type ListenerId = String;

/// What a listener reports back; an `Err` is logged and otherwise ignored.
pub type ListenerResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Callback invoked on the receiver task for every decoded message.
///
/// Runs inline with the receive loop: long blocking work here delays the
/// next receive.
pub trait MessageListener: Send + Sync {
    fn on_message(&self, message: &InboundMessage) -> ListenerResult;
}

impl<F> MessageListener for F
where
    F: Fn(&InboundMessage) -> ListenerResult + Send + Sync,
{
    fn on_message(&self, message: &InboundMessage) -> ListenerResult {
        self(message)
    }
}

/// Pins a closure to the listener signature so argument and return types
/// are inferred.
pub fn listener_fn<F>(f: F) -> F
where
    F: Fn(&InboundMessage) -> ListenerResult + Send + Sync + 'static,
{
    f
}

/// Outcome of dispatching one message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub invoked: usize,
    pub failed: usize,
}

/// Listeners keyed by subscription id, dispatched in registration order.
#[derive(Default)]
pub struct ListenerRegistry {
    entries: RwLock<Vec<(ListenerId, Arc<dyn MessageListener>)>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `listener` under `id`. An existing registration with the
    /// same id is replaced in place; returns `true` in that case.
    pub fn register<L>(&self, id: impl Into<ListenerId>, listener: L) -> bool
    where
        L: MessageListener + 'static,
    {
        let id = id.into();
        let listener: Arc<dyn MessageListener> = Arc::new(listener);
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        match entries.iter_mut().find(|(existing, _)| *existing == id) {
            Some(entry) => {
                entry.1 = listener;
                true
            }
            None => {
                entries.push((id, listener));
                false
            }
        }
    }

    /// Registers `listener` under a generated id and returns it.
    pub fn subscribe<L>(&self, listener: L) -> ListenerId
    where
        L: MessageListener + 'static,
    {
        let id = format!("listener-{}", Uuid::new_v4());
        self.register(id.clone(), listener);
        id
    }

    pub fn unregister(&self, id: &str) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|(existing, _)| existing != id);
        entries.len() != before
    }

    pub fn ids(&self) -> Vec<ListenerId> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Invokes every registered listener with `message`. Errors and panics
    /// are logged per listener; the remaining listeners still run.
    pub fn dispatch(&self, message: &InboundMessage) -> DispatchReport {
        // snapshot so listeners may (un)register from inside a callback
        let snapshot: Vec<(ListenerId, Arc<dyn MessageListener>)> = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let mut report = DispatchReport::default();
        for (id, listener) in snapshot {
            report.invoked += 1;
            match catch_unwind(AssertUnwindSafe(|| listener.on_message(message))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    report.failed += 1;
                    warn!(
                        listener = %id,
                        message_id = %message.message_id,
                        error = %e,
                        "listener failed"
                    );
                }
                Err(_) => {
                    report.failed += 1;
                    error!(
                        listener = %id,
                        message_id = %message.message_id,
                        "listener panicked"
                    );
                }
            }
        }
        report
    }
}

impl std::fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("listeners", &self.ids())
            .finish()
    }
}
