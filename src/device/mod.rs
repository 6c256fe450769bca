//! The `device` module is the device side of the hub connection.
//!
//! A `TransportSession` owns the authenticated handle; the `UplinkPublisher`
//! sends telemetry over it and the `DownlinkReceiver` runs the background
//! receive loop that fans cloud-to-device messages out to listeners.

pub mod downlink;
pub mod listeners;
pub mod session;
pub mod uplink;

pub use downlink::{
    DecodeFailurePolicy, DownlinkReceiver, ReceiverOptions, ReceiverState, StatsSnapshot,
};
pub use listeners::{
    DispatchReport, ListenerId, ListenerRegistry, ListenerResult, MessageListener, listener_fn,
};
pub use session::{Session, TransportSession};
pub use uplink::UplinkPublisher;

#[cfg(test)]
mod tests;
