//! The `transport` module defines how `hublink` talks to a hub.
//!
//! The device and service sides are async traits so the coordination layer
//! never depends on a particular wire protocol. The bundled implementation
//! speaks tagged JSON frames over WebSockets; the in-process `MemoryHub`
//! implements the same traits directly.

pub mod message;
pub mod traits;
pub mod websocket;

#[cfg(test)]
mod tests;

pub use traits::{DeviceConnector, DeviceTransport, ServiceTransport};
pub use websocket::{WsConnector, WsDeviceTransport, WsServiceTransport};
