//! The `hub` module provides a hub to talk to when there is no cloud at hand:
//! `MemoryHub` holds queues, the partitioned stream and feedback in process,
//! and the emulator exposes it over the WebSocket protocol.

pub mod emulator;
pub mod memory;

pub use emulator::{serve, start_emulator};
pub use memory::{HubConfig, MemoryDeviceTransport, MemoryHub};
