//! # hublink
//!
//! `hublink` is the client-side messaging layer between an edge device and a
//! cloud message hub. It sends telemetry upstream, receives commands
//! downstream, collects delivery feedback and reads the partitioned telemetry
//! stream.
//!
//! ## Core Modules
//!
//! - `device`: the device session, the uplink publisher and the background
//!   downlink receiver with its listener registry.
//! - `service`: feedback collection, command sending and the partitioned
//!   stream reader, all against the hub's service endpoint.
//! - `transport`: the transport traits and their WebSocket implementation.
//! - `hub`: an in-memory hub and a WebSocket emulator serving it.
//! - `message`: the messages, feedback records and stream records exchanged.
//! - `config`: loading settings from file and environment.
//! - `utils`: the error taxonomy and logging setup.

pub mod config;
pub mod device;
pub mod hub;
pub mod message;
pub mod service;
pub mod transport;
pub mod utils;
