//! # Duplex Bridge – Serial
//!
//! Serial ports as duplex channels:
//!
//! - **Transport** – `SerialTransport` primitives (enumerate, connect,
//!   disconnect) with simulated and `serialport`-backed implementations
//! - **Exclusive Connector** – at most one live connection per device path
//! - **Ports** – `open_port` wraps a connection in a `duplex_core::Channel`
//! - **Discovery** – device listing and startup cleanup of leftover handles

pub mod serial;

pub use serial::*;
