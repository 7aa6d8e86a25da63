//! duplex-bridge: relays frames between TCP clients and one serial device.
//!
//! The channel machinery lives in the `duplex-*` crates; this crate adds
//! configuration, log setup and the relay loop used by the binary.

pub mod config;
pub mod logging;
pub mod relay;

pub use config::BridgeConfig;
