//! # Duplex Bridge – TCP
//!
//! - **Transport** – `SocketTransport` primitives (server sockets, pause and
//!   resume, socket info) with simulated and `tokio::net` implementations
//! - **Listener** – accepts connections and hands out one channel per peer
//! - **Cleanup** – closes leftover server sockets at startup

pub mod tcp;

pub use tcp::*;
