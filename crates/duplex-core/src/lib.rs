//! # Duplex Bridge – Core
//!
//! Transport-agnostic building blocks shared by the serial and socket crates:
//!
//! - **Channel** – connection state machine `Connecting → Open → Closing → Closed`
//!   around one transport handle, with lifecycle and data events
//! - **Write Queue** – strictly ordered outbound buffers, one send in flight
//! - **Frame Parsers** – raw passthrough and delimiter-based line framing
//! - **Demultiplexer** – routes a transport's shared event stream by handle
//! - **Simulated transport** – in-memory transport core for tests

pub mod channel;
pub mod demux;
pub mod error;
pub mod parser;
pub mod simulated;
pub mod transport;
pub mod types;
pub mod write_queue;

pub use channel::{spawn_channel, Channel, ChannelOptions, ConnectErrorCallback, ReceiveErrorPolicy};
pub use demux::{Demultiplexer, InboundEvent, TransportEvent};
pub use error::{ChannelError, ChannelErrorKind, TransportError, TransportErrorKind};
pub use parser::{FrameParser, LineParser, ParserConfig};
pub use simulated::SimulatedCore;
pub use transport::Transport;
pub use types::*;
pub use write_queue::WriteQueue;
