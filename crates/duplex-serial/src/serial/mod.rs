//! Serial crate: sub-modules.

pub mod types;
pub mod transport;
pub mod connector;
pub mod port;
pub mod discovery;
pub mod system;

// Re-export top-level items for convenience.
pub use types::*;
pub use transport::{SerialTransport, SimulatedSerialTransport};
pub use connector::{connection_name, ExclusiveConnector, CONNECTION_PREFIX};
pub use port::{open_port, open_port_with, SerialOptions};
pub use discovery::{disconnect_all, list};
pub use system::SystemSerialTransport;
