//! TCP crate: sub-modules.

pub mod types;
pub mod transport;
pub mod socket;
pub mod listener;
pub mod cleanup;
pub mod system;

pub use types::*;
pub use transport::{SimulatedSocketTransport, SocketTransport};
pub use socket::wrap_socket;
pub use listener::{AcceptedSocket, Listener, ListenerEvent};
pub use cleanup::close_all_servers;
pub use system::TokioSocketTransport;
