//! Socket data types.

use duplex_core::{Endpoint, HandleId, ParserConfig, ReceiveErrorPolicy};
use serde::{Deserialize, Serialize};

/// What the transport knows about a connected socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SocketInfo {
    pub socket_id: HandleId,
    pub local: Option<Endpoint>,
    pub peer: Option<Endpoint>,
    pub paused: bool,
}

impl SocketInfo {
    pub fn new(socket_id: HandleId) -> Self {
        Self {
            socket_id,
            local: None,
            peer: None,
            paused: true,
        }
    }
}

/// What the transport knows about a server socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    pub socket_id: HandleId,
    /// Bound endpoint; `None` until `listen` succeeded.
    pub local: Option<Endpoint>,
}

/// Per-socket channel settings applied to every accepted connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SocketSettings {
    pub parser: ParserConfig,
    pub receive_errors: ReceiveErrorPolicy,
}
