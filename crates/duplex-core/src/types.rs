//! Shared value types.

use crate::error::ChannelError;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque identifier assigned by a transport to a live connection or server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HandleId(pub u32);

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One side of a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Endpoint {
    Socket { address: String, port: u16 },
    Device { path: String },
}

impl Endpoint {
    pub fn socket(address: impl Into<String>, port: u16) -> Self {
        Self::Socket {
            address: address.into(),
            port,
        }
    }

    pub fn device(path: impl Into<String>) -> Self {
        Self::Device { path: path.into() }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Socket { address, port } => write!(f, "{}:{}", address, port),
            Self::Device { path } => write!(f, "{}", path),
        }
    }
}

/// Lifecycle of a channel.  Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChannelState {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl ChannelState {
    /// Whether buffered writes may be handed to the transport.
    pub fn is_writable(self) -> bool {
        self == ChannelState::Open
    }
}

/// Events a channel delivers to its consumer, in emission order.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Open,
    Data(Bytes),
    Error(ChannelError),
    Close,
}

/// The result of establishing a transport handle for a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    pub handle: HandleId,
    pub local: Option<Endpoint>,
    pub remote: Option<Endpoint>,
}

impl Connection {
    pub fn new(handle: HandleId) -> Self {
        Self {
            handle,
            local: None,
            remote: None,
        }
    }

    pub fn with_local(mut self, local: Endpoint) -> Self {
        self.local = Some(local);
        self
    }

    pub fn with_remote(mut self, remote: Endpoint) -> Self {
        self.remote = Some(remote);
        self
    }
}
