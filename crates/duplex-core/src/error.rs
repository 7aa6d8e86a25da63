//! Error types shared by every channel kind.
//!
//! `TransportError` is what an injected transport reports for a single
//! primitive call.  `ChannelError` is what a channel or listener surfaces to
//! its consumer, tagged with the stage of the lifecycle that failed.

use crate::types::HandleId;
use serde::{Deserialize, Serialize};
use std::fmt;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Transport errors
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Failure kinds reported by a transport primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TransportErrorKind {
    /// The handle or device does not exist.
    NotFound,
    /// The platform refused the request (busy port, bad address, ...).
    Rejected,
    /// An I/O operation failed after the request was accepted.
    Io,
    /// The transport is shut down or not available on this platform.
    Unavailable,
}

/// Error returned by a single transport call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn not_found(handle: HandleId) -> Self {
        Self::new(TransportErrorKind::NotFound, format!("handle {} not found", handle))
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Rejected, message)
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Io, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Unavailable, message)
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for TransportError {}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound => Self::new(TransportErrorKind::NotFound, e.to_string()),
            std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::AddrInUse
            | std::io::ErrorKind::AddrNotAvailable
            | std::io::ErrorKind::PermissionDenied => {
                Self::new(TransportErrorKind::Rejected, e.to_string())
            }
            _ => Self::new(TransportErrorKind::Io, e.to_string()),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Channel errors
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Stage of a channel or listener lifecycle that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChannelErrorKind {
    /// Enumeration, connect or server creation failed before `Open`.
    Connect,
    /// A listener could not bind its requested endpoint.
    Bind,
    /// The transport signalled an inbound fault.
    Receive,
    /// An outbound send failed; queued data was dropped.
    Send,
    /// Best-effort teardown of a stale handle failed.
    Cleanup,
    /// Releasing the channel's own handle failed.
    Disconnect,
    /// The channel no longer accepts writes.
    Closed,
    /// Options could not be turned into a working channel.
    InvalidConfig,
}

/// Error surfaced to channel and listener consumers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelError {
    pub kind: ChannelErrorKind,
    pub message: String,
    pub handle: Option<HandleId>,
}

impl ChannelError {
    pub fn new(kind: ChannelErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            handle: None,
        }
    }

    pub fn with_handle(mut self, handle: HandleId) -> Self {
        self.handle = Some(handle);
        self
    }

    pub fn connect(err: impl fmt::Display) -> Self {
        Self::new(ChannelErrorKind::Connect, err.to_string())
    }

    pub fn bind(err: impl fmt::Display) -> Self {
        Self::new(ChannelErrorKind::Bind, err.to_string())
    }

    pub fn receive(err: impl fmt::Display) -> Self {
        Self::new(ChannelErrorKind::Receive, format!("receive: {}", err))
    }

    pub fn send(err: impl fmt::Display) -> Self {
        Self::new(ChannelErrorKind::Send, format!("send: {}", err))
    }

    pub fn cleanup(err: impl fmt::Display) -> Self {
        Self::new(ChannelErrorKind::Cleanup, err.to_string())
    }

    pub fn disconnect(err: impl fmt::Display) -> Self {
        Self::new(ChannelErrorKind::Disconnect, err.to_string())
    }

    pub fn closed() -> Self {
        Self::new(ChannelErrorKind::Closed, "channel is closed")
    }

    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::new(ChannelErrorKind::InvalidConfig, message)
    }
}

impl fmt::Display for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.handle {
            Some(handle) => write!(f, "[{:?}] {} (handle {})", self.kind, self.message, handle),
            None => write!(f, "[{:?}] {}", self.kind, self.message),
        }
    }
}

impl std::error::Error for ChannelError {}
