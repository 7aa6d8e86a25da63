//! The transport seam every channel kind is built on.

use crate::demux::Demultiplexer;
use crate::error::TransportError;
use crate::types::HandleId;
use bytes::Bytes;

/// Raw asynchronous primitives shared by serial and socket transports.
///
/// Implementations push inbound traffic into [`Transport::demux`]; the
/// channel layer never polls for it.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Router for this transport's event stream.
    fn demux(&self) -> &Demultiplexer;

    /// Send one buffer on `handle`.  Resolves once the transport accepted it.
    async fn send(&self, handle: HandleId, data: Bytes) -> Result<(), TransportError>;

    /// Disconnect or close `handle`.
    async fn release(&self, handle: HandleId) -> Result<(), TransportError>;

    /// Start delivering inbound events for `handle`.
    async fn resume(&self, _handle: HandleId) -> Result<(), TransportError> {
        Ok(())
    }
}
