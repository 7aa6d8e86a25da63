//! Device enumeration and startup cleanup.

use crate::serial::transport::SerialTransport;
use crate::serial::types::DeviceDescriptor;
use duplex_core::{ChannelError, TransportError};
use futures::future::join_all;

/// Enumerate the serial devices the transport can see.
pub async fn list<T>(transport: &T) -> Result<Vec<DeviceDescriptor>, ChannelError>
where
    T: SerialTransport + ?Sized,
{
    let devices = transport.get_devices().await.map_err(ChannelError::connect)?;
    log::debug!("[serial] {} device(s) found", devices.len());
    Ok(devices.into_iter().map(DeviceDescriptor::from).collect())
}

/// Disconnect every connection `transport` reports as open.
///
/// Only handles the transport itself tracks are seen: with a host runtime
/// that keeps connections across reloads this clears a previous run's
/// leftovers, while [`SystemSerialTransport`](crate::serial::system::SystemSerialTransport)
/// only knows its own process's ports, so at startup it finds nothing.
/// Returns how many connections were released.
pub async fn disconnect_all<T>(transport: &T) -> Result<usize, TransportError>
where
    T: SerialTransport + ?Sized,
{
    let connections = transport.get_connections().await?;
    let results = join_all(connections.iter().map(|c| transport.release(c.connection_id))).await;

    let mut released = 0;
    for (conn, result) in connections.iter().zip(results) {
        match result {
            Ok(()) => released += 1,
            Err(e) => log::warn!(
                "[serial:{}] {}",
                conn.path,
                ChannelError::cleanup(e).with_handle(conn.connection_id)
            ),
        }
    }
    if released > 0 {
        log::info!("[serial] disconnected {} leftover connection(s)", released);
    }
    Ok(released)
}
