//! Exclusive connector: one live connection per serial path.
//!
//! The platform does not stop a device from being opened twice, so a
//! process that reloads after a crash could end up fighting its own stale
//! handle.  Every connection is therefore recorded under a name derived from
//! its path, and any connection already carrying that name is torn down
//! before a new one is made.

use crate::serial::transport::SerialTransport;
use crate::serial::types::{ConnectOptions, ConnectionInfo};
use duplex_core::{ChannelError, TransportError};
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

pub const CONNECTION_PREFIX: &str = "SP_";

/// Name recorded with every connection to `path`.
pub fn connection_name(path: &str) -> String {
    format!("{}{}", CONNECTION_PREFIX, path)
}

/// Connects to serial paths after evicting stale connections.
///
/// Concurrent requests for the same path through one connector run one
/// after the other.
pub struct ExclusiveConnector<T: ?Sized> {
    transport: Arc<T>,
    path_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl<T> ExclusiveConnector<T>
where
    T: SerialTransport + ?Sized,
{
    pub fn new(transport: Arc<T>) -> Self {
        Self {
            transport,
            path_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    fn path_lock(&self, path: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.path_locks.lock().unwrap_or_else(|p| p.into_inner());
        Arc::clone(locks.entry(path.to_string()).or_default())
    }

    /// Disconnect every connection recorded under `path`'s name.
    ///
    /// Best effort: failures are logged and the count only includes
    /// connections that were actually released.
    pub async fn evict(&self, path: &str) -> usize {
        let name = connection_name(path);
        let connections = match self.transport.get_connections().await {
            Ok(c) => c,
            Err(e) => {
                log::warn!("[serial:{}] {}", path, ChannelError::cleanup(e));
                return 0;
            }
        };

        let stale: Vec<_> = connections.into_iter().filter(|c| c.name == name).collect();
        if stale.is_empty() {
            return 0;
        }
        log::info!("[serial:{}] disconnecting {} stale connection(s)", path, stale.len());

        let results = join_all(stale.iter().map(|c| self.transport.release(c.connection_id))).await;
        let mut released = 0;
        for (conn, result) in stale.iter().zip(results) {
            match result {
                Ok(()) => released += 1,
                Err(e) => log::warn!(
                    "[serial:{}] {}",
                    path,
                    ChannelError::cleanup(e).with_handle(conn.connection_id)
                ),
            }
        }
        released
    }

    /// Evict stale connections to `path`, then connect.
    pub async fn connect(&self, path: &str, bitrate: u32) -> Result<ConnectionInfo, TransportError> {
        let lock = self.path_lock(path);
        let _guard = lock.lock().await;

        self.evict(path).await;
        let options = ConnectOptions {
            bitrate,
            name: connection_name(path),
        };
        let info = self.transport.connect(path, &options).await?;
        log::debug!(
            "[serial:{}] connected as {} at {} baud",
            path,
            info.connection_id,
            info.bitrate
        );
        Ok(info)
    }
}
