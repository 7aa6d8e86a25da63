//! Serial transport abstraction.
//!
//! The [`SerialTransport`] trait adds the serial-specific primitives to
//! [`Transport`].  A [`SimulatedSerialTransport`] is provided for tests; the
//! real implementation lives in [`crate::serial::system`].

use crate::serial::types::*;
use bytes::Bytes;
use duplex_core::{Demultiplexer, HandleId, SimulatedCore, Transport, TransportError};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Serial-specific primitives.  `release` disconnects a connection.
#[async_trait::async_trait]
pub trait SerialTransport: Transport {
    /// Enumerate devices present on the system.
    async fn get_devices(&self) -> Result<Vec<DeviceInfo>, TransportError>;

    /// Enumerate connections currently open on this transport.
    async fn get_connections(&self) -> Result<Vec<ConnectionInfo>, TransportError>;

    /// Open `path` and record the connection under `options.name`.
    async fn connect(&self, path: &str, options: &ConnectOptions) -> Result<ConnectionInfo, TransportError>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Simulated transport (for testing & offline use)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A fully in-memory serial transport.
///
/// Like the platform it stands in for, it happily opens the same path twice.
/// Device output for a new connection is held until the connection is
/// resumed.
pub struct SimulatedSerialTransport {
    core: SimulatedCore,
    greetings: Mutex<HashMap<String, Bytes>>,
    held: Mutex<HashMap<HandleId, VecDeque<Bytes>>>,
    devices: Mutex<Vec<DeviceInfo>>,
    connections: Mutex<BTreeMap<HandleId, ConnectionInfo>>,
    failing_paths: Mutex<HashMap<String, String>>,
    fail_enumeration: AtomicBool,
    connect_log: Mutex<Vec<(String, ConnectOptions)>>,
}

impl SimulatedSerialTransport {
    pub fn new() -> Arc<Self> {
        Self::with_devices(Vec::new())
    }

    pub fn with_devices(devices: Vec<DeviceInfo>) -> Arc<Self> {
        Arc::new(Self {
            core: SimulatedCore::new(),
            greetings: Mutex::new(HashMap::new()),
            held: Mutex::new(HashMap::new()),
            devices: Mutex::new(devices),
            connections: Mutex::new(BTreeMap::new()),
            failing_paths: Mutex::new(HashMap::new()),
            fail_enumeration: AtomicBool::new(false),
            connect_log: Mutex::new(Vec::new()),
        })
    }

    /// Send-gating, injection and inspection helpers.
    pub fn core(&self) -> &SimulatedCore {
        &self.core
    }

    pub fn add_device(&self, device: DeviceInfo) {
        lock(&self.devices).push(device);
    }

    /// Make every connect to `path` fail with `message`.
    pub fn fail_connect(&self, path: impl Into<String>, message: impl Into<String>) {
        lock(&self.failing_paths).insert(path.into(), message.into());
    }

    /// Make device and connection enumeration fail.
    pub fn fail_enumeration(&self, fail: bool) {
        self.fail_enumeration.store(fail, Ordering::SeqCst);
    }

    /// Open connections whose path is `path`.
    pub fn connections_to(&self, path: &str) -> Vec<ConnectionInfo> {
        lock(&self.connections)
            .values()
            .filter(|c| c.path == path)
            .cloned()
            .collect()
    }

    /// Have the device on `path` send `data` as soon as it is opened, like
    /// a controller printing its banner after a reset.
    pub fn greet_on_connect(&self, path: impl Into<String>, data: impl Into<Bytes>) {
        lock(&self.greetings).insert(path.into(), data.into());
    }

    /// Data arriving from the device; held until the connection is resumed.
    pub fn device_send(&self, handle: HandleId, data: impl Into<Bytes>) -> bool {
        let data = data.into();
        if let Some(queue) = lock(&self.held).get_mut(&handle) {
            queue.push_back(data);
            return true;
        }
        self.core.inject_receive(handle, data)
    }

    /// Every connect request, in order.
    pub fn connect_log(&self) -> Vec<(String, ConnectOptions)> {
        lock(&self.connect_log).clone()
    }

    /// Record a connection opened by an earlier run of the process.
    pub fn seed_connection(&self, path: &str, name: &str) -> HandleId {
        let handle = self.core.allocate();
        lock(&self.connections).insert(
            handle,
            ConnectionInfo {
                connection_id: handle,
                name: name.to_string(),
                path: path.to_string(),
                bitrate: DEFAULT_BAUD_RATE,
            },
        );
        handle
    }

    fn check_enumeration(&self) -> Result<(), TransportError> {
        if self.fail_enumeration.load(Ordering::SeqCst) {
            return Err(TransportError::unavailable("simulated enumeration failure"));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Transport for SimulatedSerialTransport {
    fn demux(&self) -> &Demultiplexer {
        self.core.demux()
    }

    async fn send(&self, handle: HandleId, data: Bytes) -> Result<(), TransportError> {
        self.core.send(handle, data).await
    }

    async fn release(&self, handle: HandleId) -> Result<(), TransportError> {
        self.core.release(handle).await?;
        lock(&self.connections).remove(&handle);
        lock(&self.held).remove(&handle);
        // Whoever still reads this handle learns it is gone.
        self.core.inject_receive_error(handle, "disconnected");
        Ok(())
    }

    async fn resume(&self, handle: HandleId) -> Result<(), TransportError> {
        let pending = lock(&self.held).remove(&handle).unwrap_or_default();
        for data in pending {
            self.core.inject_receive(handle, data);
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl SerialTransport for SimulatedSerialTransport {
    async fn get_devices(&self) -> Result<Vec<DeviceInfo>, TransportError> {
        self.check_enumeration()?;
        Ok(lock(&self.devices).clone())
    }

    async fn get_connections(&self) -> Result<Vec<ConnectionInfo>, TransportError> {
        self.check_enumeration()?;
        Ok(lock(&self.connections).values().cloned().collect())
    }

    async fn connect(&self, path: &str, options: &ConnectOptions) -> Result<ConnectionInfo, TransportError> {
        lock(&self.connect_log).push((path.to_string(), options.clone()));
        if let Some(message) = lock(&self.failing_paths).get(path) {
            return Err(TransportError::rejected(message.clone()));
        }
        let handle = self.core.allocate();
        let info = ConnectionInfo {
            connection_id: handle,
            name: options.name.clone(),
            path: path.to_string(),
            bitrate: options.bitrate,
        };
        lock(&self.connections).insert(handle, info.clone());
        let mut pending = VecDeque::new();
        if let Some(greeting) = lock(&self.greetings).get(path) {
            pending.push_back(greeting.clone());
        }
        lock(&self.held).insert(handle, pending);
        Ok(info)
    }
}
