//! Socket transport abstraction.
//!
//! Accepted sockets start paused: nothing is delivered for them until the
//! owning channel has registered its route and calls `resume`.

use crate::tcp::types::*;
use bytes::Bytes;
use duplex_core::{Demultiplexer, Endpoint, HandleId, SimulatedCore, Transport, TransportError};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Socket-specific primitives.  `release` closes a connected socket.
#[async_trait::async_trait]
pub trait SocketTransport: Transport {
    /// Pause or resume inbound delivery for a connected socket.
    async fn set_paused(&self, socket: HandleId, paused: bool) -> Result<(), TransportError>;

    async fn get_info(&self, socket: HandleId) -> Result<SocketInfo, TransportError>;

    /// Allocate a server socket; it accepts nothing until `listen`.
    async fn create_server(&self) -> Result<HandleId, TransportError>;

    /// Bind `server` to `host:port` and start accepting.
    async fn listen(&self, server: HandleId, host: &str, port: u16) -> Result<(), TransportError>;

    async fn server_info(&self, server: HandleId) -> Result<ServerInfo, TransportError>;

    async fn close_server(&self, server: HandleId) -> Result<(), TransportError>;

    /// Every server socket currently allocated.
    async fn servers(&self) -> Result<Vec<ServerInfo>, TransportError>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Simulated transport (for testing & offline use)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Default)]
struct SimSocket {
    info: Option<SocketInfo>,
    held: VecDeque<Bytes>,
}

/// A fully in-memory socket transport.
pub struct SimulatedSocketTransport {
    core: SimulatedCore,
    servers: Mutex<BTreeMap<HandleId, ServerInfo>>,
    sockets: Mutex<HashMap<HandleId, SimSocket>>,
    listen_log: Mutex<Vec<(HandleId, String, u16)>>,
    info_lookups: Mutex<Vec<HandleId>>,
    rejected_ports: Mutex<HashSet<u16>>,
    fail_create: AtomicBool,
    fail_info: AtomicBool,
    create_gate: tokio::sync::Semaphore,
    gate_create: AtomicBool,
}

impl SimulatedSocketTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            core: SimulatedCore::new(),
            servers: Mutex::new(BTreeMap::new()),
            sockets: Mutex::new(HashMap::new()),
            listen_log: Mutex::new(Vec::new()),
            info_lookups: Mutex::new(Vec::new()),
            rejected_ports: Mutex::new(HashSet::new()),
            fail_create: AtomicBool::new(false),
            fail_info: AtomicBool::new(false),
            create_gate: tokio::sync::Semaphore::new(0),
            gate_create: AtomicBool::new(false),
        })
    }

    pub fn core(&self) -> &SimulatedCore {
        &self.core
    }

    /// Hold `create_server` until [`Self::finish_create`] is called.
    pub fn hold_create(&self) {
        self.gate_create.store(true, Ordering::SeqCst);
    }

    pub fn finish_create(&self) {
        self.create_gate.add_permits(1);
    }

    pub fn fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    pub fn fail_info(&self, fail: bool) {
        self.fail_info.store(fail, Ordering::SeqCst);
    }

    /// Make `listen` on `port` fail, as if the address were in use.
    pub fn reject_port(&self, port: u16) {
        lock(&self.rejected_ports).insert(port);
    }

    /// Every successful and failed `listen` call, in order.
    pub fn listen_log(&self) -> Vec<(HandleId, String, u16)> {
        lock(&self.listen_log).clone()
    }

    /// Sockets `get_info` was called for, in order.
    pub fn info_lookups(&self) -> Vec<HandleId> {
        lock(&self.info_lookups).clone()
    }

    /// Simulate a peer connecting to `server`.  The new socket starts
    /// paused.  Returns `None` if nobody listens on `server`.
    pub fn accept_from(&self, server: HandleId, peer: Endpoint) -> Option<HandleId> {
        let local = lock(&self.servers).get(&server)?.local.clone();
        let client = self.core.allocate();
        let mut info = SocketInfo::new(client);
        info.local = local;
        info.peer = Some(peer);
        lock(&self.sockets).insert(
            client,
            SimSocket {
                info: Some(info),
                held: VecDeque::new(),
            },
        );
        if !self.core.inject_accept(server, client) {
            lock(&self.sockets).remove(&client);
            self.core.forget(client);
            return None;
        }
        Some(client)
    }

    /// Data arriving from the peer; held while the socket is paused.
    pub fn peer_send(&self, socket: HandleId, data: impl Into<Bytes>) -> bool {
        let data = data.into();
        {
            let mut sockets = lock(&self.sockets);
            let Some(slot) = sockets.get_mut(&socket) else {
                return false;
            };
            if slot.info.as_ref().map(|i| i.paused).unwrap_or(false) {
                slot.held.push_back(data);
                return true;
            }
        }
        self.core.inject_receive(socket, data)
    }

    /// The peer went away.
    pub fn peer_close(&self, socket: HandleId) -> bool {
        self.core.inject_receive_error(socket, "connection closed by peer")
    }

    pub fn is_paused(&self, socket: HandleId) -> Option<bool> {
        lock(&self.sockets)
            .get(&socket)
            .and_then(|s| s.info.as_ref())
            .map(|i| i.paused)
    }
}

#[async_trait::async_trait]
impl Transport for SimulatedSocketTransport {
    fn demux(&self) -> &Demultiplexer {
        self.core.demux()
    }

    async fn send(&self, handle: HandleId, data: Bytes) -> Result<(), TransportError> {
        self.core.send(handle, data).await
    }

    async fn release(&self, handle: HandleId) -> Result<(), TransportError> {
        self.core.release(handle).await?;
        lock(&self.sockets).remove(&handle);
        Ok(())
    }

    async fn resume(&self, handle: HandleId) -> Result<(), TransportError> {
        self.set_paused(handle, false).await
    }
}

#[async_trait::async_trait]
impl SocketTransport for SimulatedSocketTransport {
    async fn set_paused(&self, socket: HandleId, paused: bool) -> Result<(), TransportError> {
        let held: Vec<Bytes> = {
            let mut sockets = lock(&self.sockets);
            let slot = sockets
                .get_mut(&socket)
                .ok_or_else(|| TransportError::not_found(socket))?;
            if let Some(info) = slot.info.as_mut() {
                info.paused = paused;
            }
            if paused {
                Vec::new()
            } else {
                slot.held.drain(..).collect()
            }
        };
        for data in held {
            self.core.inject_receive(socket, data);
        }
        Ok(())
    }

    async fn get_info(&self, socket: HandleId) -> Result<SocketInfo, TransportError> {
        lock(&self.info_lookups).push(socket);
        if self.fail_info.load(Ordering::SeqCst) {
            return Err(TransportError::io("simulated getInfo failure"));
        }
        lock(&self.sockets)
            .get(&socket)
            .and_then(|s| s.info.clone())
            .ok_or_else(|| TransportError::not_found(socket))
    }

    async fn create_server(&self) -> Result<HandleId, TransportError> {
        if self.gate_create.load(Ordering::SeqCst) {
            if let Ok(permit) = self.create_gate.acquire().await {
                permit.forget();
            }
        }
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(TransportError::unavailable("simulated server creation failure"));
        }
        let server = self.core.allocate();
        lock(&self.servers).insert(
            server,
            ServerInfo {
                socket_id: server,
                local: None,
            },
        );
        Ok(server)
    }

    async fn listen(&self, server: HandleId, host: &str, port: u16) -> Result<(), TransportError> {
        lock(&self.listen_log).push((server, host.to_string(), port));
        if lock(&self.rejected_ports).contains(&port) {
            return Err(TransportError::rejected(format!("address {}:{} in use", host, port)));
        }
        let mut servers = lock(&self.servers);
        let info = servers
            .get_mut(&server)
            .ok_or_else(|| TransportError::not_found(server))?;
        // Port 0 binds an ephemeral port, like the real thing.
        let bound = if port == 0 { 40_000 + server.0 as u16 } else { port };
        info.local = Some(Endpoint::socket(host, bound));
        Ok(())
    }

    async fn server_info(&self, server: HandleId) -> Result<ServerInfo, TransportError> {
        lock(&self.servers)
            .get(&server)
            .cloned()
            .ok_or_else(|| TransportError::not_found(server))
    }

    async fn close_server(&self, server: HandleId) -> Result<(), TransportError> {
        if lock(&self.servers).remove(&server).is_none() {
            return Err(TransportError::not_found(server));
        }
        self.core.release(server).await
    }

    async fn servers(&self) -> Result<Vec<ServerInfo>, TransportError> {
        Ok(lock(&self.servers).values().cloned().collect())
    }
}
