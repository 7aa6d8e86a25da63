//! Socket transport on `tokio::net`.
//!
//! Every bound server runs an accept task; every accepted socket runs a
//! reader task that waits while the socket is paused.  Both push into the
//! shared demultiplexer.  A peer closing its end is reported as a receive
//! error.

use crate::tcp::transport::SocketTransport;
use crate::tcp::types::{ServerInfo, SocketInfo};
use bytes::Bytes;
use duplex_core::{Demultiplexer, Endpoint, HandleId, Transport, TransportError, TransportEvent};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;

const READ_BUFFER: usize = 4096;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn endpoint(addr: SocketAddr) -> Endpoint {
    Endpoint::socket(addr.ip().to_string(), addr.port())
}

struct ServerSlot {
    local: Option<SocketAddr>,
    accept_task: Option<JoinHandle<()>>,
}

struct SocketSlot {
    writer: Arc<tokio::sync::Mutex<OwnedWriteHalf>>,
    paused: watch::Sender<bool>,
    reader_task: JoinHandle<()>,
    local: Option<SocketAddr>,
    peer: Option<SocketAddr>,
}

#[derive(Default)]
struct Inner {
    demux: Demultiplexer,
    next_id: AtomicU32,
    servers: Mutex<HashMap<HandleId, ServerSlot>>,
    sockets: Mutex<HashMap<HandleId, SocketSlot>>,
}

impl Inner {
    fn allocate(&self) -> HandleId {
        HandleId(self.next_id.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Take ownership of an accepted stream; it starts paused.
    fn adopt(&self, stream: TcpStream) -> HandleId {
        let handle = self.allocate();
        let local = stream.local_addr().ok();
        let peer = stream.peer_addr().ok();
        let (read_half, write_half) = stream.into_split();
        let (paused_tx, paused_rx) = watch::channel(true);

        let reader_task = tokio::spawn(read_loop(handle, read_half, paused_rx, self.demux.clone()));
        lock(&self.sockets).insert(
            handle,
            SocketSlot {
                writer: Arc::new(tokio::sync::Mutex::new(write_half)),
                paused: paused_tx,
                reader_task,
                local,
                peer,
            },
        );
        handle
    }

    fn drop_socket(&self, handle: HandleId) -> Option<SocketSlot> {
        let slot = lock(&self.sockets).remove(&handle)?;
        slot.reader_task.abort();
        Some(slot)
    }
}

async fn read_loop(handle: HandleId, mut read_half: OwnedReadHalf, mut paused: watch::Receiver<bool>, demux: Demultiplexer) {
    let mut buf = vec![0u8; READ_BUFFER];
    loop {
        if paused.wait_for(|p| !*p).await.is_err() {
            break;
        }
        tokio::select! {
            read = read_half.read(&mut buf) => match read {
                Ok(0) => {
                    demux.route(TransportEvent::ReceiveError {
                        handle,
                        error: "connection closed by peer".to_string(),
                    });
                    break;
                }
                Ok(n) => {
                    demux.route(TransportEvent::Receive {
                        handle,
                        data: Bytes::copy_from_slice(&buf[..n]),
                    });
                }
                Err(e) => {
                    demux.route(TransportEvent::ReceiveError {
                        handle,
                        error: e.to_string(),
                    });
                    break;
                }
            },
            changed = paused.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
    log::trace!("[tcp:{}] reader stopped", handle);
}

async fn accept_loop(server: HandleId, listener: TcpListener, inner: Arc<Inner>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let client = inner.adopt(stream);
                log::debug!("[tcp:{}] accepted {} from {}", server, client, peer);
                if !inner.demux.route(TransportEvent::Accept { server, client }) {
                    inner.drop_socket(client);
                }
            }
            Err(e) => {
                log::warn!("[tcp:{}] accept failed: {}", server, e);
                inner.demux.route(TransportEvent::ReceiveError {
                    handle: server,
                    error: e.to_string(),
                });
                break;
            }
        }
    }
}

/// Socket transport for real TCP sockets.
#[derive(Clone, Default)]
pub struct TokioSocketTransport {
    inner: Arc<Inner>,
}

impl TokioSocketTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait::async_trait]
impl Transport for TokioSocketTransport {
    fn demux(&self) -> &Demultiplexer {
        &self.inner.demux
    }

    async fn send(&self, handle: HandleId, data: Bytes) -> Result<(), TransportError> {
        let writer = lock(&self.inner.sockets)
            .get(&handle)
            .map(|s| Arc::clone(&s.writer))
            .ok_or_else(|| TransportError::not_found(handle))?;
        let mut writer = writer.lock().await;
        writer.write_all(&data).await?;
        Ok(())
    }

    async fn release(&self, handle: HandleId) -> Result<(), TransportError> {
        let slot = self
            .inner
            .drop_socket(handle)
            .ok_or_else(|| TransportError::not_found(handle))?;
        let mut writer = slot.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            log::debug!("[tcp:{}] shutdown: {}", handle, e);
        }
        Ok(())
    }

    async fn resume(&self, handle: HandleId) -> Result<(), TransportError> {
        self.set_paused(handle, false).await
    }
}

#[async_trait::async_trait]
impl SocketTransport for TokioSocketTransport {
    async fn set_paused(&self, socket: HandleId, paused: bool) -> Result<(), TransportError> {
        let sockets = lock(&self.inner.sockets);
        let slot = sockets.get(&socket).ok_or_else(|| TransportError::not_found(socket))?;
        slot.paused.send_replace(paused);
        Ok(())
    }

    async fn get_info(&self, socket: HandleId) -> Result<SocketInfo, TransportError> {
        let sockets = lock(&self.inner.sockets);
        let slot = sockets.get(&socket).ok_or_else(|| TransportError::not_found(socket))?;
        let paused = *slot.paused.borrow();
        let info = SocketInfo {
            socket_id: socket,
            local: slot.local.map(endpoint),
            peer: slot.peer.map(endpoint),
            paused,
        };
        Ok(info)
    }

    async fn create_server(&self) -> Result<HandleId, TransportError> {
        let server = self.inner.allocate();
        lock(&self.inner.servers).insert(
            server,
            ServerSlot {
                local: None,
                accept_task: None,
            },
        );
        Ok(server)
    }

    async fn listen(&self, server: HandleId, host: &str, port: u16) -> Result<(), TransportError> {
        if !lock(&self.inner.servers).contains_key(&server) {
            return Err(TransportError::not_found(server));
        }
        let listener = TcpListener::bind((host, port)).await?;
        let local = listener.local_addr()?;
        let task = tokio::spawn(accept_loop(server, listener, Arc::clone(&self.inner)));

        let mut servers = lock(&self.inner.servers);
        match servers.get_mut(&server) {
            Some(slot) => {
                if let Some(previous) = slot.accept_task.replace(task) {
                    previous.abort();
                }
                slot.local = Some(local);
                Ok(())
            }
            None => {
                task.abort();
                Err(TransportError::not_found(server))
            }
        }
    }

    async fn server_info(&self, server: HandleId) -> Result<ServerInfo, TransportError> {
        let servers = lock(&self.inner.servers);
        let slot = servers.get(&server).ok_or_else(|| TransportError::not_found(server))?;
        Ok(ServerInfo {
            socket_id: server,
            local: slot.local.map(endpoint),
        })
    }

    async fn close_server(&self, server: HandleId) -> Result<(), TransportError> {
        let slot = lock(&self.inner.servers)
            .remove(&server)
            .ok_or_else(|| TransportError::not_found(server))?;
        if let Some(task) = slot.accept_task {
            task.abort();
        }
        log::debug!("[tcp:{}] server closed", server);
        Ok(())
    }

    async fn servers(&self) -> Result<Vec<ServerInfo>, TransportError> {
        Ok(lock(&self.inner.servers)
            .iter()
            .map(|(id, slot)| ServerInfo {
                socket_id: *id,
                local: slot.local.map(endpoint),
            })
            .collect())
    }
}
