//! TCP ⇄ serial relay.
//!
//! One serial channel, any number of TCP clients.  Every frame a client
//! sends is written to the serial port; every serial frame is written to
//! every connected client.

use crate::config::BridgeConfig;
use anyhow::{bail, Result};
use bytes::{Bytes, BytesMut};
use duplex_core::{Channel, ChannelEvent, HandleId};
use duplex_serial::{disconnect_all, open_port, SerialOptions, SerialTransport};
use duplex_tcp::{close_all_servers, AcceptedSocket, Listener, ListenerEvent, SocketTransport};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

type Clients = Arc<Mutex<HashMap<HandleId, Channel>>>;

/// Release every connection and server the transports still track.
/// Failures are logged only.  The system transports start empty, so for
/// them this only matters when `run` is called again in one process.
pub async fn startup_cleanup<S, N>(serial: &S, sockets: &N)
where
    S: SerialTransport + ?Sized,
    N: SocketTransport + ?Sized,
{
    match disconnect_all(serial).await {
        Ok(n) => tracing::debug!(released = n, "serial cleanup done"),
        Err(e) => tracing::warn!("serial cleanup failed: {}", e),
    }
    match close_all_servers(sockets).await {
        Ok(n) => tracing::debug!(closed = n, "server cleanup done"),
        Err(e) => tracing::warn!("server cleanup failed: {}", e),
    }
}

/// Run until `shutdown` resolves, the serial port closes or the listener
/// fails.
pub async fn run<S, N, F>(serial: Arc<S>, sockets: Arc<N>, config: &BridgeConfig, shutdown: F) -> Result<()>
where
    S: SerialTransport + ?Sized + 'static,
    N: SocketTransport + ?Sized + 'static,
    F: Future<Output = ()>,
{
    if config.startup_cleanup {
        startup_cleanup(serial.as_ref(), sockets.as_ref()).await;
    }

    let settings = config.serial.settings.clone();
    // Line parsers strip the delimiter; it is put back before forwarding.
    let suffix = settings.parser.delimiter().map(Bytes::copy_from_slice);
    let client_suffix = config.tcp.settings.parser.delimiter().map(Bytes::copy_from_slice);
    let (port, mut port_events) = open_port(serial, &config.serial.path, SerialOptions::from(settings))?;
    match port_events.recv().await {
        Some(ChannelEvent::Open) => tracing::info!("serial port {} open", config.serial.path),
        Some(ChannelEvent::Error(e)) => bail!("Failed to open {}: {}", config.serial.path, e),
        _ => bail!("Serial port {} closed before opening", config.serial.path),
    }

    let (listener, mut listener_events) = Listener::create_with(sockets, config.tcp.settings.clone());
    listener.listen(config.tcp.port, &config.tcp.host);

    let clients: Clients = Arc::default();
    tokio::pin!(shutdown);

    let outcome = loop {
        tokio::select! {
            _ = &mut shutdown => break Ok(()),
            event = port_events.recv() => match event {
                Some(ChannelEvent::Data(frame)) => broadcast(&clients, frame, suffix.as_ref()),
                Some(ChannelEvent::Error(e)) => tracing::warn!("serial: {}", e),
                Some(ChannelEvent::Open) => {}
                Some(ChannelEvent::Close) | None => break Err(anyhow::anyhow!("Serial port {} closed", config.serial.path)),
            },
            event = listener_events.recv() => match event {
                Some(ListenerEvent::Ready) => {}
                Some(ListenerEvent::Listening(addr)) => tracing::info!("accepting clients on {}", addr),
                Some(ListenerEvent::Accept(accepted)) => {
                    attach(accepted, port.clone(), Arc::clone(&clients), client_suffix.clone())
                }
                Some(ListenerEvent::Error(e)) => break Err(anyhow::anyhow!("Listener failed: {}", e)),
                None => break Err(anyhow::anyhow!("Listener stopped")),
            },
        }
    };

    let remaining: Vec<Channel> = lock(&clients).drain().map(|(_, c)| c).collect();
    for client in &remaining {
        client.close();
    }
    port.close();
    for client in &remaining {
        client.closed().await;
    }
    port.closed().await;
    outcome
}

fn terminated(frame: Bytes, suffix: Option<&Bytes>) -> Bytes {
    match suffix {
        Some(suffix) => {
            let mut buf = BytesMut::with_capacity(frame.len() + suffix.len());
            buf.extend_from_slice(&frame);
            buf.extend_from_slice(suffix);
            buf.freeze()
        }
        None => frame,
    }
}

fn broadcast(clients: &Clients, frame: Bytes, suffix: Option<&Bytes>) {
    let data = terminated(frame, suffix);
    for (handle, client) in lock(clients).iter() {
        if let Err(e) = client.write(data.clone()) {
            tracing::debug!("client {}: {}", handle, e);
        }
    }
}

/// Track an accepted client and pump its frames into the serial port.
fn attach(accepted: AcceptedSocket, port: Channel, clients: Clients, suffix: Option<Bytes>) {
    let AcceptedSocket { info, channel, events } = accepted;
    let handle = info.socket_id;
    let peer = info
        .peer
        .as_ref()
        .map(|p| p.to_string())
        .unwrap_or_else(|| "unknown".to_string());
    tracing::info!("client {} connected from {}", handle, peer);
    lock(&clients).insert(handle, channel);
    tokio::spawn(pump_client(handle, events, port, clients, suffix));
}

async fn pump_client(
    handle: HandleId,
    mut events: mpsc::UnboundedReceiver<ChannelEvent>,
    port: Channel,
    clients: Clients,
    suffix: Option<Bytes>,
) {
    while let Some(event) = events.recv().await {
        match event {
            ChannelEvent::Data(frame) => {
                if let Err(e) = port.write(terminated(frame, suffix.as_ref())) {
                    tracing::warn!("client {}: serial write refused: {}", handle, e);
                }
            }
            ChannelEvent::Error(e) => tracing::debug!("client {}: {}", handle, e),
            ChannelEvent::Open => {}
            ChannelEvent::Close => break,
        }
    }
    lock(&clients).remove(&handle);
    tracing::info!("client {} disconnected", handle);
}
