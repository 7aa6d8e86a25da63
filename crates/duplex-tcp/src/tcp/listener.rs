//! Listener: accepts inbound connections and wraps each in a channel.
//!
//! Creating the server socket is asynchronous, so `listen` may be called
//! before the server exists.  Such a request is stored; a later request
//! replaces an earlier one, and the stored request runs once the server is
//! ready.

use crate::tcp::socket::wrap_socket;
use crate::tcp::transport::SocketTransport;
use crate::tcp::types::{SocketInfo, SocketSettings};
use duplex_core::{Channel, ChannelError, ChannelEvent, Endpoint, HandleId, InboundEvent};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

// ── Events ──────────────────────────────────────────────────────────────

/// A connection accepted by a [`Listener`], already wrapped in a channel.
#[derive(Debug)]
pub struct AcceptedSocket {
    pub info: SocketInfo,
    pub channel: Channel,
    pub events: mpsc::UnboundedReceiver<ChannelEvent>,
}

#[derive(Debug)]
pub enum ListenerEvent {
    /// The server socket exists.
    Ready,
    /// Bound; carries the requested `host:port`.
    Listening(String),
    Accept(AcceptedSocket),
    /// Creation or bind failed; the listener has stopped.
    Error(ChannelError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ListenRequest {
    host: String,
    port: u16,
}

// ── Handle ──────────────────────────────────────────────────────────────

/// Consumer-side handle of a running listener.
#[derive(Debug, Clone)]
pub struct Listener {
    requests: mpsc::UnboundedSender<ListenRequest>,
    server: watch::Receiver<Option<HandleId>>,
    endpoint: watch::Receiver<Option<Endpoint>>,
}

impl Listener {
    /// Start creating a server socket with default socket settings.
    pub fn create<T>(transport: Arc<T>) -> (Listener, mpsc::UnboundedReceiver<ListenerEvent>)
    where
        T: SocketTransport + ?Sized + 'static,
    {
        Self::create_with(transport, SocketSettings::default())
    }

    /// Start creating a server socket; accepted sockets use `settings`.
    pub fn create_with<T>(
        transport: Arc<T>,
        settings: SocketSettings,
    ) -> (Listener, mpsc::UnboundedReceiver<ListenerEvent>)
    where
        T: SocketTransport + ?Sized + 'static,
    {
        let (req_tx, req_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (server_tx, server_rx) = watch::channel(None);
        let (endpoint_tx, endpoint_rx) = watch::channel(None);

        let runner = ListenerRunner {
            transport,
            settings,
            requests: req_rx,
            events: event_tx,
            server: server_tx,
            endpoint: endpoint_tx,
        };
        tokio::spawn(runner.run());

        let listener = Listener {
            requests: req_tx,
            server: server_rx,
            endpoint: endpoint_rx,
        };
        (listener, event_rx)
    }

    /// Bind to `host:port`, now or as soon as the server is ready.
    pub fn listen(&self, port: u16, host: &str) {
        let request = ListenRequest {
            host: host.to_string(),
            port,
        };
        if self.requests.send(request).is_err() {
            log::debug!("[listener] listen({}:{}) after the listener stopped", host, port);
        }
    }

    /// Bound endpoint as reported by the transport.
    pub fn local_endpoint(&self) -> Option<Endpoint> {
        self.endpoint.borrow().clone()
    }

    pub fn server_handle(&self) -> Option<HandleId> {
        *self.server.borrow()
    }

    /// Wait until the listener is bound.  `None` if it stopped first.
    pub async fn bound(&self) -> Option<Endpoint> {
        let mut rx = self.endpoint.clone();
        let bound = rx.wait_for(|e| e.is_some()).await.map(|e| (*e).clone());
        bound.ok().flatten()
    }
}

// ── Runner ──────────────────────────────────────────────────────────────

struct ListenerRunner<T: ?Sized> {
    transport: Arc<T>,
    settings: SocketSettings,
    requests: mpsc::UnboundedReceiver<ListenRequest>,
    events: mpsc::UnboundedSender<ListenerEvent>,
    server: watch::Sender<Option<HandleId>>,
    endpoint: watch::Sender<Option<Endpoint>>,
}

impl<T> ListenerRunner<T>
where
    T: SocketTransport + ?Sized + 'static,
{
    async fn run(mut self) {
        let mut pending: Option<ListenRequest> = None;
        let mut handle_gone = false;

        let created = {
            let create = self.transport.create_server();
            tokio::pin!(create);
            loop {
                tokio::select! {
                    result = &mut create => break result,
                    req = self.requests.recv(), if !handle_gone => match req {
                        Some(req) => pending = Some(req),
                        None => handle_gone = true,
                    },
                }
            }
        };

        let server = match created {
            Ok(server) => server,
            Err(e) => {
                log::error!("[listener] server creation failed: {}", e);
                self.emit(ListenerEvent::Error(ChannelError::connect(e)));
                return;
            }
        };

        // The route exists before anything can be accepted.
        let mut inbound = self.transport.demux().register(server);
        self.server.send_replace(Some(server));
        log::debug!("[listener:{}] ready", server);
        self.emit(ListenerEvent::Ready);

        // Requests that queued up while creating: the latest one wins.
        while let Ok(req) = self.requests.try_recv() {
            pending = Some(req);
        }
        if let Some(req) = pending.take() {
            if !self.bind(server, req).await {
                self.stop(server);
                return;
            }
        }

        loop {
            tokio::select! {
                event = inbound.recv() => match event {
                    Some(InboundEvent::Accept(client)) => self.accept(server, client).await,
                    Some(InboundEvent::Receive(_)) => {
                        log::debug!("[listener:{}] ignoring data on server socket", server);
                    }
                    Some(InboundEvent::ReceiveError(e)) => {
                        log::error!("[listener:{}] accept failed: {}", server, e);
                        self.emit(ListenerEvent::Error(ChannelError::receive(e).with_handle(server)));
                        break;
                    }
                    None => break,
                },
                req = self.requests.recv(), if !handle_gone => match req {
                    Some(req) => {
                        if !self.bind(server, req).await {
                            break;
                        }
                    }
                    None => handle_gone = true,
                },
            }
        }
        self.stop(server);
    }

    fn emit(&self, event: ListenerEvent) {
        let _ = self.events.send(event);
    }

    /// Run one listen request.  Returns `false` if the listener must stop.
    async fn bind(&self, server: HandleId, req: ListenRequest) -> bool {
        if let Err(e) = self.transport.listen(server, &req.host, req.port).await {
            log::error!("[listener:{}] listen on {}:{} failed: {}", server, req.host, req.port, e);
            self.emit(ListenerEvent::Error(ChannelError::bind(e).with_handle(server)));
            return false;
        }

        match self.transport.server_info(server).await {
            Ok(info) => {
                self.endpoint.send_replace(info.local);
            }
            Err(e) => log::warn!("[listener:{}] could not read bound endpoint: {}", server, e),
        }

        let addr = format!("{}:{}", req.host, req.port);
        log::info!("[listener:{}] listening on {}", server, addr);
        self.emit(ListenerEvent::Listening(addr));
        true
    }

    async fn accept(&self, server: HandleId, client: HandleId) {
        let info = match self.transport.get_info(client).await {
            Ok(info) => info,
            Err(e) => {
                log::warn!("[listener:{}] dropping socket {}: {}", server, client, e);
                if let Err(e) = self.transport.release(client).await {
                    log::debug!("[listener:{}] release of {} failed: {}", server, client, e);
                }
                return;
            }
        };

        match wrap_socket(Arc::clone(&self.transport), &info, &self.settings) {
            Ok((channel, events)) => {
                log::debug!("[listener:{}] accepted {}", server, client);
                self.emit(ListenerEvent::Accept(AcceptedSocket { info, channel, events }));
            }
            Err(e) => {
                log::warn!("[listener:{}] cannot wrap socket {}: {}", server, client, e);
                let _ = self.transport.release(client).await;
            }
        }
    }

    fn stop(&self, server: HandleId) {
        self.transport.demux().unregister(server);
        log::debug!("[listener:{}] stopped", server);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tcp::transport::SimulatedSocketTransport;
    use bytes::Bytes;
    use duplex_core::{ChannelErrorKind, ParserConfig};

    #[tokio::test]
    async fn listen_after_ready() {
        let t = SimulatedSocketTransport::new();
        let (listener, mut events) = Listener::create(Arc::clone(&t));
        assert!(matches!(events.recv().await, Some(ListenerEvent::Ready)));

        listener.listen(1338, "127.0.0.1");
        match events.recv().await {
            Some(ListenerEvent::Listening(addr)) => assert_eq!(addr, "127.0.0.1:1338"),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(listener.local_endpoint(), Some(Endpoint::socket("127.0.0.1", 1338)));
    }

    #[tokio::test]
    async fn last_listen_before_ready_wins() {
        let t = SimulatedSocketTransport::new();
        t.hold_create();
        let (listener, mut events) = Listener::create(Arc::clone(&t));

        listener.listen(8000, "0.0.0.0");
        listener.listen(9000, "127.0.0.1");
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        t.finish_create();

        assert!(matches!(events.recv().await, Some(ListenerEvent::Ready)));
        match events.recv().await {
            Some(ListenerEvent::Listening(addr)) => assert_eq!(addr, "127.0.0.1:9000"),
            other => panic!("unexpected {:?}", other),
        }
        let log = t.listen_log();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].2, 9000);
    }

    #[tokio::test]
    async fn listening_carries_requested_values() {
        let t = SimulatedSocketTransport::new();
        let (listener, mut events) = Listener::create(Arc::clone(&t));
        listener.listen(0, "127.0.0.1");

        assert!(matches!(events.recv().await, Some(ListenerEvent::Ready)));
        match events.recv().await {
            Some(ListenerEvent::Listening(addr)) => assert_eq!(addr, "127.0.0.1:0"),
            other => panic!("unexpected {:?}", other),
        }
        match listener.bound().await {
            Some(Endpoint::Socket { port, .. }) => assert_ne!(port, 0),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn accept_wraps_socket_after_info_lookup() {
        let t = SimulatedSocketTransport::new();
        let settings = SocketSettings {
            parser: ParserConfig::readline(),
            ..Default::default()
        };
        let (listener, mut events) = Listener::create_with(Arc::clone(&t), settings);
        listener.listen(1338, "127.0.0.1");
        assert!(matches!(events.recv().await, Some(ListenerEvent::Ready)));
        assert!(matches!(events.recv().await, Some(ListenerEvent::Listening(_))));

        let server = listener.server_handle().unwrap();
        let client = t.accept_from(server, Endpoint::socket("127.0.0.1", 50200)).unwrap();
        let mut accepted = match events.recv().await {
            Some(ListenerEvent::Accept(a)) => a,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(t.info_lookups(), vec![client]);
        assert_eq!(accepted.info.peer, Some(Endpoint::socket("127.0.0.1", 50200)));

        assert_eq!(accepted.events.recv().await, Some(ChannelEvent::Open));
        t.peer_send(client, &b"?\r\n"[..]);
        assert_eq!(accepted.events.recv().await, Some(ChannelEvent::Data(Bytes::from_static(b"?"))));
        accepted.channel.close();
        assert_eq!(accepted.events.recv().await, Some(ChannelEvent::Close));
    }

    #[tokio::test]
    async fn bind_failure_stops_listener() {
        let t = SimulatedSocketTransport::new();
        t.reject_port(80);
        let (listener, mut events) = Listener::create(Arc::clone(&t));
        listener.listen(80, "0.0.0.0");

        assert!(matches!(events.recv().await, Some(ListenerEvent::Ready)));
        match events.recv().await {
            Some(ListenerEvent::Error(e)) => assert_eq!(e.kind, ChannelErrorKind::Bind),
            other => panic!("unexpected {:?}", other),
        }
        assert!(events.recv().await.is_none());
        assert!(listener.local_endpoint().is_none());
    }

    #[tokio::test]
    async fn creation_failure_is_a_connect_error() {
        let t = SimulatedSocketTransport::new();
        t.fail_create(true);
        let (listener, mut events) = Listener::create(Arc::clone(&t));
        listener.listen(1338, "127.0.0.1");

        match events.recv().await {
            Some(ListenerEvent::Error(e)) => assert_eq!(e.kind, ChannelErrorKind::Connect),
            other => panic!("unexpected {:?}", other),
        }
        assert!(events.recv().await.is_none());
        assert!(listener.bound().await.is_none());
    }

    #[tokio::test]
    async fn failed_info_lookup_drops_the_socket() {
        let t = SimulatedSocketTransport::new();
        let (listener, mut events) = Listener::create(Arc::clone(&t));
        listener.listen(1338, "127.0.0.1");
        assert!(matches!(events.recv().await, Some(ListenerEvent::Ready)));
        assert!(matches!(events.recv().await, Some(ListenerEvent::Listening(_))));

        t.fail_info(true);
        let server = listener.server_handle().unwrap();
        let client = t.accept_from(server, Endpoint::socket("127.0.0.1", 50300)).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        t.fail_info(false);
        let second = t.accept_from(server, Endpoint::socket("127.0.0.1", 50301)).unwrap();

        match events.recv().await {
            Some(ListenerEvent::Accept(a)) => assert_eq!(a.info.socket_id, second),
            other => panic!("unexpected {:?}", other),
        }
        assert!(t.core().released().contains(&client));
    }
}
