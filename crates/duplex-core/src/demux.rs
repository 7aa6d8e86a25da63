//! Routing of the shared transport event stream.
//!
//! A transport produces one stream of handle-tagged events for all of its
//! connections.  The [`Demultiplexer`] hands each event to the single
//! consumer registered for that handle and drops the rest.

use crate::types::HandleId;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

/// Event as produced by a transport.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Receive { handle: HandleId, data: Bytes },
    ReceiveError { handle: HandleId, error: String },
    Accept { server: HandleId, client: HandleId },
}

impl TransportEvent {
    /// The handle this event belongs to (the server for accepts).
    pub fn handle(&self) -> HandleId {
        match self {
            TransportEvent::Receive { handle, .. } => *handle,
            TransportEvent::ReceiveError { handle, .. } => *handle,
            TransportEvent::Accept { server, .. } => *server,
        }
    }
}

/// Event as seen by the registered consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    Receive(Bytes),
    ReceiveError(String),
    Accept(HandleId),
}

impl From<TransportEvent> for InboundEvent {
    fn from(event: TransportEvent) -> Self {
        match event {
            TransportEvent::Receive { data, .. } => InboundEvent::Receive(data),
            TransportEvent::ReceiveError { error, .. } => InboundEvent::ReceiveError(error),
            TransportEvent::Accept { client, .. } => InboundEvent::Accept(client),
        }
    }
}

/// Handle-keyed router.  Cheap to clone; clones share routes.
///
/// `route` is synchronous so blocking reader threads can call it directly.
#[derive(Debug, Clone, Default)]
pub struct Demultiplexer {
    routes: Arc<Mutex<HashMap<HandleId, mpsc::UnboundedSender<InboundEvent>>>>,
}

impl Demultiplexer {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<HandleId, mpsc::UnboundedSender<InboundEvent>>> {
        // A panicking holder cannot leave the map half-updated.
        self.routes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register the consumer for `handle`, replacing any previous route.
    pub fn register(&self, handle: HandleId) -> mpsc::UnboundedReceiver<InboundEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        if self.lock().insert(handle, tx).is_some() {
            log::debug!("[demux] replaced route for handle {}", handle);
        }
        rx
    }

    /// Remove the route for `handle`.  Returns whether one existed.
    pub fn unregister(&self, handle: HandleId) -> bool {
        self.lock().remove(&handle).is_some()
    }

    pub fn is_registered(&self, handle: HandleId) -> bool {
        self.lock().contains_key(&handle)
    }

    pub fn route_count(&self) -> usize {
        self.lock().len()
    }

    /// Deliver `event` to its consumer.  Returns `false` if nobody listens.
    pub fn route(&self, event: TransportEvent) -> bool {
        let handle = event.handle();
        let mut routes = self.lock();
        let Some(tx) = routes.get(&handle) else {
            log::trace!("[demux] no route for handle {}, event dropped", handle);
            return false;
        };
        if tx.send(event.into()).is_err() {
            routes.remove(&handle);
            log::debug!("[demux] consumer for handle {} is gone", handle);
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn routes_only_to_matching_handle() {
        let demux = Demultiplexer::new();
        let mut a = demux.register(HandleId(1));
        let mut b = demux.register(HandleId(2));

        assert!(demux.route(TransportEvent::Receive {
            handle: HandleId(2),
            data: Bytes::from_static(b"hi"),
        }));
        assert!(!demux.route(TransportEvent::Receive {
            handle: HandleId(9),
            data: Bytes::from_static(b"lost"),
        }));

        assert_eq!(b.recv().await, Some(InboundEvent::Receive(Bytes::from_static(b"hi"))));
        assert!(a.try_recv().is_err());
    }

    #[tokio::test]
    async fn accept_routes_by_server_handle() {
        let demux = Demultiplexer::new();
        let mut server = demux.register(HandleId(10));
        demux.route(TransportEvent::Accept {
            server: HandleId(10),
            client: HandleId(11),
        });
        assert_eq!(server.recv().await, Some(InboundEvent::Accept(HandleId(11))));
    }

    #[test]
    fn unregister_and_dead_consumer() {
        let demux = Demultiplexer::new();
        let rx = demux.register(HandleId(1));
        assert!(demux.is_registered(HandleId(1)));
        drop(rx);
        assert!(!demux.route(TransportEvent::ReceiveError {
            handle: HandleId(1),
            error: "gone".into(),
        }));
        assert_eq!(demux.route_count(), 0);

        let _rx = demux.register(HandleId(2));
        assert!(demux.unregister(HandleId(2)));
        assert!(!demux.unregister(HandleId(2)));
    }
}
