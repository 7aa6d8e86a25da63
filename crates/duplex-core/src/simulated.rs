//! In-memory transport plumbing for tests and offline use.
//!
//! [`SimulatedCore`] is a complete [`Transport`] on its own: it allocates
//! handles, records every send in issue order, can hold sends at a gate or
//! fail them, and lets a test inject inbound traffic.  The serial and socket
//! crates wrap it to add their kind-specific primitives.

use crate::demux::{Demultiplexer, TransportEvent};
use crate::error::TransportError;
use crate::transport::Transport;
use crate::types::HandleId;
use bytes::Bytes;
use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::{watch, Semaphore};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct SimulatedCore {
    demux: Demultiplexer,
    next_id: AtomicU32,
    live: Mutex<BTreeSet<HandleId>>,
    sent: Mutex<Vec<(HandleId, Bytes)>>,
    send_count: watch::Sender<usize>,
    send_attempts: AtomicUsize,
    failing_sends: Mutex<HashSet<usize>>,
    gated: AtomicBool,
    gate: Semaphore,
    released: Mutex<Vec<HandleId>>,
    fail_release: AtomicBool,
}

impl Default for SimulatedCore {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedCore {
    pub fn new() -> Self {
        Self {
            demux: Demultiplexer::new(),
            next_id: AtomicU32::new(1),
            live: Mutex::new(BTreeSet::new()),
            sent: Mutex::new(Vec::new()),
            send_count: watch::channel(0).0,
            send_attempts: AtomicUsize::new(0),
            failing_sends: Mutex::new(HashSet::new()),
            gated: AtomicBool::new(false),
            gate: Semaphore::new(0),
            released: Mutex::new(Vec::new()),
            fail_release: AtomicBool::new(false),
        }
    }

    // ── Handles ──────────────────────────────────────────────────────

    /// Allocate a fresh live handle.
    pub fn allocate(&self) -> HandleId {
        let handle = HandleId(self.next_id.fetch_add(1, Ordering::SeqCst));
        lock(&self.live).insert(handle);
        handle
    }

    pub fn is_live(&self, handle: HandleId) -> bool {
        lock(&self.live).contains(&handle)
    }

    pub fn live_handles(&self) -> Vec<HandleId> {
        lock(&self.live).iter().copied().collect()
    }

    /// Drop a handle without recording a release.
    pub fn forget(&self, handle: HandleId) -> bool {
        lock(&self.live).remove(&handle)
    }

    /// Handles released so far, in release order.
    pub fn released(&self) -> Vec<HandleId> {
        lock(&self.released).clone()
    }

    /// Make every subsequent release fail.
    pub fn fail_releases(&self, fail: bool) {
        self.fail_release.store(fail, Ordering::SeqCst);
    }

    // ── Sends ────────────────────────────────────────────────────────

    /// All sends in the order they were issued.
    pub fn sent(&self) -> Vec<(HandleId, Bytes)> {
        lock(&self.sent).clone()
    }

    pub fn sent_to(&self, handle: HandleId) -> Vec<Bytes> {
        lock(&self.sent)
            .iter()
            .filter(|(h, _)| *h == handle)
            .map(|(_, data)| data.clone())
            .collect()
    }

    /// Wait until at least `count` sends have been issued.
    pub async fn wait_for_sends(&self, count: usize) {
        let mut rx = self.send_count.subscribe();
        let _ = rx.wait_for(|n| *n >= count).await;
    }

    /// Fail the send attempt with the given zero-based index.
    pub fn fail_send_at(&self, attempt: usize) {
        lock(&self.failing_sends).insert(attempt);
    }

    /// Hold every send at the gate until released.
    pub fn pause_sends(&self) {
        self.gated.store(true, Ordering::SeqCst);
    }

    /// Let `count` held or future sends complete.
    pub fn release_sends(&self, count: usize) {
        self.gate.add_permits(count);
    }

    /// Open the gate for good.
    pub fn resume_sends(&self) {
        self.gated.store(false, Ordering::SeqCst);
        self.gate.close();
    }

    // ── Inbound ──────────────────────────────────────────────────────

    pub fn inject_receive(&self, handle: HandleId, data: impl Into<Bytes>) -> bool {
        self.demux.route(TransportEvent::Receive {
            handle,
            data: data.into(),
        })
    }

    pub fn inject_receive_error(&self, handle: HandleId, error: impl Into<String>) -> bool {
        self.demux.route(TransportEvent::ReceiveError {
            handle,
            error: error.into(),
        })
    }

    pub fn inject_accept(&self, server: HandleId, client: HandleId) -> bool {
        self.demux.route(TransportEvent::Accept { server, client })
    }
}

#[async_trait::async_trait]
impl Transport for SimulatedCore {
    fn demux(&self) -> &Demultiplexer {
        &self.demux
    }

    async fn send(&self, handle: HandleId, data: Bytes) -> Result<(), TransportError> {
        if !self.is_live(handle) {
            return Err(TransportError::not_found(handle));
        }
        let attempt = self.send_attempts.fetch_add(1, Ordering::SeqCst);
        lock(&self.sent).push((handle, data));
        self.send_count.send_modify(|n| *n += 1);

        if self.gated.load(Ordering::SeqCst) {
            // A closed gate means sends flow freely again.
            if let Ok(permit) = self.gate.acquire().await {
                permit.forget();
            }
        }

        if lock(&self.failing_sends).remove(&attempt) {
            return Err(TransportError::io(format!("simulated send failure #{}", attempt)));
        }
        Ok(())
    }

    async fn release(&self, handle: HandleId) -> Result<(), TransportError> {
        if self.fail_release.load(Ordering::SeqCst) {
            return Err(TransportError::io(format!("simulated release failure for {}", handle)));
        }
        if !lock(&self.live).remove(&handle) {
            return Err(TransportError::not_found(handle));
        }
        lock(&self.released).push(handle);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn records_sends_in_issue_order() {
        let core = SimulatedCore::new();
        let h = core.allocate();
        core.send(h, Bytes::from_static(b"AA")).await.unwrap();
        core.send(h, Bytes::from_static(b"BB")).await.unwrap();
        assert_eq!(core.sent_to(h), vec![Bytes::from_static(b"AA"), Bytes::from_static(b"BB")]);
    }

    #[tokio::test]
    async fn gate_holds_sends() {
        let core = Arc::new(SimulatedCore::new());
        let h = core.allocate();
        core.pause_sends();

        let c = Arc::clone(&core);
        let task = tokio::spawn(async move { c.send(h, Bytes::from_static(b"x")).await });
        core.wait_for_sends(1).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!task.is_finished());

        core.release_sends(1);
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn failing_send_and_release() {
        let core = SimulatedCore::new();
        let h = core.allocate();
        core.fail_send_at(1);
        assert!(core.send(h, Bytes::from_static(b"1")).await.is_ok());
        assert!(core.send(h, Bytes::from_static(b"2")).await.is_err());
        assert!(core.send(h, Bytes::from_static(b"3")).await.is_ok());

        assert!(core.release(h).await.is_ok());
        assert_eq!(core.released(), vec![h]);
        assert!(core.release(h).await.is_err());
        assert!(core.send(h, Bytes::from_static(b"4")).await.is_err());
    }
}
