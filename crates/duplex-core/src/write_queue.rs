//! Outbound buffer with at most one send in flight.

use bytes::Bytes;
use std::collections::VecDeque;

/// Ordered pending writes of one channel.
///
/// The queue never talks to a transport itself.  The owning channel asks
/// [`WriteQueue::flush`] for the next buffer, issues exactly one send for it
/// and reports back through [`WriteQueue::complete`] or [`WriteQueue::abort`].
#[derive(Debug, Default)]
pub struct WriteQueue {
    pending: VecDeque<Bytes>,
    in_flight: bool,
    aborted: bool,
}

impl WriteQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a buffer.  Returns `false` once the queue has been aborted.
    pub fn enqueue(&mut self, buf: Bytes) -> bool {
        if self.aborted {
            return false;
        }
        self.pending.push_back(buf);
        true
    }

    /// Take the head buffer for sending, if a send may start now.
    pub fn flush(&mut self, writable: bool) -> Option<Bytes> {
        if self.aborted || self.in_flight || !writable {
            return None;
        }
        let head = self.pending.pop_front()?;
        self.in_flight = true;
        Some(head)
    }

    /// The in-flight send finished successfully.
    pub fn complete(&mut self) {
        self.in_flight = false;
    }

    /// Drop everything still pending; returns how many buffers were discarded.
    pub fn abort(&mut self) -> usize {
        self.aborted = true;
        self.in_flight = false;
        let dropped = self.pending.len();
        self.pending.clear();
        dropped
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn in_flight(&self) -> bool {
        self.in_flight
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    /// Nothing pending and nothing in flight.
    pub fn is_idle(&self) -> bool {
        self.pending.is_empty() && !self.in_flight
    }
}
