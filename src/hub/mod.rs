//! Bounded in-memory ring buffers and fan-out hubs (C1).
//!
//! Grounded on the teacher's `ipc::event::EventBroadcaster` for the "one
//! sender, many receivers" shape, but `broadcast::channel`'s lag-based drop
//! applies uniformly to every subscriber when the slowest falls behind. The
//! per-subscriber drop-on-full policy here needs per-subscriber channels, so
//! `SubscriberHub` is built from a mutex-guarded map of bounded `mpsc`
//! senders instead.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;

use crate::model::{DebugEvent, LogStream};

const SUBSCRIBER_CHANNEL_CAPACITY: usize = 256;

/// Byte ring bounded by `max_bytes`. All operations are mutex-guarded and
/// never block producers.
pub struct LogBuffer {
    inner: Mutex<VecDeque<u8>>,
    max_bytes: usize,
}

impl LogBuffer {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(max_bytes.min(64 * 1024))),
            max_bytes,
        }
    }

    /// Append `p`, keeping only the trailing `max_bytes`.
    pub fn append(&self, p: &[u8]) {
        let mut buf = self.inner.lock().unwrap();
        buf.extend(p.iter().copied());
        let overflow = buf.len().saturating_sub(self.max_bytes);
        if overflow > 0 {
            buf.drain(..overflow);
        }
    }

    /// Pop up to `n` leading bytes and return them.
    pub fn drain(&self, n: usize) -> Vec<u8> {
        let mut buf = self.inner.lock().unwrap();
        let take = n.min(buf.len());
        buf.drain(..take).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.inner.lock().unwrap().clear();
    }
}

/// A single subscriber's delivery channel plus the stream filter it wants.
struct Subscriber<T> {
    filter: LogStream,
    tx: mpsc::Sender<T>,
}

/// Fan-out hub with per-subscriber bounded channels and drop-on-full
/// semantics. `T` is `LogEvent`/`Item`/`DebugEvent` depending on instance.
pub struct SubscriberHub<T: Clone + Send + 'static> {
    subscribers: Mutex<std::collections::HashMap<u64, Subscriber<T>>>,
    next_id: AtomicU64,
}

impl<T: Clone + Send + 'static> Default for SubscriberHub<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> SubscriberHub<T> {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(std::collections::HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a subscriber filtered to `filter` (always `Combined` for
    /// item/debug hubs). Returns the receiver and a cancel handle.
    pub fn add(self: &std::sync::Arc<Self>, filter: LogStream) -> (mpsc::Receiver<T>, CancelHandle<T>) {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CHANNEL_CAPACITY);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .lock()
            .unwrap()
            .insert(id, Subscriber { filter, tx });
        (rx, CancelHandle { hub: self.clone(), id, cancelled: std::sync::atomic::AtomicBool::new(false) })
    }

    fn remove(&self, id: u64) {
        self.subscribers.lock().unwrap().remove(&id);
    }

    pub fn count(&self) -> usize {
        self.subscribers.lock().unwrap().len()
    }

    /// Non-blocking enqueue to every subscriber whose filter matches `stream`.
    /// A full channel silently drops the event for that subscriber only.
    pub fn broadcast_filtered(&self, stream: LogStream, event: T) {
        let subs = self.subscribers.lock().unwrap();
        for sub in subs.values() {
            if sub.filter == LogStream::Combined || sub.filter == stream {
                let _ = sub.tx.try_send(event.clone());
            }
        }
    }

    /// Broadcast to every subscriber unconditionally (item/debug hubs are
    /// always combined).
    pub fn broadcast(&self, event: T) {
        self.broadcast_filtered(LogStream::Combined, event);
    }
}

/// Cancels a subscription exactly once on drop or explicit `cancel()`.
pub struct CancelHandle<T: Clone + Send + 'static> {
    hub: std::sync::Arc<SubscriberHub<T>>,
    id: u64,
    cancelled: std::sync::atomic::AtomicBool,
}

impl<T: Clone + Send + 'static> CancelHandle<T> {
    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            self.hub.remove(self.id);
        }
    }
}

impl<T: Clone + Send + 'static> Drop for CancelHandle<T> {
    fn drop(&mut self) {
        self.cancel();
    }
}

pub type LogHub = SubscriberHub<crate::model::LogEvent>;
pub type ItemHub = SubscriberHub<crate::model::Item>;
pub type DebugHub = SubscriberHub<DebugEvent>;

/// Bounded retained history of debug events with drop-oldest-first semantics,
/// so a late joiner can request a `Snapshot(n)` instead of only live events.
pub struct DebugBuffer {
    ring: Mutex<VecDeque<DebugEvent>>,
    capacity: usize,
    seq: AtomicU64,
}

impl DebugBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
            capacity,
            seq: AtomicU64::new(0),
        }
    }

    pub fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn push(&self, event: DebugEvent) {
        let mut ring = self.ring.lock().unwrap();
        if ring.len() >= self.capacity {
            ring.pop_front();
        }
        ring.push_back(event);
    }

    /// Returns the most recent `n` retained events, oldest first.
    pub fn snapshot(&self, n: usize) -> Vec<DebugEvent> {
        let ring = self.ring.lock().unwrap();
        let len = ring.len();
        let skip = len.saturating_sub(n);
        ring.iter().skip(skip).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_buffer_bounds_and_drains_prefix() {
        let buf = LogBuffer::new(8);
        buf.append(b"0123456789");
        assert_eq!(buf.len(), 8);
        let drained = buf.drain(3);
        assert_eq!(drained, b"234");
        assert_eq!(buf.len(), 5);
    }

    #[tokio::test]
    async fn subscriber_hub_drops_on_full_channel() {
        let hub = std::sync::Arc::new(SubscriberHub::<u32>::new());
        let (mut rx, _cancel) = hub.add(LogStream::Combined);
        for i in 0..(SUBSCRIBER_CHANNEL_CAPACITY as u32 + 50) {
            hub.broadcast(i);
        }
        let mut received = 0;
        while rx.try_recv().is_ok() {
            received += 1;
        }
        assert!(received <= SUBSCRIBER_CHANNEL_CAPACITY);
    }

    #[test]
    fn debug_buffer_retains_bounded_recent_history() {
        let buf = DebugBuffer::new(4);
        for i in 0..10u64 {
            buf.push(DebugEvent {
                seq: i,
                session_id: "s".into(),
                stream: "stdout".into(),
                chunk: i.to_string(),
                ts: chrono::Utc::now(),
            });
        }
        let snap = buf.snapshot(10);
        assert_eq!(snap.len(), 4);
        assert_eq!(snap.first().unwrap().seq, 6);
        assert_eq!(snap.last().unwrap().seq, 9);
    }
}
