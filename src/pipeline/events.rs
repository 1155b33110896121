//! Event stream multiplexer.
//!
//! One [`EventQueue`] per stream merges events from the daemon reader with
//! host-synthesized events (process lifecycle, extensions) in arrival
//! order. The consumer side drains through [`EventQueue::pop`]; closing the
//! queue is a "stop soon" signal that is honored only once every buffered
//! event has been delivered, so nothing queued is ever dropped.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use tokio::sync::{Notify, mpsc};

use tether_types::Event;

/// Thread-safe FIFO of pipeline events.
pub struct EventQueue {
    queue: Mutex<VecDeque<Event>>,
    notify: Notify,
    closed: AtomicBool,
    /// Largest timestamp pushed so far; used as the "last known timestamp"
    /// on synthesized ended events.
    last_timestamp_ns: AtomicI64,
}

impl EventQueue {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            last_timestamp_ns: AtomicI64::new(0),
        }
    }

    /// Append an event. Returns `false` (dropping the event) once the queue
    /// is closed.
    pub fn push(&self, event: Event) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        self.last_timestamp_ns
            .fetch_max(event.timestamp_ns, Ordering::SeqCst);
        self.queue.lock().unwrap().push_back(event);
        self.notify.notify_waiters();
        true
    }

    /// Signal that no further events will arrive. Pending events remain
    /// poppable; [`Self::pop`] returns `None` only after the queue drains.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().unwrap().is_empty()
    }

    /// Largest timestamp seen so far.
    pub fn last_timestamp_ns(&self) -> i64 {
        self.last_timestamp_ns.load(Ordering::SeqCst)
    }

    /// Dequeue the next event, waiting for one to arrive. Returns `None`
    /// once the queue is closed *and* empty.
    pub async fn pop(&self) -> Option<Event> {
        loop {
            // Interest must be registered before the empty check so a push
            // racing between the check and the await still wakes us.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(event) = self.queue.lock().unwrap().pop_front() {
                return Some(event);
            }
            if self.closed.load(Ordering::SeqCst) {
                return None;
            }
            notified.await;
        }
    }

    /// Forward events into `sink` until the queue completes or the sink's
    /// consumer goes away. Completes the sink by dropping it.
    pub async fn pump_to(&self, sink: EventSink) {
        while let Some(event) = self.pop().await {
            if !sink.send(event).await {
                // Consumer hung up; remaining events stay queued for the
                // next subscriber.
                return;
            }
        }
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Sending side of a streaming response.
pub struct EventSink {
    tx: mpsc::Sender<Event>,
}

impl EventSink {
    pub fn new(tx: mpsc::Sender<Event>) -> Self {
        Self { tx }
    }

    /// Deliver one event; `false` when the consumer is gone.
    pub async fn send(&self, event: Event) -> bool {
        self.tx.send(event).await.is_ok()
    }
}

/// Write-once, read-once byte payload store.
///
/// Entries are removed on first successful retrieval. This is a deliberate
/// at-most-one-delivery policy that bounds memory, not a general cache.
pub struct ByteCache {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl ByteCache {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Store a payload under `id`. An existing entry keeps its original
    /// contents; ids are written once.
    pub fn insert(&self, id: impl Into<String>, contents: Vec<u8>) {
        self.entries
            .lock()
            .unwrap()
            .entry(id.into())
            .or_insert(contents);
    }

    /// Retrieve and remove the payload for `id`.
    pub fn take(&self, id: &str) -> Option<Vec<u8>> {
        self.entries.lock().unwrap().remove(id)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }
}

impl Default for ByteCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::timeout;

    fn event(n: i64) -> Event {
        Event::generic(n, n, serde_json::json!({ "seq": n }))
    }

    #[tokio::test]
    async fn test_fifo_order_preserved() {
        let queue = EventQueue::new();
        for n in 0..100 {
            assert!(queue.push(event(n)));
        }
        for n in 0..100 {
            assert_eq!(queue.pop().await.unwrap().group_id, n);
        }
    }

    #[tokio::test]
    async fn test_drain_after_close() {
        // K events queued at the moment of the stop signal must all be
        // delivered before the stream completes.
        for k in [0usize, 1, 1000] {
            let queue = EventQueue::new();
            for n in 0..k {
                queue.push(event(n as i64));
            }
            queue.close();

            let mut delivered = 0;
            while let Some(e) = queue.pop().await {
                assert_eq!(e.group_id, delivered as i64);
                delivered += 1;
            }
            assert_eq!(delivered, k, "all {} queued events must drain", k);
        }
    }

    #[tokio::test]
    async fn test_push_after_close_is_dropped() {
        let queue = EventQueue::new();
        queue.close();
        assert!(!queue.push(event(1)));
        assert!(queue.pop().await.is_none());
    }

    #[tokio::test]
    async fn test_pop_wakes_on_push() {
        let queue = Arc::new(EventQueue::new());
        let popper = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };
        // Give the popper time to start waiting.
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.push(event(7));

        let popped = timeout(Duration::from_secs(1), popper)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(popped.group_id, 7);
    }

    #[tokio::test]
    async fn test_pop_wakes_on_close() {
        let queue = Arc::new(EventQueue::new());
        let popper = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.close();

        let popped = timeout(Duration::from_secs(1), popper)
            .await
            .unwrap()
            .unwrap();
        assert!(popped.is_none());
    }

    #[tokio::test]
    async fn test_pump_delivers_everything_then_stops() {
        let queue = Arc::new(EventQueue::new());
        for n in 0..10 {
            queue.push(event(n));
        }
        queue.close();

        let (tx, mut rx) = mpsc::channel(4);
        let pump = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pump_to(EventSink::new(tx)).await })
        };

        let mut seen = Vec::new();
        while let Some(e) = rx.recv().await {
            seen.push(e.group_id);
        }
        pump.await.unwrap();
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_last_timestamp_tracks_max() {
        let queue = EventQueue::new();
        queue.push(Event::generic(1, 50, serde_json::Value::Null));
        queue.push(Event::generic(2, 30, serde_json::Value::Null));
        assert_eq!(queue.last_timestamp_ns(), 50);
    }

    #[test]
    fn test_byte_cache_read_once() {
        let cache = ByteCache::new();
        cache.insert("blob", vec![1, 2, 3]);

        assert_eq!(cache.take("blob"), Some(vec![1, 2, 3]));
        // Second retrieval finds nothing; the entry was removed.
        assert_eq!(cache.take("blob"), None);
    }

    #[test]
    fn test_byte_cache_write_once() {
        let cache = ByteCache::new();
        cache.insert("blob", vec![1]);
        cache.insert("blob", vec![2]);
        assert_eq!(cache.take("blob"), Some(vec![1]));
    }
}
