//! Bounded FIFO event queue.
//!
//! Publishing never blocks the pipeline: when the queue is full the event is
//! dropped and counted. There is no priority between event types, so events
//! leave in exactly the order they arrived.

use cryptobot_core::Event;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub enqueued: u64,
    pub dequeued: u64,
    pub dropped: u64,
    pub capacity: usize,
    pub len: usize,
}

pub struct EventQueue {
    tx: mpsc::Sender<Event>,
    rx: Mutex<mpsc::Receiver<Event>>,
    capacity: usize,
    enqueued: AtomicU64,
    dequeued: AtomicU64,
    dropped: AtomicU64,
}

impl EventQueue {
    /// Creates a queue holding at most `capacity` events (minimum 1).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            tx,
            rx: Mutex::new(rx),
            capacity,
            enqueued: AtomicU64::new(0),
            dequeued: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Non-blocking put. Returns `false` and counts a drop when full.
    pub fn try_put(&self, event: Event) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => {
                self.enqueued.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Full(event)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    kind = %event.kind(),
                    event_id = %event.id(),
                    dropped,
                    "Event queue full, dropping event"
                );
                false
            }
            Err(TrySendError::Closed(event)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(kind = %event.kind(), "Event queue closed, dropping event");
                false
            }
        }
    }

    /// Waits up to `timeout` for room. A timed-out put is counted as a drop.
    pub async fn put(&self, event: Event, timeout: Duration) -> bool {
        let kind = event.kind();
        match self.tx.send_timeout(event, timeout).await {
            Ok(()) => {
                self.enqueued.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(_) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(%kind, dropped, "Timed out waiting for queue space, dropping event");
                false
            }
        }
    }

    /// Non-blocking get. Also returns `None` while another consumer holds
    /// the receiving end.
    pub fn try_get(&self) -> Option<Event> {
        let mut rx = self.rx.try_lock().ok()?;
        let event = rx.try_recv().ok()?;
        self.dequeued.fetch_add(1, Ordering::Relaxed);
        Some(event)
    }

    /// Waits up to `timeout` for the next event.
    pub async fn get(&self, timeout: Duration) -> Option<Event> {
        let mut rx = self.rx.lock().await;
        match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Some(event)) => {
                self.dequeued.fetch_add(1, Ordering::Relaxed);
                Some(event)
            }
            Ok(None) => None,
            Err(_) => {
                debug!("Queue poll timed out");
                None
            }
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.capacity - self.tx.capacity()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn stats(&self) -> QueueStats {
        QueueStats {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            dequeued: self.dequeued.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            capacity: self.capacity,
            len: self.len(),
        }
    }
}
