use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;

use crate::frame::Frame;

/// Thread-safe bounded FIFO of frames, the synchronization primitive
/// between pipeline stages.
///
/// Two draining policies:
/// - blocking (`drop_when_full = false`): `enqueue` suspends the
///   producer while the queue is full;
/// - dropping (`drop_when_full = true`): `enqueue` never suspends, the
///   oldest buffered frame is evicted to make room and the drop counter
///   is incremented.
///
/// `close` is idempotent and wakes every suspended producer and
/// consumer: producers fail silently, consumers drain the remaining
/// frames and then observe `None`.
pub struct FrameQueue {
    name: String,
    inner: Mutex<Inner>,
    readable: Notify,
    writable: Notify,
}

struct Inner {
    buf: VecDeque<Frame>,
    capacity: usize,
    drop_when_full: bool,
    closed: bool,
    dropped: u64,
}

impl FrameQueue {
    /// Capacity is clamped to at least 1.
    pub fn new(name: &str, capacity: usize, drop_when_full: bool) -> Self {
        Self {
            name: name.to_string(),
            inner: Mutex::new(Inner {
                buf: VecDeque::with_capacity(capacity.max(1)),
                capacity: capacity.max(1),
                drop_when_full,
                closed: false,
                dropped: 0,
            }),
            readable: Notify::new(),
            writable: Notify::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Deposit a frame. Returns `false` (frame discarded) if the queue
    /// is closed. Under the blocking policy this suspends while full;
    /// under the dropping policy it always completes immediately.
    pub async fn enqueue(&self, frame: Frame) -> bool {
        loop {
            let notified = self.writable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut inner = self.inner.lock().unwrap();
                if inner.closed {
                    log::debug!("{}: enqueue on closed queue, frame dropped", self.name);
                    return false;
                }
                if inner.buf.len() < inner.capacity {
                    inner.buf.push_back(frame);
                    self.readable.notify_one();
                    return true;
                }
                if inner.drop_when_full {
                    inner.buf.pop_front();
                    inner.dropped += 1;
                    inner.buf.push_back(frame);
                    self.readable.notify_one();
                    return true;
                }
            }
            // Full under the blocking policy: wait for a dequeue or close.
            notified.await;
        }
    }

    /// Wait up to `timeout` for a frame. Returns `None` when the queue
    /// is closed and drained, or when the timeout elapses with nothing
    /// available.
    pub async fn try_dequeue(&self, timeout: Duration) -> Option<Frame> {
        tokio::time::timeout(timeout, self.dequeue())
            .await
            .unwrap_or(None)
    }

    async fn dequeue(&self) -> Option<Frame> {
        loop {
            let notified = self.readable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut inner = self.inner.lock().unwrap();
                if let Some(frame) = inner.buf.pop_front() {
                    self.writable.notify_one();
                    return Some(frame);
                }
                if inner.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Signal that no more frames will arrive. Idempotent.
    pub fn close(&self) {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.closed {
                return;
            }
            inner.closed = true;
        }
        self.readable.notify_waiters();
        self.writable.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Frames evicted by the dropping policy so far.
    pub fn dropped(&self) -> u64 {
        self.inner.lock().unwrap().dropped
    }

    /// Time span (ms) between the newest and oldest buffered frame.
    /// Observability only; 0 when fewer than two frames are buffered.
    pub fn queued_duration(&self) -> i64 {
        let inner = self.inner.lock().unwrap();
        match (inner.buf.front(), inner.buf.back()) {
            (Some(oldest), Some(newest)) => (newest.timestamp - oldest.timestamp).max(0),
            _ => 0,
        }
    }
}

#[cfg(test)]
#[path = "queue_test.rs"]
mod queue_test;
