//! Per-consumer delivery queue.
//!
//! A synchronized FIFO that lets one consumer thread block on a dequeue
//! and be woken when the connection reader enqueues. Supports the
//! stop/start handshake delivery pausing needs: `stop()` does not return
//! while a delivery is still in flight, so a caller that has stopped the
//! queue knows no message is mid-callback. Close is terminal and releases
//! every current and future waiter with `None`.

use std::collections::VecDeque;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

#[derive(Debug)]
struct Inner<T> {
    items: VecDeque<T>,
    /// Stopped: items are accepted but not released to waiters.
    locked: bool,
    /// Terminal. All waiters drain out with `None`.
    closed: bool,
    /// The draining thread is blocked with the queue locked, i.e. no
    /// delivery is in progress. `stop()` waits on this.
    parked: bool,
}

#[derive(Debug)]
pub struct DeliveryQueue<T> {
    inner: Mutex<Inner<T>>,
    cond: Condvar,
}

impl<T> Default for DeliveryQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> DeliveryQueue<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                locked: false,
                closed: false,
                parked: false,
            }),
            cond: Condvar::new(),
        }
    }

    /// Append an item. Wakes a blocked waiter if present. Never blocks.
    ///
    /// Broadcast, not single wake: a stop() caller may share the condvar
    /// with the dequeue waiter, and a single notify could land on it and
    /// be swallowed.
    pub fn enqueue(&self, item: T) {
        let mut g = self.inner.lock();
        g.items.push_back(item);
        drop(g);
        self.cond.notify_all();
    }

    /// Prepend an item ahead of everything already queued. Reserved for
    /// the acknowledgment/redelivery path; the only way to bypass FIFO.
    pub fn enqueue_first(&self, item: T) {
        let mut g = self.inner.lock();
        g.items.push_front(item);
        drop(g);
        self.cond.notify_all();
    }

    /// Non-blocking dequeue. Returns `None` when empty, stopped or closed.
    pub fn dequeue(&self) -> Option<T> {
        let mut g = self.inner.lock();
        if g.closed || g.locked {
            return None;
        }
        g.items.pop_front()
    }

    /// Block until an item is available, the queue is closed, or the
    /// timeout elapses. `None` timeout blocks indefinitely.
    ///
    /// While the queue is stopped this blocks even if items are present.
    /// Returns `None` exactly when the timeout elapsed without an item
    /// being released, or the queue is closed.
    pub fn dequeue_wait(&self, timeout: Option<std::time::Duration>) -> Option<T> {
        let deadline = timeout.map(|d| Instant::now() + d);
        let mut g = self.inner.lock();

        loop {
            if g.closed {
                return None;
            }

            if g.locked {
                // Signal the stop() caller that we are parked, not
                // mid-delivery.
                if !g.parked {
                    g.parked = true;
                    self.cond.notify_all();
                }
            } else if let Some(item) = g.items.pop_front() {
                // Committed to delivering this item: from here until the
                // drainer re-enters, stop() must not report the queue
                // stopped.
                g.parked = false;
                return Some(item);
            }

            match deadline {
                Some(dl) => {
                    if Instant::now() >= dl {
                        return None;
                    }
                    self.cond.wait_until(&mut g, dl);
                }
                None => self.cond.wait(&mut g),
            }
        }
    }

    /// Stop the queue and wait until no delivery is in progress.
    ///
    /// Blocks the caller until the draining thread has parked (or the
    /// queue is closed/restarted). Only use on a queue serviced by a
    /// reader loop; a queue drained by bare one-shot receives should be
    /// stopped with [`stop_no_wait`](Self::stop_no_wait).
    pub fn stop(&self) {
        let mut g = self.inner.lock();
        g.locked = true;
        self.cond.notify_all();
        while !g.closed && g.locked && !g.parked {
            self.cond.wait(&mut g);
        }
    }

    /// Stop without the handshake. Used during failover, where waiting on
    /// a reader that is itself blocked on the dying connection would
    /// deadlock.
    pub fn stop_no_wait(&self) {
        let mut g = self.inner.lock();
        g.locked = true;
        g.parked = true;
        drop(g);
        self.cond.notify_all();
    }

    /// Clear the stopped state and wake any waiter.
    pub fn start(&self) {
        let mut g = self.inner.lock();
        g.locked = false;
        g.parked = false;
        drop(g);
        self.cond.notify_all();
    }

    /// Close permanently. Releases all current and future waiters with
    /// `None`. Idempotent.
    pub fn close(&self) {
        let mut g = self.inner.lock();
        g.closed = true;
        g.locked = false;
        drop(g);
        self.cond.notify_all();
    }

    pub fn is_locked(&self) -> bool {
        self.inner.lock().locked
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().items.is_empty()
    }

    /// Drop everything queued. Used when a session recovers and all
    /// undelivered messages are discarded.
    pub fn clear(&self) {
        self.inner.lock().items.clear();
    }
}
