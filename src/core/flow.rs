//! Prefetch credit tracking and resume-flow scheduling.
//!
//! The broker stops sending to a consumer once its prefetch window is
//! exhausted; the client asks it to resume by sending a resume-flow
//! request with fresh credit. Every connection owns one `FlowManager`
//! with one background thread, so congestion in one connection never
//! interferes with another. Entries are keyed by consumer id.
//!
//! Delivery policy:
//!  * `prefetch_limit == 1` – resume after every delivered message.
//!  * `prefetch_limit > 1`  – a batch of `min(queue_depth + 1, limit)` is
//!    sized once at batch start and counted down per delivery; the
//!    countdown reaching zero schedules a single resume request. This
//!    bounds round trips without ever exceeding the prefetch ceiling,
//!    and resizing from live depth keeps a consumer sharing a broker
//!    session pool from being starved by a fixed window.
//!
//! A resume request that fails to send is never fatal: the entry stays
//! ready and the next evaluation retries it.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::core::consumer::ConsumerId;
use crate::core::error::WireError;

/// Outbound side of flow control, implemented over the connection's
/// protocol layer.
pub trait ResumeSink: Send + Sync {
    fn resume_flow(&self, id: ConsumerId, credit: usize) -> Result<(), WireError>;
    /// Keep-alive sent when the connection has been idle for a full
    /// ping interval.
    fn ping(&self) -> Result<(), WireError>;
}

#[derive(Debug)]
struct FlowEntry {
    prefetch_limit: usize,
    /// Messages routed in from the broker since the last resume.
    received_since_resume: usize,
    /// Received but not yet delivered to the application.
    in_queue: usize,
    /// Countdown of the current delivery batch; 0 = no active batch.
    batch_remaining: usize,
}

impl FlowEntry {
    fn new(prefetch_limit: usize) -> Self {
        Self {
            prefetch_limit,
            received_since_resume: 0,
            in_queue: 0,
            batch_remaining: 0,
        }
    }
}

enum FlowEvent {
    Evaluate,
    Shutdown,
}

pub struct FlowManager {
    sink: Arc<dyn ResumeSink>,
    entries: Mutex<HashMap<ConsumerId, FlowEntry>>,
    /// Entries with a resume request due. Survives failed sends.
    ready: Mutex<HashSet<ConsumerId>>,
    tx: flume::Sender<FlowEvent>,
    rx: flume::Receiver<FlowEvent>,
    ping_interval: Duration,
}

impl FlowManager {
    pub fn new(sink: Arc<dyn ResumeSink>, ping_interval: Duration) -> Self {
        let (tx, rx) = flume::unbounded();
        Self {
            sink,
            entries: Mutex::new(HashMap::new()),
            ready: Mutex::new(HashSet::new()),
            tx,
            rx,
            ping_interval,
        }
    }

    pub fn register(&self, id: ConsumerId, prefetch_limit: usize) {
        self.entries.lock().insert(id, FlowEntry::new(prefetch_limit));
    }

    pub fn unregister(&self, id: ConsumerId) {
        self.entries.lock().remove(&id);
        self.ready.lock().remove(&id);
    }

    /// A packet for this consumer was routed into its delivery queue.
    pub fn message_received(&self, id: ConsumerId) {
        let mut entries = self.entries.lock();
        if let Some(e) = entries.get_mut(&id) {
            e.in_queue += 1;
            if e.received_since_resume < e.prefetch_limit {
                e.received_since_resume += 1;
            }
        }
    }

    /// A message was handed to the application callback. `queue_depth` is
    /// the number of items still queued when this one was taken; it sizes
    /// a new batch when none is active.
    pub fn message_delivered(&self, id: ConsumerId, queue_depth: usize) {
        let mut schedule = false;
        {
            let mut entries = self.entries.lock();
            let Some(e) = entries.get_mut(&id) else { return };
            e.in_queue = e.in_queue.saturating_sub(1);

            if e.prefetch_limit <= 1 {
                schedule = true;
            } else {
                if e.batch_remaining == 0 {
                    e.batch_remaining = (queue_depth + 1).min(e.prefetch_limit);
                }
                e.batch_remaining -= 1;
                if e.batch_remaining == 0 {
                    schedule = true;
                }
            }
        }
        if schedule {
            self.mark_ready(id);
        }
    }

    /// The broker flagged this consumer's flow as paused; schedule a
    /// resume regardless of batch state.
    pub fn request_resume(&self, id: ConsumerId) {
        debug!(id = %id, "broker paused delivery, scheduling resume");
        self.mark_ready(id);
    }

    fn mark_ready(&self, id: ConsumerId) {
        self.ready.lock().insert(id);
        let _ = self.tx.send(FlowEvent::Evaluate);
    }

    /// Flow-control evaluation point: send a resume request for every
    /// ready entry. Failed sends are logged and left ready so the next
    /// evaluation retries them.
    pub fn evaluate(&self) {
        let due: Vec<ConsumerId> = self.ready.lock().iter().copied().collect();

        for id in due {
            let credit = {
                let entries = self.entries.lock();
                let Some(e) = entries.get(&id) else {
                    self.ready.lock().remove(&id);
                    continue;
                };
                let credit = e.prefetch_limit.saturating_sub(e.in_queue);
                if e.prefetch_limit > 0 && credit == 0 {
                    // window still full; nothing to resume yet
                    self.ready.lock().remove(&id);
                    continue;
                }
                credit
            };

            match self.sink.resume_flow(id, credit) {
                Ok(()) => {
                    self.ready.lock().remove(&id);
                    if let Some(e) = self.entries.lock().get_mut(&id) {
                        e.received_since_resume = 0;
                    }
                    debug!(id = %id, credit, "resume flow sent");
                }
                Err(e) => {
                    warn!(id = %id, error = %e, "resume flow send failed, will retry");
                }
            }
        }
    }

    /// Spawn the per-connection flow thread. Exits when [`close`](Self::close)
    /// is called. Pings the broker when a full interval passes idle.
    pub fn start(self: Arc<Self>, thread_label: String) -> std::thread::JoinHandle<()> {
        std::thread::Builder::new()
            .name(format!("wiremq-flow-{thread_label}"))
            .spawn(move || self.run())
            .expect("flow thread spawn")
    }

    fn run(&self) {
        loop {
            match self.rx.recv_timeout(self.ping_interval) {
                Ok(FlowEvent::Evaluate) => self.evaluate(),
                Ok(FlowEvent::Shutdown) | Err(flume::RecvTimeoutError::Disconnected) => break,
                Err(flume::RecvTimeoutError::Timeout) => {
                    // idle: retry anything still pending, then keep-alive
                    self.evaluate();
                    if let Err(e) = self.sink.ping() {
                        debug!(error = %e, "ping failed");
                    }
                }
            }
        }
    }

    pub fn close(&self) {
        let _ = self.tx.send(FlowEvent::Shutdown);
    }

    #[cfg(test)]
    fn is_ready(&self, id: ConsumerId) -> bool {
        self.ready.lock().contains(&id)
    }
}
