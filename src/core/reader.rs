//! Background delivery pumps.
//!
//! One `DeliveryReader` drains one delivery queue and invokes the
//! consumer callback. Message decoding lives behind [`PacketHandler`]:
//! the engine never inspects payloads. A handler failure (malformed
//! item) closes that queue only, leaving the shared connection up, and
//! is reported through the session error hook.
//!
//! For connection consumers serving a server-session pool, a shared
//! [`BatchGate`] counts down the current load and triggers the next
//! server-session activation when the batch is exhausted.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error};

use crate::core::consumer::Consumer;
use crate::core::error::WireError;
use crate::core::flow::FlowManager;
use crate::core::packet::{DeliveryItem, Packet};

/// Consumer-side handler: decodes the opaque item and runs the
/// application callback. Both stay outside the engine.
pub trait PacketHandler: Send {
    fn on_packet(&mut self, packet: Packet) -> Result<(), WireError>;
    /// Idle hook, invoked when a wakeup sentinel drains through (e.g. on
    /// connection loss) so idle consumers can react without a message.
    fn on_wakeup(&mut self);
}

/// Server-session load counter shared by the readers of one connection
/// consumer. Sized once per batch from live queue depth, capped at
/// `max_messages`; exhaustion fires the activation hook.
pub struct BatchGate {
    max_messages: usize,
    remaining: Mutex<usize>,
    activate: Box<dyn Fn() + Send + Sync>,
}

impl BatchGate {
    pub fn new(max_messages: usize, activate: Box<dyn Fn() + Send + Sync>) -> Self {
        Self {
            max_messages: max_messages.max(1),
            remaining: Mutex::new(0),
            activate,
        }
    }

    /// Count one delivery against the current batch, starting a new batch
    /// from `queue_depth` when none is active. Returns true when this
    /// delivery exhausted the batch.
    pub fn delivered(&self, queue_depth: usize) -> bool {
        let exhausted = {
            let mut rem = self.remaining.lock();
            if *rem == 0 {
                *rem = (queue_depth + 1).min(self.max_messages);
            }
            *rem -= 1;
            *rem == 0
        };
        if exhausted {
            (self.activate)();
        }
        exhausted
    }
}

pub struct DeliveryReader {
    consumer: Arc<Consumer>,
    flow: Arc<FlowManager>,
    handler: Box<dyn PacketHandler>,
    batch: Option<Arc<BatchGate>>,
    on_error: Box<dyn Fn(WireError) + Send>,
}

impl DeliveryReader {
    pub fn new(
        consumer: Arc<Consumer>,
        flow: Arc<FlowManager>,
        handler: Box<dyn PacketHandler>,
        on_error: Box<dyn Fn(WireError) + Send>,
    ) -> Self {
        Self {
            consumer,
            flow,
            handler,
            batch: None,
            on_error,
        }
    }

    /// Attach the shared batch gate of a connection consumer.
    pub fn with_batch_gate(mut self, gate: Arc<BatchGate>) -> Self {
        self.batch = Some(gate);
        self
    }

    /// Spawn the pump thread. Exits when the queue closes.
    pub fn start(self) -> std::thread::JoinHandle<()> {
        let label = format!("wiremq-reader-{}", self.consumer.id);
        std::thread::Builder::new()
            .name(label)
            .spawn(move || self.run())
            .expect("reader thread spawn")
    }

    fn run(mut self) {
        let queue = Arc::clone(&self.consumer.queue);
        loop {
            let Some(item) = queue.dequeue_wait(None) else {
                // queue closed
                debug!(id = %self.consumer.id, "delivery reader exiting");
                break;
            };

            match item {
                DeliveryItem::Wakeup => {
                    self.handler.on_wakeup();
                    if queue.is_closed() {
                        break;
                    }
                }
                DeliveryItem::Packet(packet) => {
                    let depth = queue.len();
                    if let Err(e) = self.handler.on_packet(packet) {
                        // Decode failure ends this session's delivery, not
                        // the shared connection.
                        error!(id = %self.consumer.id, error = %e, "packet handler failed, closing queue");
                        queue.close();
                        (self.on_error)(e);
                        break;
                    }
                    self.flow.message_delivered(self.consumer.id, depth);
                    if let Some(gate) = &self.batch {
                        gate.delivered(depth);
                    }
                }
            }
        }
    }
}
