//! Session-facing delivery facade.
//!
//! One `DeliveryEngine` per connection. The connection's read pump hands
//! every inbound packet to [`DeliveryEngine::dispatch`], which routes it
//! into the owning consumer's queue and feeds the flow-control counters.
//! Sessions drive the other side: register interests, receive
//! synchronously or attach a background reader, pause/resume delivery,
//! and tear down.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::core::consumer::{Consumer, ConsumerId, SessionId};
use crate::core::error::WireError;
use crate::core::flow::{FlowManager, ResumeSink};
use crate::core::packet::{DeliveryItem, Packet};
use crate::core::reader::{BatchGate, DeliveryReader, PacketHandler};
use crate::core::registry::ConsumerRegistry;
use crate::link::BrokerLink;

/// Handle returned from consumer registration; everything a session
/// needs to receive from or manage one consumer.
pub type ConsumerHandle = Arc<Consumer>;

pub struct DeliveryEngine {
    registry: Arc<ConsumerRegistry>,
    flow: Arc<FlowManager>,
    local_id: Uuid,
}

impl DeliveryEngine {
    pub fn new(sink: Arc<dyn ResumeSink>, ping_interval: Duration) -> Self {
        Self {
            registry: Arc::new(ConsumerRegistry::new()),
            flow: Arc::new(FlowManager::new(sink, ping_interval)),
            local_id: Uuid::new_v4(),
        }
    }

    pub fn local_id(&self) -> Uuid {
        self.local_id
    }

    pub fn registry(&self) -> &Arc<ConsumerRegistry> {
        &self.registry
    }

    pub fn flow(&self) -> &Arc<FlowManager> {
        &self.flow
    }

    /// Spawn the per-connection flow-control thread.
    pub fn start(&self) -> std::thread::JoinHandle<()> {
        Arc::clone(&self.flow).start(self.local_id.to_string())
    }

    /// Register a consumer interest and create its delivery queue.
    pub fn register_consumer(
        &self,
        id: ConsumerId,
        session: SessionId,
        selector: Option<String>,
        prefetch_limit: usize,
    ) -> ConsumerHandle {
        let consumer = Arc::new(Consumer::new(id, session, selector, prefetch_limit));
        self.flow.register(id, prefetch_limit);
        self.registry.register(Arc::clone(&consumer));
        consumer
    }

    /// Remove an interest and close its queue.
    pub fn unregister_consumer(&self, id: ConsumerId) {
        if let Some(consumer) = self.registry.unregister(id) {
            consumer.queue.close();
        }
        self.flow.unregister(id);
    }

    /// Synchronous receive. Returns `Ok(None)` on timeout, queue close,
    /// or an induced wakeup (the caller re-checks connection state).
    pub fn receive(
        &self,
        handle: &ConsumerHandle,
        timeout: Option<Duration>,
    ) -> Result<Option<Packet>, WireError> {
        match handle.queue.dequeue_wait(timeout) {
            Some(DeliveryItem::Packet(packet)) => {
                self.flow.message_delivered(handle.id, handle.queue.len());
                Ok(Some(packet))
            }
            Some(DeliveryItem::Wakeup) | None => Ok(None),
        }
    }

    /// Attach a background reader that drains this consumer's queue and
    /// invokes `handler`. Handler failure closes the queue and fires
    /// `on_error` for the owning session.
    pub fn start_reader(
        &self,
        handle: &ConsumerHandle,
        handler: Box<dyn PacketHandler>,
        on_error: Box<dyn Fn(WireError) + Send>,
    ) -> std::thread::JoinHandle<()> {
        DeliveryReader::new(
            Arc::clone(handle),
            Arc::clone(&self.flow),
            handler,
            on_error,
        )
        .start()
    }

    /// Reader variant for connection consumers sharing a server-session
    /// pool: deliveries count against `gate`'s current batch.
    pub fn start_batched_reader(
        &self,
        handle: &ConsumerHandle,
        handler: Box<dyn PacketHandler>,
        gate: Arc<BatchGate>,
        on_error: Box<dyn Fn(WireError) + Send>,
    ) -> std::thread::JoinHandle<()> {
        DeliveryReader::new(
            Arc::clone(handle),
            Arc::clone(&self.flow),
            handler,
            on_error,
        )
        .with_batch_gate(gate)
        .start()
    }

    /// Pause delivery with the full handshake: does not return while a
    /// delivery is mid-callback.
    pub fn stop_delivery(&self, handle: &ConsumerHandle) {
        handle.queue.stop();
    }

    /// Pause without waiting. Used during failover where the reader may
    /// itself be blocked on the dying connection.
    pub fn stop_delivery_no_wait(&self, handle: &ConsumerHandle) {
        handle.queue.stop_no_wait();
    }

    pub fn start_delivery(&self, handle: &ConsumerHandle) {
        handle.queue.start();
    }

    /// Route one inbound packet into its consumer's queue.
    ///
    /// Unknown consumer ids are dropped quietly (the interest raced with
    /// an unregister). A packet flagged flow-paused also schedules a
    /// resume request.
    pub fn dispatch(&self, packet: Packet) {
        let id = packet.consumer_id;

        if packet.flags.flow_paused {
            self.flow.request_resume(id);
        }

        match self.registry.queue_of(id) {
            Some(queue) if !queue.is_closed() => {
                queue.enqueue(DeliveryItem::Packet(packet));
                self.flow.message_received(id);
            }
            Some(_) => debug!(id = %id, "queue closed, dropping packet"),
            None => debug!(id = %id, "no interest registered, dropping packet"),
        }
    }

    /// Re-inject a message ahead of everything queued. Reserved for the
    /// acknowledgment/retry path, where a recovered message must be seen
    /// again before anything newer.
    pub fn redeliver_first(&self, handle: &ConsumerHandle, mut packet: Packet) {
        packet.flags.redelivered = true;
        handle.queue.enqueue_first(DeliveryItem::Packet(packet));
    }

    /// Connection lost: wake every blocked reader with a sentinel, but
    /// leave the queues open so failover can resume them.
    pub fn connection_dropped(&self) {
        info!(local_id = %self.local_id, "connection dropped, waking all readers");
        self.registry.notify_all();
    }

    /// Terminal shutdown: close every queue and stop the flow thread.
    pub fn shutdown(&self) {
        self.registry.close_all();
        self.flow.close();
    }
}

/// The dedicated pump pulling raw packets off the broker link and
/// fanning them into delivery queues. One per connection.
pub struct LinkReader {
    engine: Arc<DeliveryEngine>,
    link: Box<dyn BrokerLink>,
}

impl LinkReader {
    pub fn new(engine: Arc<DeliveryEngine>, link: Box<dyn BrokerLink>) -> Self {
        Self { engine, link }
    }

    pub fn start(self) -> std::thread::JoinHandle<()> {
        let label = format!("wiremq-read-{}", self.engine.local_id());
        std::thread::Builder::new()
            .name(label)
            .spawn(move || self.run())
            .expect("read pump spawn")
    }

    fn run(mut self) {
        loop {
            match self.link.read_packet() {
                Ok(packet) => self.engine.dispatch(packet),
                Err(e) => {
                    warn!(error = %e, "broker link read failed");
                    self.engine.connection_dropped();
                    break;
                }
            }
        }
    }
}
