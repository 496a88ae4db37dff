//! Consumer interest registry.
//!
//! Maps consumer identifiers to their delivery queues so the connection
//! reader can route inbound packets, and broadcasts lifecycle operations
//! (close, wakeup) across every registered queue.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use crate::core::consumer::{Consumer, ConsumerId};
use crate::core::packet::DeliveryItem;
use crate::core::queue::DeliveryQueue;

#[derive(Debug, Default)]
pub struct ConsumerRegistry {
    consumers: DashMap<ConsumerId, Arc<Consumer>>,
}

impl ConsumerRegistry {
    pub fn new() -> Self {
        Self {
            consumers: DashMap::new(),
        }
    }

    pub fn register(&self, consumer: Arc<Consumer>) {
        debug!(id = %consumer.id, session = %consumer.session, "registering consumer interest");
        self.consumers.insert(consumer.id, consumer);
    }

    pub fn unregister(&self, id: ConsumerId) -> Option<Arc<Consumer>> {
        debug!(id = %id, "unregistering consumer interest");
        self.consumers.remove(&id).map(|(_, c)| c)
    }

    pub fn lookup(&self, id: ConsumerId) -> Option<Arc<Consumer>> {
        self.consumers.get(&id).map(|e| Arc::clone(&*e))
    }

    pub fn queue_of(&self, id: ConsumerId) -> Option<Arc<DeliveryQueue<DeliveryItem>>> {
        self.consumers.get(&id).map(|e| Arc::clone(&e.queue))
    }

    pub fn len(&self) -> usize {
        self.consumers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.consumers.is_empty()
    }

    pub fn for_each(&self, mut f: impl FnMut(&Consumer)) {
        for entry in self.consumers.iter() {
            f(&entry);
        }
    }

    /// Close every registered queue. Terminal: used on connection close.
    pub fn close_all(&self) {
        for entry in self.consumers.iter() {
            entry.queue.close();
        }
    }

    /// Enqueue a wakeup sentinel into every queue. Rouses all blocked
    /// readers without closing anything, so an induced wake-up (connection
    /// loss, failover) stays distinguishable from clean shutdown.
    pub fn notify_all(&self) {
        for entry in self.consumers.iter() {
            entry.queue.enqueue(DeliveryItem::Wakeup);
        }
    }
}
