use std::fmt;
use std::sync::Arc;

use crate::core::packet::DeliveryItem;
use crate::core::queue::DeliveryQueue;

/// Broker-assigned interest identifier for one consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConsumerId(pub u64);

impl fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of the broker-side session owning a consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A registered interest: one consumer, its owning session, its selector,
/// and the queue inbound packets are routed into.
///
/// Created when the consumer registers with the broker; dropped when it
/// unregisters or the owning session closes.
#[derive(Debug)]
pub struct Consumer {
    pub id: ConsumerId,
    pub session: SessionId,
    pub selector: Option<String>,
    pub prefetch_limit: usize,
    pub queue: Arc<DeliveryQueue<DeliveryItem>>,
}

impl Consumer {
    pub fn new(
        id: ConsumerId,
        session: SessionId,
        selector: Option<String>,
        prefetch_limit: usize,
    ) -> Self {
        Self {
            id,
            session,
            selector,
            prefetch_limit,
            queue: Arc::new(DeliveryQueue::new()),
        }
    }
}
