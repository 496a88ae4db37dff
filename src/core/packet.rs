use bytes::Bytes;

use crate::core::consumer::{ConsumerId, SessionId};

/// Kind discriminator from the packet header. The engine only needs enough
/// of the header to route; everything else stays in the opaque payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Message,
    Ack,
    Control,
}

/// Routing flags carried in the packet header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketFlags {
    /// Broker paused this consumer's flow; client must request resume.
    pub flow_paused: bool,
    /// Redelivered after recover/rollback.
    pub redelivered: bool,
}

/// An inbound item as seen by the engine: a small routing header plus an
/// opaque body. Wire format and body decoding live outside this crate.
#[derive(Debug, Clone)]
pub struct Packet {
    pub kind: PacketKind,
    pub consumer_id: ConsumerId,
    pub session_id: SessionId,
    pub flags: PacketFlags,
    pub payload: Bytes,
}

impl Packet {
    pub fn message(consumer_id: ConsumerId, session_id: SessionId, payload: Bytes) -> Self {
        Self {
            kind: PacketKind::Message,
            consumer_id,
            session_id,
            flags: PacketFlags::default(),
            payload,
        }
    }
}

/// What a delivery queue actually holds: a routed packet, or the wakeup
/// sentinel used to rouse blocked readers without closing their queues
/// (connection loss is not session close).
#[derive(Debug, Clone)]
pub enum DeliveryItem {
    Packet(Packet),
    Wakeup,
}
