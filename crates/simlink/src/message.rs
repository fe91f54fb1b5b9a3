//! Message types crossing the transport boundary.

use std::{
    sync::{Arc, Weak},
    time::Instant,
};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use simlink_proto::{
    category::Category,
    kind::MessageKind,
    packet::HEADER_LEN,
    seq::Seq,
};
use uuid::Uuid;

use crate::circuit::Circuit;

/// An upper-layer message to be transmitted on a circuit.
#[derive(Debug, Clone)]
pub struct Message {
    /// What the payload contains; routes the message on the receiving side.
    pub kind: MessageKind,
    /// Payload body, not including the kind tag.
    pub body: Bytes,
    /// Whether delivery must be acknowledged and retried.
    pub reliable: bool,
    /// Whether the payload should be zero-run compressed on the wire.
    pub zerocoded: bool,
}

impl Message {
    /// Creates a reliable message.
    #[must_use]
    pub fn reliable(kind: MessageKind, body: impl Into<Bytes>) -> Self {
        Self {
            kind,
            body: body.into(),
            reliable: true,
            zerocoded: false,
        }
    }

    /// Creates a fire-and-forget message.
    #[must_use]
    pub fn unreliable(kind: MessageKind, body: impl Into<Bytes>) -> Self {
        Self {
            kind,
            body: body.into(),
            reliable: false,
            zerocoded: false,
        }
    }

    /// Requests zero-run compression of the payload.
    #[must_use]
    pub fn zerocoded(mut self) -> Self {
        self.zerocoded = true;
        self
    }
}

/// A message accepted by `send` and owned by exactly one place at a time:
/// a category queue, a category's held next-slot, the retransmission
/// archive, or the in-flight send path.
#[derive(Debug)]
pub(crate) struct OutboundMessage {
    /// Kind tag plus body, as it will appear in the datagram payload.
    pub payload: Bytes,
    pub kind: MessageKind,
    /// Current traffic category; retransmissions are reclassified to
    /// [`Category::Resend`].
    pub category: Category,
    pub reliable: bool,
    pub zerocoded: bool,
    /// Sequence assigned at first transmission; resends reuse it.
    pub seq: Option<Seq>,
    /// How many times this message has been retransmitted.
    pub resends: u32,
    /// Circuit this message belongs to. Send paths resolve through this, so
    /// a message that outlives its circuit degrades to a no-op.
    pub circuit: Weak<Circuit>,
}

impl OutboundMessage {
    pub fn new(
        kind: MessageKind,
        body: &[u8],
        category: Category,
        reliable: bool,
        zerocoded: bool,
        circuit: &Arc<Circuit>,
    ) -> Self {
        let mut payload = BytesMut::with_capacity(MessageKind::WIRE_LEN + body.len());
        kind.put(&mut payload);
        payload.extend_from_slice(body);
        Self {
            payload: payload.freeze(),
            kind,
            category,
            reliable,
            zerocoded,
            seq: None,
            resends: 0,
            circuit: Arc::downgrade(circuit),
        }
    }

    /// Wire length used for token charging: header plus payload, without
    /// whatever ACK trailer happens to ride along.
    pub fn wire_len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }
}

/// A decoded inbound message on its way to subscribed handlers.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Circuit the datagram arrived on.
    pub circuit: Arc<Circuit>,
    /// Kind tag from the front of the payload.
    pub kind: MessageKind,
    /// Payload body after the kind tag.
    pub body: Bytes,
    /// When the datagram was pulled off the socket.
    pub received_at: Instant,
}

/// Body of a use-circuit-code message: the first-contact handshake binding
/// a verified session to a source address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitHello {
    /// Circuit code issued to the client out of band.
    pub code: u32,
    /// Verified session identifier.
    pub session_id: Uuid,
    /// Agent identity.
    pub agent_id: Uuid,
}

impl CircuitHello {
    /// Encoded body length.
    pub const WIRE_LEN: usize = 4 + 16 + 16;

    /// Writes this body into `dst`.
    pub fn put(&self, dst: &mut impl BufMut) {
        dst.put_u32(self.code);
        dst.put_slice(self.session_id.as_bytes());
        dst.put_slice(self.agent_id.as_bytes());
    }

    /// Parses a body, if it is long enough.
    #[must_use]
    pub fn get(mut src: &[u8]) -> Option<Self> {
        if src.remaining() < Self::WIRE_LEN {
            return None;
        }
        let code = src.get_u32();
        let mut id = [0u8; 16];
        src.copy_to_slice(&mut id);
        let session_id = Uuid::from_bytes(id);
        src.copy_to_slice(&mut id);
        let agent_id = Uuid::from_bytes(id);
        Some(Self {
            code,
            session_id,
            agent_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hello_round_trip() {
        let hello = CircuitHello {
            code: 0xDEAD_BEEF,
            session_id: Uuid::new_v4(),
            agent_id: Uuid::new_v4(),
        };
        let mut body = Vec::new();
        hello.put(&mut body);
        assert_eq!(CircuitHello::WIRE_LEN, body.len());
        assert_eq!(Some(hello), CircuitHello::get(&body));
    }

    #[test]
    fn short_hello_is_none() {
        assert_eq!(None, CircuitHello::get(&[0u8; 10]));
    }
}
