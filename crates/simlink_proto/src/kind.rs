//! See [`MessageKind`].

use std::fmt;

use bytes::{Buf, BufMut};

/// Tag identifying what a message payload contains.
///
/// The first two bytes of every datagram payload, big-endian. The transport
/// itself only interprets the reserved kinds below; everything else is
/// routed opaquely to whichever handlers subscribed to the tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageKind(pub u16);

impl MessageKind {
    /// Number of bytes this takes up on the wire.
    pub const WIRE_LEN: usize = 2;

    /// First-contact message: binds a client's identity to the datagram's
    /// source address.
    pub const USE_CIRCUIT_CODE: MessageKind = MessageKind(1);

    /// Standalone acknowledgement block.
    pub const PACKET_ACK: MessageKind = MessageKind(2);

    /// Keepalive probe; the receiver answers with
    /// [`MessageKind::COMPLETE_PING_CHECK`].
    pub const START_PING_CHECK: MessageKind = MessageKind(3);

    /// Answer to a ping probe; consumed by the transport, never dispatched.
    pub const COMPLETE_PING_CHECK: MessageKind = MessageKind(4);

    /// Coarse avatar location update; must go out in one datagram.
    pub const COARSE_LOCATION_UPDATE: MessageKind = MessageKind(5);

    /// Group membership reply; must go out in one datagram.
    pub const GROUP_MEMBERSHIP_REPLY: MessageKind = MessageKind(6);

    /// Whether messages of this kind may be split into MTU-sized
    /// sub-messages when oversized.
    #[must_use]
    pub const fn splittable(self) -> bool {
        !matches!(
            self,
            MessageKind::COARSE_LOCATION_UPDATE | MessageKind::GROUP_MEMBERSHIP_REPLY
        )
    }

    /// Writes the tag into `dst`.
    pub fn put(self, dst: &mut impl BufMut) {
        dst.put_u16(self.0);
    }

    /// Reads a tag from the front of `src`, if there are enough bytes.
    #[must_use]
    pub fn get(src: &mut impl Buf) -> Option<Self> {
        if src.remaining() < Self::WIRE_LEN {
            return None;
        }
        Some(Self(src.get_u16()))
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            MessageKind::USE_CIRCUIT_CODE => f.write_str("use-circuit-code"),
            MessageKind::PACKET_ACK => f.write_str("packet-ack"),
            MessageKind::START_PING_CHECK => f.write_str("start-ping-check"),
            MessageKind::COMPLETE_PING_CHECK => f.write_str("complete-ping-check"),
            MessageKind::COARSE_LOCATION_UPDATE => f.write_str("coarse-location-update"),
            MessageKind::GROUP_MEMBERSHIP_REPLY => f.write_str("group-membership-reply"),
            MessageKind(other) => write!(f, "kind({other})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;

    use super::*;

    #[test]
    fn tag_round_trip() {
        let mut buf = BytesMut::new();
        MessageKind(0x1234).put(&mut buf);
        assert_eq!(&[0x12, 0x34][..], &buf[..]);

        let mut read = buf.freeze();
        assert_eq!(Some(MessageKind(0x1234)), MessageKind::get(&mut read));
    }

    #[test]
    fn short_buffer_is_none() {
        let mut buf = &[0x12][..];
        assert_eq!(None, MessageKind::get(&mut buf));
    }

    #[test]
    fn unsplittable_kinds() {
        assert!(!MessageKind::COARSE_LOCATION_UPDATE.splittable());
        assert!(!MessageKind::GROUP_MEMBERSHIP_REPLY.splittable());
        assert!(MessageKind::PACKET_ACK.splittable());
        assert!(MessageKind(1000).splittable());
    }
}
