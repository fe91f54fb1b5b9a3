//! Datagram framing: flag byte, sequence number, extra header, zero-coded
//! payload, and the piggybacked ACK trailer.
//!
//! Wire layout of one datagram:
//!
//! | Offset     | Bytes | Meaning                                        |
//! |------------|-------|------------------------------------------------|
//! | 0          | 1     | [`Flags`]                                      |
//! | 1          | 4     | [`Seq`], big-endian                            |
//! | 5          | 1     | extra-header length `n`                        |
//! | 6          | `n`   | extra-header bytes, opaque to the transport    |
//! | 6 + `n`    | …     | payload, zero-coded when the flag bit is set   |
//! | end−(4k+1) | 4k    | `k` appended ACK seqs, big-endian, if flagged  |
//! | end−1      | 1     | ACK count `k`, if flagged                      |

use std::collections::VecDeque;

use bytes::{Buf, BufMut, Bytes};

use crate::{seq::Seq, zero, MAX_APPENDED_ACKS, MAX_BUFFER, MTU};

/// Independent flag bits in a datagram's first byte.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Flags(pub u8);

impl Flags {
    /// Payload is zero-run compressed.
    pub const ZEROCODED: Flags = Flags(0x80);
    /// Sender expects an acknowledgement for this sequence.
    pub const RELIABLE: Flags = Flags(0x40);
    /// This datagram is a retransmission; the sequence is reused.
    pub const RESENT: Flags = Flags(0x20);
    /// An ACK trailer is appended after the payload.
    pub const ACKS: Flags = Flags(0x10);

    /// Whether every bit of `other` is set in `self`.
    #[must_use]
    pub const fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns `self` with the bits of `other` set.
    #[must_use]
    pub const fn with(self, other: Flags) -> Flags {
        Flags(self.0 | other.0)
    }

    /// Returns `self` with the bits of `other` cleared.
    #[must_use]
    pub const fn without(self, other: Flags) -> Flags {
        Flags(self.0 & !other.0)
    }
}

/// Fixed-size leading portion of every datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Flag bits.
    pub flags: Flags,
    /// Sequence number of this datagram on its circuit.
    pub seq: Seq,
    /// Length of the opaque extra-header region.
    pub extra: u8,
}

/// Encoded length of a [`Header`].
pub const HEADER_LEN: usize = 6;

impl Header {
    /// Writes this header into `dst`.
    pub fn put(&self, dst: &mut impl BufMut) {
        dst.put_u8(self.flags.0);
        dst.put_u32(self.seq.0);
        dst.put_u8(self.extra);
    }
}

/// Error when parsing an inbound datagram.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    /// Datagram ends before the fixed header does.
    #[error("datagram too short for header: {len} bytes")]
    TruncatedHeader {
        /// Observed datagram length.
        len: usize,
    },
    /// The extra-header length byte points past the end of the datagram.
    #[error("extra header of {extra} bytes overruns datagram")]
    TruncatedExtra {
        /// Claimed extra-header length.
        extra: u8,
    },
    /// The ACK count byte names more trailer bytes than the datagram holds.
    #[error("ack trailer of {count} entries overruns datagram")]
    TruncatedAcks {
        /// Claimed ACK count.
        count: u8,
    },
    /// The zero-coded payload could not be expanded.
    #[error("bad zero coding")]
    Zero(#[from] zero::ZeroDecodeError),
}

/// A fully parsed inbound datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Parsed fixed header.
    pub header: Header,
    /// Opaque extra-header bytes.
    pub extra: Bytes,
    /// Payload, already zero-expanded if the datagram was zero-coded.
    pub payload: Bytes,
    /// Piggybacked ACK sequence numbers harvested from the trailer.
    pub acks: Vec<Seq>,
}

/// Parses one datagram.
///
/// The ACK trailer is stripped before zero expansion: appended ACKs are only
/// ever written on datagrams whose payload is raw, but a decoder that
/// handles both orders costs nothing.
///
/// # Errors
///
/// Errors if the datagram is truncated at any layer or carries a bad
/// zero-coded run.
pub fn decode(data: &[u8]) -> Result<Packet, WireError> {
    if data.len() < HEADER_LEN {
        return Err(WireError::TruncatedHeader { len: data.len() });
    }
    let mut buf = data;
    let flags = Flags(buf.get_u8());
    let seq = Seq(buf.get_u32());
    let extra_len = buf.get_u8();
    if buf.remaining() < usize::from(extra_len) {
        return Err(WireError::TruncatedExtra { extra: extra_len });
    }
    let extra = Bytes::copy_from_slice(&buf[..usize::from(extra_len)]);
    buf.advance(usize::from(extra_len));

    let mut body = buf;
    let mut acks = Vec::new();
    if flags.contains(Flags::ACKS) {
        let Some((&count, rest)) = body.split_last() else {
            return Err(WireError::TruncatedAcks { count: 0 });
        };
        let trailer_len = usize::from(count) * Seq::WIRE_LEN;
        if rest.len() < trailer_len {
            return Err(WireError::TruncatedAcks { count });
        }
        let (payload, mut trailer) = rest.split_at(rest.len() - trailer_len);
        acks.reserve(usize::from(count));
        for _ in 0..count {
            acks.push(Seq(trailer.get_u32()));
        }
        body = payload;
    }

    let payload = if flags.contains(Flags::ZEROCODED) {
        zero::decode(body)?
    } else {
        Bytes::copy_from_slice(body)
    };

    Ok(Packet {
        header: Header {
            flags,
            seq,
            extra: extra_len,
        },
        extra,
        payload,
        acks,
    })
}

/// Builds one datagram into `out`, which is cleared first.
///
/// `flags` carries the caller's reliable/resent bits and its *request* for
/// zero coding: if compression would push the datagram past [`MTU`] (or past
/// the raw length for payloads that are already oversized), the flag is
/// cleared and the payload goes out raw.
///
/// When `pending_acks` is `Some`, ACKs are drained from its front and
/// appended until the queue empties, [`MAX_APPENDED_ACKS`] is reached, or
/// another entry would push the datagram past [`MAX_BUFFER`]. Standalone ACK
/// messages and zero-coded datagrams must pass `None`.
///
/// Returns the flags actually written.
pub fn encode(
    out: &mut Vec<u8>,
    mut flags: Flags,
    seq: Seq,
    payload: &[u8],
    mut pending_acks: Option<&mut VecDeque<Seq>>,
) -> Flags {
    out.clear();

    let mut coded = None;
    if flags.contains(Flags::ZEROCODED) {
        let budget = MTU.max(HEADER_LEN + payload.len()) - HEADER_LEN;
        match zero::encode(payload, budget) {
            Some(bytes) => coded = Some(bytes),
            None => flags = flags.without(Flags::ZEROCODED),
        }
    }
    let body: &[u8] = coded.as_deref().unwrap_or(payload);

    if flags.contains(Flags::ZEROCODED) {
        pending_acks = None;
    }

    let mut count: usize = 0;
    if let Some(acks) = pending_acks.as_deref_mut() {
        count = acks
            .len()
            .min(MAX_APPENDED_ACKS)
            .min(MAX_BUFFER.saturating_sub(HEADER_LEN + body.len() + 1) / Seq::WIRE_LEN);
        if count > 0 {
            flags = flags.with(Flags::ACKS);
        }
    }

    out.reserve(HEADER_LEN + body.len() + count * Seq::WIRE_LEN + 1);
    Header {
        flags,
        seq,
        extra: 0,
    }
    .put(out);
    out.extend_from_slice(body);
    if count > 0 {
        let acks = pending_acks.expect("count is only nonzero with an ack queue");
        for _ in 0..count {
            let ack = acks.pop_front().expect("count is bounded by queue length");
            out.put_u32(ack.0);
        }
        out.put_u8(count as u8);
    }
    flags
}

/// Writes a standalone ACK message body: a count byte followed by that many
/// big-endian sequence numbers.
pub fn put_ack_body(dst: &mut impl BufMut, seqs: &[Seq]) {
    debug_assert!(seqs.len() <= crate::MAX_STANDALONE_ACKS);
    dst.put_u8(seqs.len() as u8);
    for seq in seqs {
        dst.put_u32(seq.0);
    }
}

/// Parses a standalone ACK message body.
///
/// # Errors
///
/// Errors if the body ends before the counted sequence numbers do.
pub fn get_ack_body(mut src: &[u8]) -> Result<Vec<Seq>, WireError> {
    if src.is_empty() {
        return Err(WireError::TruncatedAcks { count: 0 });
    }
    let count = src.get_u8();
    if src.remaining() < usize::from(count) * Seq::WIRE_LEN {
        return Err(WireError::TruncatedAcks { count });
    }
    Ok((0..count).map(|_| Seq(src.get_u32())).collect())
}

/// Writes a ping-request body: the ping id and the oldest unacked sequence,
/// which this protocol always reports as zero.
pub fn put_ping_request(dst: &mut impl BufMut, ping_id: u8) {
    dst.put_u8(ping_id);
    dst.put_u32(0);
}

/// Reads the ping id from a ping-request or ping-reply body.
#[must_use]
pub fn get_ping_id(src: &[u8]) -> Option<u8> {
    src.first().copied()
}

/// Writes a ping-reply body echoing `ping_id`.
pub fn put_ping_reply(dst: &mut impl BufMut, ping_id: u8) {
    dst.put_u8(ping_id);
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn seqs(raw: &[u32]) -> VecDeque<Seq> {
        raw.iter().copied().map(Seq).collect()
    }

    #[test]
    fn header_layout() {
        let mut out = Vec::new();
        let flags = encode(
            &mut out,
            Flags::RELIABLE,
            Seq(0x0102_0304),
            &[0xAA, 0xBB],
            None,
        );
        assert_eq!(Flags::RELIABLE, flags);
        assert_eq!(&[0x40, 0x01, 0x02, 0x03, 0x04, 0x00, 0xAA, 0xBB][..], &out[..]);
    }

    #[test]
    fn decode_round_trip() {
        let mut out = Vec::new();
        let mut acks = seqs(&[7, 9]);
        encode(&mut out, Flags::RELIABLE, Seq(42), b"hello", Some(&mut acks));
        assert!(acks.is_empty());

        let packet = decode(&out).unwrap();
        assert_eq!(Seq(42), packet.header.seq);
        assert!(packet.header.flags.contains(Flags::RELIABLE));
        assert!(packet.header.flags.contains(Flags::ACKS));
        assert_eq!(&b"hello"[..], &packet.payload[..]);
        assert_eq!(vec![Seq(7), Seq(9)], packet.acks);
    }

    #[test]
    fn zero_coding_round_trip() {
        let payload = [0u8; 100];
        let mut out = Vec::new();
        let flags = encode(&mut out, Flags::ZEROCODED, Seq(1), &payload, None);
        assert!(flags.contains(Flags::ZEROCODED));
        assert_eq!(HEADER_LEN + 2, out.len());

        let packet = decode(&out).unwrap();
        assert_eq!(&payload[..], &packet.payload[..]);
    }

    #[test]
    fn incompressible_payload_clears_zero_flag() {
        // payload of nonzero bytes filling the MTU exactly: zero coding
        // cannot shrink it, so the flag must come off and the bytes go raw
        let payload = vec![0xA5u8; MTU - HEADER_LEN];
        let mut out = Vec::new();
        let flags = encode(&mut out, Flags::ZEROCODED.with(Flags::RELIABLE), Seq(1), &payload, None);
        assert!(!flags.contains(Flags::ZEROCODED));
        assert!(flags.contains(Flags::RELIABLE));
        assert_eq!(HEADER_LEN + payload.len(), out.len());
        assert_eq!(&payload[..], &decode(&out).unwrap().payload[..]);
    }

    #[test]
    fn ack_append_respects_cap() {
        let mut acks: VecDeque<Seq> = (0..300).map(Seq).collect();
        let mut out = Vec::new();
        let flags = encode(&mut out, Flags(0), Seq(1), b"x", Some(&mut acks));
        assert!(flags.contains(Flags::ACKS));
        assert_eq!(300 - MAX_APPENDED_ACKS, acks.len());

        let packet = decode(&out).unwrap();
        assert_eq!(MAX_APPENDED_ACKS, packet.acks.len());
        assert_eq!(Seq(0), packet.acks[0]);
    }

    #[test]
    fn ack_append_respects_buffer_capacity() {
        let payload = vec![1u8; MAX_BUFFER - HEADER_LEN - 9];
        let mut acks = seqs(&[1, 2, 3, 4, 5]);
        let mut out = Vec::new();
        encode(&mut out, Flags(0), Seq(1), &payload, Some(&mut acks));
        // room for the count byte plus exactly two trailer entries
        assert_eq!(3, acks.len());
        assert!(out.len() <= MAX_BUFFER);
        assert_eq!(2, decode(&out).unwrap().acks.len());
    }

    #[test]
    fn truncated_datagrams_error() {
        assert_matches!(
            decode(&[0x40, 0, 0]),
            Err(WireError::TruncatedHeader { len: 3 })
        );
        // extra-header length byte claims 10 bytes that are not there
        assert_matches!(
            decode(&[0x00, 0, 0, 0, 1, 10]),
            Err(WireError::TruncatedExtra { extra: 10 })
        );
        // ACK flag set, count byte claims an entry with no trailer bytes
        assert_matches!(
            decode(&[0x10, 0, 0, 0, 1, 0, 1]),
            Err(WireError::TruncatedAcks { count: 1 })
        );
    }

    #[test]
    fn ack_body_round_trip() {
        let mut body = Vec::new();
        put_ack_body(&mut body, &[Seq(3), Seq(5), Seq(900)]);
        assert_eq!(vec![Seq(3), Seq(5), Seq(900)], get_ack_body(&body).unwrap());

        assert_matches!(get_ack_body(&[]), Err(WireError::TruncatedAcks { .. }));
        assert_matches!(get_ack_body(&[2, 0, 0, 0, 1]), Err(WireError::TruncatedAcks { count: 2 }));
    }

    #[test]
    fn ping_bodies() {
        let mut body = Vec::new();
        put_ping_request(&mut body, 7);
        assert_eq!(&[7, 0, 0, 0, 0][..], &body[..]);
        assert_eq!(Some(7), get_ping_id(&body));

        let mut reply = Vec::new();
        put_ping_reply(&mut reply, 7);
        assert_eq!(&[7][..], &reply[..]);
    }
}
