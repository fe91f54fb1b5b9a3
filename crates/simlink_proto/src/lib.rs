//! Sans-IO protocol implementation for the simlink circuit transport.
//!
//! This crate holds the pieces of the protocol which have no opinion on
//! sockets or threads: the datagram wire codec, the zero-run payload coding,
//! the hierarchical token bucket used for bandwidth fairness, the RTT
//! estimator driving retransmission timeouts, and the send/receive archives
//! which implement selective acknowledgement and duplicate suppression.
//!
//! The server transport in the `simlink` crate composes these per circuit.
//! Everything here is deterministic: operations that depend on time take an
//! [`Instant`](std::time::Instant) from the caller.

use std::time::Duration;

use static_assertions::const_assert;

pub mod bucket;
pub mod category;
pub mod dedup;
pub mod kind;
pub mod packet;
pub mod rtt;
pub mod seq;
pub mod unacked;
pub mod zero;

/// Largest datagram payload the transport will emit in a single wire packet,
/// header included, unless an unsplittable message forces it higher.
pub const MTU: usize = 1400;

/// Capacity of a pooled datagram buffer, and the hard cap on a single
/// datagram including any appended ACK trailer.
pub const MAX_BUFFER: usize = 4096;

/// Most ACK sequence numbers that may ride piggybacked on one datagram.
pub const MAX_APPENDED_ACKS: usize = 250;

/// Most sequence numbers carried by one standalone ACK message.
pub const MAX_STANDALONE_ACKS: usize = 255;

/// Retransmission timeout before any RTT sample has been taken.
pub const DEFAULT_RTO: Duration = Duration::from_millis(3000);

/// Upper bound on the retransmission timeout; an unacknowledged message
/// older than this condemns its circuit.
pub const MAX_RTO: Duration = Duration::from_millis(60_000);

/// How many recently received reliable sequence numbers are remembered for
/// duplicate suppression.
pub const DUPLICATE_DEPTH: usize = 200;

/// A circuit which has not received a single datagram for this long is
/// considered dead and torn down.
pub const AGENT_TIMEOUT: Duration = Duration::from_millis(60_000);

const_assert!(MTU <= MAX_BUFFER);
const_assert!(MAX_APPENDED_ACKS * 4 + 1 < MAX_BUFFER);
