//! See [`UnackedArchive`].

use std::{
    collections::BTreeMap,
    time::{Duration, Instant},
};

use crate::seq::Seq;

/// One in-flight reliable message.
#[derive(Debug)]
struct Entry<T> {
    item: T,
    /// Wire length, for the circuit's unacked-bytes accounting.
    len: usize,
    /// When the datagram last hit the socket.
    sent_at: Instant,
    /// Whether this sequence has ever been retransmitted.
    resent: bool,
}

/// Tracks reliable messages which have been transmitted but not yet
/// acknowledged, keyed by sequence number.
///
/// Iteration runs in sequence order, which matches assignment order. Expiry
/// scans still walk the whole archive: a resent entry's clock restarts, so
/// age is not monotonic in sequence. The archive stays small in practice,
/// bounded by the peer's acknowledgement latency.
#[derive(Debug, Default)]
pub struct UnackedArchive<T> {
    entries: BTreeMap<Seq, Entry<T>>,
    bytes: usize,
}

/// Outcome of acknowledging one sequence.
#[derive(Debug)]
pub struct Acked<T> {
    /// The stored message, surrendered back to the caller.
    pub item: T,
    /// Round-trip sample from send to acknowledgement, present only when
    /// the message was never resent (Karn's rule).
    pub sample: Option<Duration>,
}

impl<T> UnackedArchive<T> {
    /// Creates an empty archive.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            bytes: 0,
        }
    }

    /// Number of in-flight messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is in flight.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total wire bytes awaiting acknowledgement.
    #[must_use]
    pub fn unacked_bytes(&self) -> usize {
        self.bytes
    }

    /// Records a transmission. `resent` restarts an existing entry's clock
    /// instead of inserting.
    pub fn insert(&mut self, seq: Seq, item: T, len: usize, now: Instant) {
        self.bytes += len;
        self.entries.insert(
            seq,
            Entry {
                item,
                len,
                sent_at: now,
                resent: false,
            },
        );
    }

    /// Acknowledges one sequence, yielding the stored message and an RTT
    /// sample when one may legally be taken.
    pub fn ack(&mut self, seq: Seq, now: Instant) -> Option<Acked<T>> {
        let entry = self.entries.remove(&seq)?;
        self.bytes -= entry.len;
        let sample = (!entry.resent).then(|| now.saturating_duration_since(entry.sent_at));
        Some(Acked {
            item: entry.item,
            sample,
        })
    }

    /// Sequences whose elapsed time since last send has reached `rto`.
    #[must_use]
    pub fn expired(&self, rto: Duration, now: Instant) -> Vec<Seq> {
        self.entries
            .iter()
            .filter(|(_, entry)| now.saturating_duration_since(entry.sent_at) >= rto)
            .map(|(seq, _)| *seq)
            .collect()
    }

    /// Whether any entry has waited at least `limit` since its last send,
    /// the signal that the peer is gone and the circuit should die.
    #[must_use]
    pub fn has_older_than(&self, limit: Duration, now: Instant) -> bool {
        self.entries
            .values()
            .any(|entry| now.saturating_duration_since(entry.sent_at) >= limit)
    }

    /// Takes an entry back out for retransmission. The caller re-inserts it
    /// via [`mark_resent`](Self::mark_resent) once it is sent again.
    pub fn take(&mut self, seq: Seq) -> Option<T> {
        let entry = self.entries.remove(&seq)?;
        self.bytes -= entry.len;
        Some(entry.item)
    }

    /// Records a retransmission of `seq`: the clock restarts and the entry
    /// is permanently disqualified from RTT sampling.
    pub fn mark_resent(&mut self, seq: Seq, item: T, len: usize, now: Instant) {
        self.bytes += len;
        self.entries.insert(
            seq,
            Entry {
                item,
                len,
                sent_at: now,
                resent: true,
            },
        );
    }

    /// Drops everything, returning the stored messages.
    pub fn clear(&mut self) -> Vec<T> {
        self.bytes = 0;
        std::mem::take(&mut self.entries)
            .into_values()
            .map(|entry| entry.item)
            .collect()
    }
}
