//! The sender tick: one dedicated thread coordinating retransmission,
//! acknowledgement flushing, pings, bucket-gated queue draining, and
//! queue-empty back-pressure signalling.

use std::{
    sync::{atomic::Ordering, Arc},
    time::{Duration, Instant},
};

use simlink_proto::{
    category::Category,
    kind::MessageKind,
    packet,
    seq::Seq,
    AGENT_TIMEOUT, MAX_STANDALONE_ACKS,
};

use crate::{
    circuit::{CategorySet, Circuit},
    server::{teardown, Inner},
};

/// How often expired reliable messages are retransmitted.
const RESEND_INTERVAL: Duration = Duration::from_millis(100);
/// How often pending ACKs are flushed as a standalone block if no outbound
/// traffic has piggybacked them.
const ACK_INTERVAL: Duration = Duration::from_millis(500);
/// How often each circuit is pinged.
const PING_INTERVAL: Duration = Duration::from_millis(5000);
/// Minimum spacing between queue-empty notifications per circuit.
const EMPTY_NOTIFY_INTERVAL: Duration = Duration::from_millis(30);
/// Bounded wait on the inbound mailbox when nothing was sent this tick.
const TICK_WAIT: Duration = Duration::from_millis(20);
/// Bounded wait when there are no circuits at all.
const IDLE_WAIT: Duration = Duration::from_millis(500);

struct Phases {
    resend_acc: Duration,
    ack_acc: Duration,
    ping_acc: Duration,
}

impl Phases {
    fn new() -> Self {
        Self {
            resend_acc: Duration::ZERO,
            ack_acc: Duration::ZERO,
            ping_acc: Duration::ZERO,
        }
    }

    /// Advances the three software timers and reports which phases fire
    /// this tick.
    fn advance(&mut self, elapsed: Duration) -> (bool, bool, bool) {
        self.resend_acc += elapsed;
        self.ack_acc += elapsed;
        self.ping_acc += elapsed;
        let resend = self.resend_acc >= RESEND_INTERVAL;
        if resend {
            self.resend_acc = Duration::ZERO;
        }
        let ack = self.ack_acc >= ACK_INTERVAL;
        if ack {
            self.ack_acc = Duration::ZERO;
        }
        let ping = self.ping_acc >= PING_INTERVAL;
        if ping {
            self.ping_acc = Duration::ZERO;
        }
        (resend, ack, ping)
    }
}

/// Sender loop body. Runs until the transport stops.
pub(crate) fn run(inner: &Arc<Inner>) {
    let mut phases = Phases::new();
    let mut last = Instant::now();
    while inner.running.load(Ordering::Acquire) {
        let now = Instant::now();
        let (resend_due, ack_due, ping_due) = phases.advance(now - last);
        last = now;

        let circuits = inner.registry.snapshot();
        let mut sent_any = false;
        for circuit in &circuits {
            if !circuit.is_connected() {
                continue;
            }
            if resend_due && !resend_phase(inner, circuit, now, &mut sent_any) {
                // circuit died in the resend phase
                continue;
            }
            if circuit.remote().is_none() {
                // admitted but not yet heard from: everything stays queued
                // until first contact binds an address
                continue;
            }
            if ack_due {
                flush_acks(inner, circuit, now, &mut sent_any);
            }
            if ping_due {
                send_ping(inner, circuit, now);
                sent_any = true;
            }
            let drained = drain_queues(inner, circuit, now, &mut sent_any);
            notify_empty(inner, circuit, drained, now);
        }

        // bounded-wait ingestion: drain one mailbox entry, blocking only
        // when this tick pushed nothing out
        let received = if sent_any {
            inner.mailbox_rx.try_recv().ok()
        } else {
            let wait = if circuits.is_empty() { IDLE_WAIT } else { TICK_WAIT };
            inner.mailbox_rx.recv_timeout(wait).ok()
        };
        if let Some(message) = received {
            inner.dispatcher.deliver(message);
        }
    }
}

/// Dead-client checks and RTO-expired retransmission for one circuit.
/// Returns `false` if the circuit was torn down.
fn resend_phase(inner: &Arc<Inner>, circuit: &Arc<Circuit>, now: Instant, sent_any: &mut bool) -> bool {
    if circuit.last_recv_age(now) >= AGENT_TIMEOUT {
        teardown(inner, circuit, "no traffic within the agent timeout");
        return false;
    }

    let max_rto = inner.config.max_rto();
    let rto = circuit.rto();
    let expired = {
        let unacked = circuit.unacked.lock().unwrap();
        if unacked.has_older_than(max_rto, now) {
            drop(unacked);
            teardown(inner, circuit, "reliable message unacknowledged past max RTO");
            return false;
        }
        unacked.expired(rto, now)
    };
    if expired.is_empty() {
        return true;
    }

    // one backoff per circuit per phase, however many messages timed out
    circuit.rtt.lock().unwrap().backoff();
    tracing::debug!(
        agent = %circuit.agent_id(),
        count = expired.len(),
        rto_ms = circuit.rto().as_millis() as u64,
        "retransmitting expired reliable messages"
    );

    for seq in expired {
        let Some(mut msg) = circuit.unacked.lock().unwrap().take(seq) else {
            continue;
        };
        msg.resends += 1;
        msg.category = Category::Resend;
        circuit.stats_ref().add_resend();
        inner.stats.add_resend();

        let queue = circuit.queue(Category::Resend);
        if queue.backlog() == 0 && queue.bucket.remove(msg.wire_len() as u64, now) {
            inner.transmit(msg, now);
            *sent_any = true;
        } else {
            let _ = queue.tx.send(msg);
        }
    }
    true
}

/// Sends pending ACKs as a standalone block if piggybacking has not drained
/// them.
fn flush_acks(inner: &Arc<Inner>, circuit: &Arc<Circuit>, now: Instant, sent_any: &mut bool) {
    let block: Vec<Seq> = {
        let mut pending = circuit.pending_acks.lock().unwrap();
        let count = pending.len().min(MAX_STANDALONE_ACKS);
        pending.drain(..count).collect()
    };
    if block.is_empty() {
        return;
    }
    inner.send_ack_block(circuit, &block, now);
    *sent_any = true;
}

fn send_ping(inner: &Arc<Inner>, circuit: &Arc<Circuit>, now: Instant) {
    let mut body = Vec::with_capacity(5);
    packet::put_ping_request(&mut body, circuit.next_ping_id());
    inner.send_control(circuit, MessageKind::START_PING_CHECK, &body, now);
}

/// Drains each category queue in fixed order, gated by its token bucket.
/// A message the bucket refuses parks in the category's next-slot and
/// blocks that category until tokens accrue.
fn drain_queues(
    inner: &Arc<Inner>,
    circuit: &Arc<Circuit>,
    now: Instant,
    sent_any: &mut bool,
) -> CategorySet {
    let mut drained = CategorySet::default();
    for category in Category::ALL {
        let queue = circuit.queue(category);
        loop {
            let mut slot = queue.next_slot.lock().unwrap();
            let (msg, dequeued) = match slot.take() {
                Some(held) => (held, false),
                None => match queue.rx.try_recv() {
                    Ok(msg) => (msg, true),
                    Err(_) => break,
                },
            };
            if queue.bucket.remove(msg.wire_len() as u64, now) {
                drop(slot);
                inner.transmit(msg, now);
                *sent_any = true;
                if dequeued && queue.rx.is_empty() {
                    drained.insert(category);
                }
            } else {
                *slot = Some(msg);
                break;
            }
        }
    }
    drained
}

/// Fires the queue-empty callback for this circuit's drained categories,
/// subject to the minimum interval and the single-flight guard.
fn notify_empty(inner: &Arc<Inner>, circuit: &Arc<Circuit>, drained: CategorySet, now: Instant) {
    if drained.is_empty() {
        return;
    }
    let Some(hook) = inner.queue_empty_hook.read().unwrap().clone() else {
        return;
    };
    {
        let last_fire = circuit.empty_notify.last_fire.lock().unwrap();
        if last_fire.is_some_and(|at| now.saturating_duration_since(at) < EMPTY_NOTIFY_INTERVAL) {
            return;
        }
    }
    if circuit
        .empty_notify
        .in_flight
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        return;
    }
    *circuit.empty_notify.last_fire.lock().unwrap() = Some(now);

    let in_flight = circuit.empty_notify.in_flight.clone();
    let circuit = circuit.clone();
    inner.dispatcher.run_async(move || {
        hook(&circuit, drained);
        in_flight.store(false, Ordering::Release);
    });
}
