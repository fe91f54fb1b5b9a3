//! See [`Circuit`].

use std::{
    collections::VecDeque,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering},
        Arc, Mutex, RwLock,
    },
    time::{Duration, Instant},
};

use simlink_proto::{
    bucket::TokenBucket,
    category::{Category, CATEGORY_COUNT},
    dedup::SeenSeqs,
    rtt::RttEstimator,
    seq::Seq,
    unacked::UnackedArchive,
    DUPLICATE_DEPTH, MTU,
};
use uuid::Uuid;

use crate::{
    config::TransportConfig,
    error::ThrottleError,
    message::OutboundMessage,
};

/// Verified session data presented when admitting a circuit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionInfo {
    /// Agent identity; the registry's primary key.
    pub agent_id: Uuid,
    /// Session identifier the client must echo in its first-contact message.
    pub session_id: Uuid,
    /// Circuit code issued to the client out of band.
    pub circuit_code: u32,
    /// Initial avatar position, seeding interest sorting upstream.
    pub position: [f32; 3],
    /// Initial view direction.
    pub facing: [f32; 3],
}

/// Avatar pose seed carried by the circuit for its interest list.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Pose {
    /// World position.
    pub position: [f32; 3],
    /// View direction.
    pub facing: [f32; 3],
}

/// Packet and byte counters, updated with relaxed atomics from any thread.
#[derive(Debug, Default)]
pub struct TrafficStats {
    packets_sent: AtomicU64,
    bytes_sent: AtomicU64,
    packets_received: AtomicU64,
    bytes_received: AtomicU64,
    resends: AtomicU64,
    duplicates_dropped: AtomicU64,
    acks_harvested: AtomicU64,
}

/// Point-in-time copy of [`TrafficStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficSnapshot {
    /// Datagrams written to the socket.
    pub packets_sent: u64,
    /// Bytes written to the socket.
    pub bytes_sent: u64,
    /// Datagrams accepted off the socket.
    pub packets_received: u64,
    /// Bytes accepted off the socket.
    pub bytes_received: u64,
    /// Reliable messages retransmitted after a timeout.
    pub resends: u64,
    /// Reliable datagrams dropped as duplicates.
    pub duplicates_dropped: u64,
    /// Acknowledged sequence numbers harvested from peers.
    pub acks_harvested: u64,
}

impl TrafficStats {
    pub(crate) fn add_sent(&self, bytes: usize) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn add_received(&self, bytes: usize) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn add_resend(&self) {
        self.resends.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_duplicate(&self) {
        self.duplicates_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_acks(&self, n: u64) {
        self.acks_harvested.fetch_add(n, Ordering::Relaxed);
    }

    /// Copies the counters out.
    #[must_use]
    pub fn snapshot(&self) -> TrafficSnapshot {
        TrafficSnapshot {
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            resends: self.resends.load(Ordering::Relaxed),
            duplicates_dropped: self.duplicates_dropped.load(Ordering::Relaxed),
            acks_harvested: self.acks_harvested.load(Ordering::Relaxed),
        }
    }
}

/// One traffic category's outbound state: its FIFO queue, its token bucket,
/// and the slot holding a dequeued message the bucket refused.
///
/// The queue sender side is touched by upper-layer enqueuers; the receiver
/// side and the next-slot only by the sender tick.
pub(crate) struct CategoryQueue {
    pub tx: flume::Sender<OutboundMessage>,
    pub rx: flume::Receiver<OutboundMessage>,
    pub bucket: TokenBucket,
    pub next_slot: Mutex<Option<OutboundMessage>>,
}

impl CategoryQueue {
    fn new(config: &TransportConfig, parent: Arc<TokenBucket>, now: Instant) -> Self {
        let (tx, rx) = flume::unbounded();
        let limits = config.category_throttle;
        let bucket = if limits.limit == 0 {
            TokenBucket::with_parent(0, 0, now, parent)
        } else {
            TokenBucket::with_parent(
                limits.rate.max(MTU as u64),
                limits.limit.max(MTU as u64),
                now,
                parent,
            )
        };
        Self {
            tx,
            rx,
            bucket,
            next_slot: Mutex::new(None),
        }
    }

    /// Queued messages plus the held next-slot occupancy.
    pub fn backlog(&self) -> usize {
        self.rx.len() + usize::from(self.next_slot.lock().unwrap().is_some())
    }
}

/// Throttling state for queue-empty notifications: a minimum interval
/// between fires and a single-flight guard while a callback is running.
pub(crate) struct EmptyNotify {
    pub last_fire: Mutex<Option<Instant>>,
    pub in_flight: Arc<AtomicBool>,
}

/// Set of traffic categories, reported to the queue-empty callback so the
/// upper layer knows which bandwidth classes ran dry this tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CategorySet(u8);

impl CategorySet {
    /// Whether no categories are in the set.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Whether `category` is in the set.
    #[must_use]
    pub const fn contains(self, category: Category) -> bool {
        self.0 & (1 << category.index()) != 0
    }

    pub(crate) fn insert(&mut self, category: Category) {
        self.0 |= 1 << category.index();
    }

    /// Iterates the categories in the set, in drain order.
    pub fn iter(self) -> impl Iterator<Item = Category> {
        Category::ALL
            .into_iter()
            .filter(move |category| self.contains(*category))
    }
}

/// The stateful per-client session over UDP.
///
/// A circuit is created at admission, bound to a remote address by the
/// client's first-contact message, and owned by the
/// [`CircuitRegistry`](crate::registry::CircuitRegistry) until teardown.
/// I/O threads and the sender tick share it through an `Arc`; hot mutable
/// state is atomic or behind short-lived mutexes.
pub struct Circuit {
    agent_id: Uuid,
    session_id: Uuid,
    code: u32,
    remote: RwLock<Option<SocketAddr>>,
    child: AtomicBool,
    connected: AtomicBool,
    paused: AtomicBool,
    /// Next sequence to assign at first transmission.
    next_seq: AtomicU32,
    ping_id: AtomicU8,
    epoch: Instant,
    /// Nanoseconds since `epoch` of the last accepted datagram.
    last_recv: AtomicU64,
    pose: Mutex<Pose>,
    pub(crate) unacked: Mutex<UnackedArchive<OutboundMessage>>,
    pub(crate) seen: Mutex<SeenSeqs>,
    /// Sequences acknowledged to the peer on the next outbound datagram or
    /// standalone ACK, whichever comes first.
    pub(crate) pending_acks: Mutex<VecDeque<Seq>>,
    pub(crate) queues: [CategoryQueue; CATEGORY_COUNT],
    /// Circuit-wide bucket; parent of the seven category buckets, child of
    /// the scene bucket.
    pub(crate) bucket: Arc<TokenBucket>,
    pub(crate) rtt: Mutex<RttEstimator>,
    pub(crate) empty_notify: EmptyNotify,
    stats: TrafficStats,
}

impl Circuit {
    pub(crate) fn new(
        session: &SessionInfo,
        is_child: bool,
        config: &TransportConfig,
        scene: &Arc<TokenBucket>,
        now: Instant,
    ) -> Arc<Self> {
        let limits = config.client_throttle;
        let bucket = Arc::new(TokenBucket::with_parent(
            limits.rate,
            limits.limit,
            now,
            scene.clone(),
        ));
        Arc::new(Self {
            agent_id: session.agent_id,
            session_id: session.session_id,
            code: session.circuit_code,
            remote: RwLock::new(None),
            child: AtomicBool::new(is_child),
            connected: AtomicBool::new(true),
            paused: AtomicBool::new(false),
            next_seq: AtomicU32::new(Seq::FIRST.0),
            ping_id: AtomicU8::new(0),
            epoch: now,
            last_recv: AtomicU64::new(0),
            pose: Mutex::new(Pose {
                position: session.position,
                facing: session.facing,
            }),
            unacked: Mutex::new(UnackedArchive::new()),
            seen: Mutex::new(SeenSeqs::new(DUPLICATE_DEPTH)),
            pending_acks: Mutex::new(VecDeque::new()),
            queues: std::array::from_fn(|_| CategoryQueue::new(config, bucket.clone(), now)),
            bucket,
            rtt: Mutex::new(RttEstimator::new(config.default_rto(), config.max_rto())),
            empty_notify: EmptyNotify {
                last_fire: Mutex::new(None),
                in_flight: Arc::new(AtomicBool::new(false)),
            },
            stats: TrafficStats::default(),
        })
    }

    /// Agent identity this circuit serves.
    #[must_use]
    pub fn agent_id(&self) -> Uuid {
        self.agent_id
    }

    /// Session identifier the client must present at first contact.
    #[must_use]
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Circuit code issued at admission.
    #[must_use]
    pub fn circuit_code(&self) -> u32 {
        self.code
    }

    /// Remote address, once the first-contact message has bound one.
    #[must_use]
    pub fn remote(&self) -> Option<SocketAddr> {
        *self.remote.read().unwrap()
    }

    pub(crate) fn set_remote(&self, addr: SocketAddr) {
        *self.remote.write().unwrap() = Some(addr);
    }

    /// Whether this is a child-agent circuit (a neighbor region's view of
    /// the client) rather than the root presence.
    #[must_use]
    pub fn is_child(&self) -> bool {
        self.child.load(Ordering::Relaxed)
    }

    /// Whether the circuit is live. Sends to a disconnected circuit are
    /// dropped at the socket boundary, and its inbound datagrams ignored.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub(crate) fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Release);
    }

    /// Flips the circuit disconnected, reporting whether this call was the
    /// one that did it. Teardown is driven by whoever wins.
    pub(crate) fn begin_teardown(&self) -> bool {
        self.connected.swap(false, Ordering::AcqRel)
    }

    /// Whether broadcasts currently skip this circuit.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    /// Excludes this circuit from broadcasts that do not opt in to paused
    /// clients.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::Relaxed);
    }

    /// Resumes broadcast delivery.
    pub fn resume(&self) {
        self.paused.store(false, Ordering::Relaxed);
    }

    /// Current pose seed.
    #[must_use]
    pub fn pose(&self) -> Pose {
        *self.pose.lock().unwrap()
    }

    /// Re-admits an existing circuit: refreshes the pose and child flag and
    /// revives it if it was mid-teardown.
    pub(crate) fn re_enable(&self, session: &SessionInfo, is_child: bool) {
        *self.pose.lock().unwrap() = Pose {
            position: session.position,
            facing: session.facing,
        };
        self.child.store(is_child, Ordering::Relaxed);
        self.set_connected(true);
    }

    pub(crate) fn next_seq(&self) -> Seq {
        Seq(self.next_seq.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn next_ping_id(&self) -> u8 {
        self.ping_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn mark_recv(&self, now: Instant) {
        let nanos = now.saturating_duration_since(self.epoch).as_nanos() as u64;
        self.last_recv.fetch_max(nanos, Ordering::Relaxed);
    }

    /// Time since the last accepted datagram; time since admission if none
    /// has arrived yet.
    #[must_use]
    pub fn last_recv_age(&self, now: Instant) -> Duration {
        let last = Duration::from_nanos(self.last_recv.load(Ordering::Relaxed));
        now.saturating_duration_since(self.epoch + last)
    }

    /// Removes `seq` from the retransmission archive, feeding the RTT
    /// estimator when the message was never resent. Returns whether the
    /// sequence was in flight.
    pub(crate) fn ack(&self, seq: Seq, now: Instant) -> bool {
        let Some(acked) = self.unacked.lock().unwrap().ack(seq, now) else {
            return false;
        };
        if let Some(sample) = acked.sample {
            self.rtt.lock().unwrap().sample(sample);
        }
        self.stats.add_acks(1);
        true
    }

    pub(crate) fn queue(&self, category: Category) -> &CategoryQueue {
        &self.queues[category.index()]
    }

    /// Smoothed round-trip estimate; zero before the first sample.
    #[must_use]
    pub fn srtt(&self) -> Duration {
        self.rtt.lock().unwrap().srtt()
    }

    /// Current retransmission timeout.
    #[must_use]
    pub fn rto(&self) -> Duration {
        self.rtt.lock().unwrap().rto()
    }

    /// Wire bytes transmitted but not yet acknowledged.
    #[must_use]
    pub fn unacked_bytes(&self) -> usize {
        self.unacked.lock().unwrap().unacked_bytes()
    }

    /// Byte tokens currently available to this circuit as a whole, before
    /// per-category limits apply.
    #[must_use]
    pub fn bandwidth_available(&self) -> u64 {
        self.bucket.level()
    }

    /// Traffic counters for this circuit.
    #[must_use]
    pub fn stats(&self) -> TrafficSnapshot {
        self.stats.snapshot()
    }

    pub(crate) fn stats_ref(&self) -> &TrafficStats {
        &self.stats
    }

    /// Applies a client throttle block: seven little-endian `f32`s, one per
    /// category in wire order, each in bytes per second. Rates are clamped
    /// so no category drips slower than one MTU per second.
    pub fn set_throttles(&self, block: &[u8]) -> Result<(), ThrottleError> {
        const EXPECTED: usize = CATEGORY_COUNT * 4;
        if block.len() != EXPECTED {
            return Err(ThrottleError::BadLength {
                expected: EXPECTED,
                got: block.len(),
            });
        }
        for (category, chunk) in Category::ALL.iter().zip(block.chunks_exact(4)) {
            let rate = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            let rate = if rate.is_finite() && rate > 0.0 {
                rate as u64
            } else {
                0
            };
            let drip = rate.max(MTU as u64);
            let bucket = &self.queues[category.index()].bucket;
            bucket.set_drip_rate(drip);
            bucket.set_max_burst(drip);
        }
        Ok(())
    }

    /// Reads back the current per-category drip rates in the same wire
    /// layout [`set_throttles`](Self::set_throttles) accepts.
    #[must_use]
    pub fn get_throttles(&self) -> [u8; CATEGORY_COUNT * 4] {
        let mut block = [0u8; CATEGORY_COUNT * 4];
        for (queue, chunk) in self.queues.iter().zip(block.chunks_exact_mut(4)) {
            let rate = queue.bucket.drip_rate() as f32;
            chunk.copy_from_slice(&rate.to_le_bytes());
        }
        block
    }
}

impl std::fmt::Debug for Circuit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Circuit")
            .field("agent_id", &self.agent_id)
            .field("code", &self.code)
            .field("remote", &self.remote())
            .field("child", &self.is_child())
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn circuit() -> Arc<Circuit> {
        let now = Instant::now();
        let config = TransportConfig::default();
        let scene = Arc::new(TokenBucket::new(0, 0, now));
        Circuit::new(
            &SessionInfo {
                agent_id: Uuid::new_v4(),
                session_id: Uuid::new_v4(),
                circuit_code: 7,
                position: [128.0, 128.0, 20.0],
                facing: [1.0, 0.0, 0.0],
            },
            false,
            &config,
            &scene,
            now,
        )
    }

    #[test]
    fn sequences_start_at_one() {
        let circuit = circuit();
        assert_eq!(Seq(1), circuit.next_seq());
        assert_eq!(Seq(2), circuit.next_seq());
    }

    #[test]
    fn throttle_block_round_trips() {
        let circuit = circuit();
        let mut block = Vec::new();
        for rate in [5000.0f32, 10_000.0, 15_000.0, 20_000.0, 25_000.0, 30_000.0, 35_000.0] {
            block.extend_from_slice(&rate.to_le_bytes());
        }
        circuit.set_throttles(&block).unwrap();
        assert_eq!(&block[..], &circuit.get_throttles()[..]);

        assert_eq!(
            Err(ThrottleError::BadLength {
                expected: 28,
                got: 3
            }),
            circuit.set_throttles(&[0, 1, 2])
        );
    }

    #[test]
    fn throttle_rates_clamp_to_mtu() {
        let circuit = circuit();
        let mut block = [0u8; 28];
        block[..4].copy_from_slice(&100.0f32.to_le_bytes());
        circuit.set_throttles(&block).unwrap();
        for queue in &circuit.queues {
            assert_eq!(MTU as u64, queue.bucket.drip_rate());
        }
    }

    #[test]
    fn last_recv_age_tracks_marks() {
        let circuit = circuit();
        let now = Instant::now();
        circuit.mark_recv(now);
        let age = circuit.last_recv_age(now + Duration::from_millis(250));
        assert!(age >= Duration::from_millis(250));
        assert!(age < Duration::from_millis(1250));
    }
}
