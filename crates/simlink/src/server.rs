//! See [`Transport`].

use std::{
    io,
    net::{SocketAddr, UdpSocket},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, RwLock,
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

use simlink_proto::{
    bucket::TokenBucket,
    category::Category,
    kind::MessageKind,
    packet::{self, Flags, HEADER_LEN},
    MTU,
};
use socket2::{Domain, Protocol, Socket, Type};
use uuid::Uuid;

use crate::{
    buffer::BufferPool,
    circuit::{CategorySet, Circuit, SessionInfo, TrafficSnapshot, TrafficStats},
    config::TransportConfig,
    dispatch::{Dispatcher, Handler, HandlerId},
    error::{AdmitError, BindError, SendError},
    message::{InboundMessage, Message, OutboundMessage},
    pipeline, registry::CircuitRegistry, tick,
};

/// Callback fired when some of a circuit's category queues drain, so the
/// upper layer can refill bandwidth classes just in time.
pub type QueueEmptyHook = Arc<dyn Fn(&Arc<Circuit>, CategorySet) + Send + Sync + 'static>;

/// Callback fired after a circuit has been torn down.
pub type DisconnectHook = Arc<dyn Fn(&Arc<Circuit>) + Send + Sync + 'static>;

/// How long blocking socket reads wait before re-checking for shutdown.
const READ_TIMEOUT: Duration = Duration::from_millis(250);

/// Capacity of the inbound mailbox between the I/O threads and the sender
/// tick.
const INBOUND_MAILBOX_DEPTH: usize = 1024;

/// Idle buffers the pool retains.
const POOLED_BUFFERS: usize = 64;

pub(crate) struct Inner {
    pub socket: UdpSocket,
    pub config: TransportConfig,
    pub registry: CircuitRegistry,
    pub dispatcher: Dispatcher,
    pub pool: BufferPool,
    pub mailbox_tx: flume::Sender<InboundMessage>,
    pub mailbox_rx: flume::Receiver<InboundMessage>,
    pub scene_bucket: Arc<TokenBucket>,
    pub running: AtomicBool,
    pub stats: TrafficStats,
    pub queue_empty_hook: RwLock<Option<QueueEmptyHook>>,
    pub disconnect_hook: RwLock<Option<DisconnectHook>>,
}

impl Inner {
    /// Writes one message to the socket, assigning its sequence on first
    /// transmission, piggybacking pending ACKs where permitted, and filing
    /// reliable messages into the retransmission archive.
    ///
    /// A message whose circuit is gone or disconnected is silently dropped;
    /// that is the benign tail of a teardown racing an in-flight send.
    pub fn transmit(&self, mut msg: OutboundMessage, now: Instant) -> bool {
        let Some(circuit) = msg.circuit.upgrade() else {
            return false;
        };
        if !circuit.is_connected() {
            return false;
        }
        let Some(remote) = circuit.remote() else {
            tracing::trace!(agent = %circuit.agent_id(), "no remote address bound yet, dropping send");
            return false;
        };

        let seq = *msg.seq.get_or_insert_with(|| circuit.next_seq());
        let mut flags = Flags(0);
        if msg.reliable {
            flags = flags.with(Flags::RELIABLE);
        }
        if msg.resends > 0 {
            flags = flags.with(Flags::RESENT);
        }
        if msg.zerocoded {
            flags = flags.with(Flags::ZEROCODED);
        }

        let mut buffer = self.pool.pop();
        buffer.ensure_capacity(HEADER_LEN + msg.payload.len());
        let piggyback = msg.kind != MessageKind::PACKET_ACK && !msg.zerocoded;
        if piggyback {
            let mut pending = circuit.pending_acks.lock().unwrap();
            packet::encode(&mut buffer.data, flags, seq, &msg.payload, Some(&mut pending));
        } else {
            packet::encode(&mut buffer.data, flags, seq, &msg.payload, None);
        }
        buffer.len = buffer.data.len();

        let sent = match self.socket.send_to(buffer.valid(), remote) {
            Ok(_) => true,
            Err(err) => {
                tracing::warn!(%remote, %err, "udp send failed, dropping datagram");
                false
            }
        };
        if sent {
            circuit.stats_ref().add_sent(buffer.len);
            self.stats.add_sent(buffer.len);
        }
        self.pool.push(buffer);

        // a failed write still lands reliable messages in the archive: the
        // retransmission timer is the retry policy, not the socket
        if msg.reliable {
            let len = msg.wire_len();
            let resent = msg.resends > 0;
            let mut unacked = circuit.unacked.lock().unwrap();
            if resent {
                unacked.mark_resent(seq, msg, len, now);
            } else {
                unacked.insert(seq, msg, len, now);
            }
        }
        sent
    }

    /// Sends a transport-owned control message (ACK block, ping) directly,
    /// bypassing the category queues and the throttle.
    pub fn send_control(&self, circuit: &Arc<Circuit>, kind: MessageKind, body: &[u8], now: Instant) {
        let msg = OutboundMessage::new(kind, body, Category::Task, false, false, circuit);
        self.transmit(msg, now);
    }

    /// Sends a standalone ACK message carrying `seqs`.
    pub fn send_ack_block(&self, circuit: &Arc<Circuit>, seqs: &[simlink_proto::seq::Seq], now: Instant) {
        let mut body = Vec::with_capacity(1 + seqs.len() * 4);
        packet::put_ack_body(&mut body, seqs);
        self.send_control(circuit, MessageKind::PACKET_ACK, &body, now);
    }
}

/// Tears a circuit down: flips it disconnected, purges its queues and
/// archives, unregisters it, and notifies the upper layer asynchronously.
///
/// Idempotent; late calls and in-flight send completions are no-ops.
pub(crate) fn teardown(inner: &Arc<Inner>, circuit: &Arc<Circuit>, reason: &str) {
    if !circuit.begin_teardown() {
        return;
    }
    for queue in &circuit.queues {
        queue.next_slot.lock().unwrap().take();
        while queue.rx.try_recv().is_ok() {}
    }
    circuit.unacked.lock().unwrap().clear();
    circuit.pending_acks.lock().unwrap().clear();
    inner.registry.remove(circuit);
    tracing::info!(agent = %circuit.agent_id(), reason, "circuit torn down");

    let hook = inner.disconnect_hook.read().unwrap().clone();
    if let Some(hook) = hook {
        let circuit = circuit.clone();
        inner.dispatcher.run_async(move || hook(&circuit));
    }
}

/// The server-side transport: one UDP socket multiplexing every client
/// circuit, a sender tick enforcing bandwidth fairness and retransmission,
/// and an inbound pipeline feeding typed message handlers.
pub struct Transport {
    inner: Arc<Inner>,
    local_addr: SocketAddr,
    threads: Vec<JoinHandle<()>>,
}

impl Transport {
    /// Binds the UDP socket and starts the transport's threads.
    ///
    /// # Errors
    ///
    /// Errors if the socket cannot be created, configured, or bound,
    /// including when the requested port is taken and
    /// [`TransportConfig::allow_alternate_port`] is off.
    pub fn bind(config: TransportConfig) -> Result<Self, BindError> {
        let domain = if config.bind_address.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };
        let socket =
            Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)).map_err(BindError::Configure)?;
        if config.recv_buffer_size > 0 {
            socket
                .set_recv_buffer_size(config.recv_buffer_size)
                .map_err(BindError::Configure)?;
        }

        let requested = SocketAddr::new(config.bind_address, config.port);
        match socket.bind(&requested.into()) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::AddrInUse && config.allow_alternate_port => {
                tracing::warn!(%requested, "requested port in use, falling back to an OS-assigned one");
                let fallback = SocketAddr::new(config.bind_address, 0);
                socket.bind(&fallback.into()).map_err(BindError::Bind)?;
            }
            Err(err) => return Err(BindError::Bind(err)),
        }

        let socket: UdpSocket = socket.into();
        socket
            .set_read_timeout(Some(READ_TIMEOUT))
            .map_err(BindError::Configure)?;
        let local_addr = socket.local_addr().map_err(BindError::Configure)?;

        let now = Instant::now();
        let scene = config.scene_throttle;
        let (mailbox_tx, mailbox_rx) = flume::bounded(INBOUND_MAILBOX_DEPTH);
        let inner = Arc::new(Inner {
            socket,
            registry: CircuitRegistry::new(),
            dispatcher: Dispatcher::new(),
            pool: BufferPool::new(POOLED_BUFFERS),
            mailbox_tx,
            mailbox_rx,
            scene_bucket: Arc::new(TokenBucket::new(scene.rate, scene.limit, now)),
            running: AtomicBool::new(true),
            stats: TrafficStats::default(),
            queue_empty_hook: RwLock::new(None),
            disconnect_hook: RwLock::new(None),
            config,
        });

        let mut threads = Vec::new();
        let workers = if inner.config.async_packet_handling {
            let (raw_tx, raw_rx) = flume::unbounded();
            for n in 0..inner.config.pipeline_workers.max(1) {
                let inner = inner.clone();
                let raw_rx = raw_rx.clone();
                threads.push(
                    std::thread::Builder::new()
                        .name(format!("simlink-pipeline-{n}"))
                        .spawn(move || pipeline::run_worker(&inner, &raw_rx))
                        .map_err(BindError::Configure)?,
                );
            }
            Some(raw_tx)
        } else {
            None
        };

        {
            let inner = inner.clone();
            threads.push(
                std::thread::Builder::new()
                    .name("simlink-recv".into())
                    .spawn(move || pipeline::run_reader(&inner, workers))
                    .map_err(BindError::Configure)?,
            );
        }
        {
            let inner = inner.clone();
            threads.push(
                std::thread::Builder::new()
                    .name("simlink-tick".into())
                    .spawn(move || tick::run(&inner))
                    .map_err(BindError::Configure)?,
            );
        }

        tracing::info!(%local_addr, "transport bound");
        Ok(Self {
            inner,
            local_addr,
            threads,
        })
    }

    /// Address the socket is bound to.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Address clients should be told to connect to: the masquerade address
    /// when one is configured, the bound one otherwise.
    #[must_use]
    pub fn advertised_addr(&self) -> SocketAddr {
        match self.inner.config.masquerade_address {
            Some(ip) => SocketAddr::new(ip, self.local_addr.port()),
            None => self.local_addr,
        }
    }

    /// Subscribes a handler to inbound messages of `kind`.
    pub fn register_handler(&self, kind: MessageKind, handler: Handler) -> HandlerId {
        self.inner.dispatcher.register(kind, handler)
    }

    /// Removes a previously registered handler.
    pub fn unregister_handler(&self, kind: MessageKind, id: HandlerId) -> bool {
        self.inner.dispatcher.unregister(kind, id)
    }

    /// Installs the callback fired when a circuit's category queues drain.
    pub fn set_queue_empty_hook(&self, hook: QueueEmptyHook) {
        *self.inner.queue_empty_hook.write().unwrap() = Some(hook);
    }

    /// Installs the callback fired after a circuit is torn down.
    pub fn set_disconnect_hook(&self, hook: DisconnectHook) {
        *self.inner.disconnect_hook.write().unwrap() = Some(hook);
    }

    /// Admits a circuit for a verified session.
    ///
    /// The admission matrix for an identity that already has a circuit:
    /// a root replacing a root evicts the old circuit; a child may not
    /// displace a root; a root arriving over a child upgrades it in place;
    /// a child over a child re-enables it with the new pose.
    ///
    /// # Errors
    ///
    /// Errors if a child connection is refused because a root circuit
    /// already exists.
    pub fn enable_circuit(
        &self,
        session: SessionInfo,
        is_child: bool,
    ) -> Result<Arc<Circuit>, AdmitError> {
        let inner = &self.inner;
        let now = Instant::now();
        if let Some(existing) = inner.registry.by_agent(session.agent_id) {
            match (existing.is_child(), is_child) {
                (false, false) => {
                    tracing::debug!(agent = %session.agent_id, "root circuit replaced by new root");
                    teardown(inner, &existing, "replaced by new root connection");
                }
                (false, true) => return Err(AdmitError::RootExists),
                (true, _) => {
                    existing.re_enable(&session, is_child);
                    return Ok(existing);
                }
            }
        }
        let circuit = Circuit::new(
            &session,
            is_child,
            &inner.config,
            &inner.scene_bucket,
            now,
        );
        inner.registry.insert(circuit.clone());
        tracing::info!(agent = %session.agent_id, code = session.circuit_code, is_child, "circuit admitted");
        Ok(circuit)
    }

    /// Accepts a message for transmission on `circuit`.
    ///
    /// An oversized splittable message is chunked into ordered sub-messages
    /// of the same kind; the two location/membership kinds go out whole
    /// regardless. The message is sent immediately if its category has
    /// tokens and no backlog, and queued otherwise.
    ///
    /// # Errors
    ///
    /// Errors if the circuit is disconnected.
    pub fn send(
        &self,
        circuit: &Arc<Circuit>,
        message: &Message,
        category: Category,
        allow_splitting: bool,
    ) -> Result<(), SendError> {
        if !circuit.is_connected() {
            return Err(SendError::NotConnected);
        }
        let now = Instant::now();
        let budget = MTU - HEADER_LEN - MessageKind::WIRE_LEN;
        if allow_splitting && message.kind.splittable() && message.body.len() > budget {
            let mut offset = 0;
            while offset < message.body.len() {
                let end = (offset + budget).min(message.body.len());
                let chunk = message.body.slice(offset..end);
                self.enqueue(
                    circuit,
                    OutboundMessage::new(
                        message.kind,
                        &chunk,
                        category,
                        message.reliable,
                        message.zerocoded,
                        circuit,
                    ),
                    now,
                );
                offset = end;
            }
        } else {
            self.enqueue(
                circuit,
                OutboundMessage::new(
                    message.kind,
                    &message.body,
                    category,
                    message.reliable,
                    message.zerocoded,
                    circuit,
                ),
                now,
            );
        }
        Ok(())
    }

    fn enqueue(&self, circuit: &Arc<Circuit>, msg: OutboundMessage, now: Instant) {
        let queue = circuit.queue(msg.category);
        let clear_to_send = circuit.remote().is_some()
            && queue.backlog() == 0
            && queue.bucket.remove(msg.wire_len() as u64, now);
        if clear_to_send {
            self.inner.transmit(msg, now);
        } else {
            let _ = queue.tx.send(msg);
        }
    }

    /// Sends a message to every connected circuit, skipping paused ones
    /// unless `include_paused` is set.
    pub fn broadcast(
        &self,
        message: &Message,
        category: Category,
        include_paused: bool,
        allow_splitting: bool,
    ) {
        for circuit in self.inner.registry.snapshot() {
            if !circuit.is_connected() {
                continue;
            }
            if circuit.is_paused() && !include_paused {
                continue;
            }
            let _ = self.send(&circuit, message, category, allow_splitting);
        }
    }

    /// Explicitly disconnects a circuit.
    pub fn disconnect(&self, circuit: &Arc<Circuit>) {
        teardown(&self.inner, circuit, "explicit disconnect");
    }

    /// Looks up a live circuit by agent identity.
    #[must_use]
    pub fn circuit(&self, agent_id: Uuid) -> Option<Arc<Circuit>> {
        self.inner.registry.by_agent(agent_id)
    }

    /// Number of live circuits.
    #[must_use]
    pub fn circuit_count(&self) -> usize {
        self.inner.registry.len()
    }

    /// Transport-wide traffic counters.
    #[must_use]
    pub fn stats(&self) -> TrafficSnapshot {
        self.stats_snapshot()
    }

    fn stats_snapshot(&self) -> TrafficSnapshot {
        self.inner.stats.snapshot()
    }

    /// Stops every transport thread and waits for them to exit.
    pub fn shutdown(mut self) {
        self.shutdown_impl();
    }

    fn shutdown_impl(&mut self) {
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            return;
        }
        for thread in self.threads.drain(..) {
            let _ = thread.join();
        }
        self.inner.dispatcher.shutdown();
        tracing::info!("transport stopped");
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.shutdown_impl();
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("local_addr", &self.local_addr)
            .field("circuits", &self.circuit_count())
            .finish_non_exhaustive()
    }
}
