//! End-to-end exchanges between a [`Transport`] and a scripted client on a
//! loopback UDP socket.

use std::{
    net::{SocketAddr, UdpSocket},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use bytes::Bytes;
use simlink::{
    proto::packet::{self, Flags},
    Category, Message, MessageKind, Seq, SessionInfo, ThrottleLimits, Transport, TransportConfig,
};
use uuid::Uuid;

const CLIENT_KIND: MessageKind = MessageKind(100);

fn test_config() -> TransportConfig {
    TransportConfig {
        bind_address: "127.0.0.1".parse().unwrap(),
        port: 0,
        // generous rates so queues drain on the first tick
        client_throttle: ThrottleLimits {
            rate: 10_000_000,
            limit: 1_000_000,
        },
        category_throttle: ThrottleLimits {
            rate: 10_000_000,
            limit: 1_000_000,
        },
        default_rto_ms: 200,
        ..TransportConfig::default()
    }
}

fn session() -> SessionInfo {
    SessionInfo {
        agent_id: Uuid::new_v4(),
        session_id: Uuid::new_v4(),
        circuit_code: 900,
        position: [128.0, 128.0, 30.0],
        facing: [1.0, 0.0, 0.0],
    }
}

struct Client {
    socket: UdpSocket,
    server: SocketAddr,
    next_seq: u32,
}

impl Client {
    fn connect(server: SocketAddr) -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket
            .set_read_timeout(Some(Duration::from_millis(50)))
            .unwrap();
        Self {
            socket,
            server,
            next_seq: 1,
        }
    }

    fn send_raw(&self, seq: u32, kind: MessageKind, body: &[u8], flags: Flags) {
        let mut payload = Vec::new();
        kind.put(&mut payload);
        payload.extend_from_slice(body);
        let mut out = Vec::new();
        packet::encode(&mut out, flags, Seq(seq), &payload, None);
        self.socket.send_to(&out, self.server).unwrap();
    }

    fn send(&mut self, kind: MessageKind, body: &[u8], reliable: bool) -> u32 {
        let seq = self.next_seq;
        self.next_seq += 1;
        let flags = if reliable {
            Flags::RELIABLE
        } else {
            Flags(0)
        };
        self.send_raw(seq, kind, body, flags);
        seq
    }

    fn hello(&mut self, session: &SessionInfo) -> u32 {
        let mut body = Vec::new();
        body.extend_from_slice(&session.circuit_code.to_be_bytes());
        body.extend_from_slice(session.session_id.as_bytes());
        body.extend_from_slice(session.agent_id.as_bytes());
        self.send(MessageKind::USE_CIRCUIT_CODE, &body, true)
    }

    /// Receives one datagram, returning its packet plus the parsed kind and
    /// remaining body.
    fn recv(&self) -> Option<(packet::Packet, MessageKind, Bytes)> {
        let mut buf = [0u8; 4096];
        let (len, _) = self.socket.recv_from(&mut buf).ok()?;
        let packet = packet::decode(&buf[..len]).expect("server sent a malformed datagram");
        let mut body = packet.payload.clone();
        let kind = MessageKind::get(&mut body).expect("server datagram without a kind");
        Some((packet, kind, body))
    }

    /// Collects datagrams until `deadline`, feeding each to `visit`.
    fn drain_until(
        &self,
        deadline: Instant,
        mut visit: impl FnMut(&packet::Packet, MessageKind, &[u8]),
    ) {
        while Instant::now() < deadline {
            if let Some((packet, kind, body)) = self.recv() {
                visit(&packet, kind, &body);
            }
        }
    }

    fn ack(&mut self, seqs: &[Seq]) {
        let mut body = Vec::new();
        packet::put_ack_body(&mut body, seqs);
        self.send(MessageKind::PACKET_ACK, &body, false);
    }
}

fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
    let end = Instant::now() + deadline;
    while Instant::now() < end {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    false
}

#[test]
fn happy_send_ack_updates_rtt_and_empties_archive() {
    let transport = Transport::bind(test_config()).unwrap();
    let session = session();
    let circuit = transport.enable_circuit(session, false).unwrap();

    let mut client = Client::connect(transport.local_addr());
    client.hello(&session);
    assert!(
        wait_until(Duration::from_secs(2), || circuit.remote().is_some()),
        "first contact never bound an address"
    );

    transport
        .send(
            &circuit,
            &Message::reliable(CLIENT_KIND, vec![0xABu8; 100]),
            Category::Task,
            false,
        )
        .unwrap();

    // find the reliable datagram on the client side
    let mut got: Option<Seq> = None;
    let deadline = Instant::now() + Duration::from_secs(2);
    while got.is_none() && Instant::now() < deadline {
        if let Some((packet, kind, _)) = client.recv() {
            if kind == CLIENT_KIND {
                assert!(packet.header.flags.contains(Flags::RELIABLE));
                got = Some(packet.header.seq);
            }
        }
    }
    let seq = got.expect("reliable message never arrived");
    assert!(circuit.unacked_bytes() > 0);

    client.ack(&[seq]);
    assert!(
        wait_until(Duration::from_secs(2), || circuit.unacked_bytes() == 0),
        "ack never emptied the retransmission archive"
    );
    let srtt = circuit.srtt();
    assert!(!srtt.is_zero(), "ack should have produced an RTT sample");
    assert!(srtt < Duration::from_secs(2));

    transport.shutdown();
}

#[test]
fn unacked_message_is_resent_with_backoff() {
    let transport = Transport::bind(test_config()).unwrap();
    let session = session();
    let circuit = transport.enable_circuit(session, false).unwrap();

    let mut client = Client::connect(transport.local_addr());
    client.hello(&session);
    assert!(wait_until(Duration::from_secs(2), || circuit.remote().is_some()));

    transport
        .send(
            &circuit,
            &Message::reliable(CLIENT_KIND, vec![1u8; 64]),
            Category::Task,
            false,
        )
        .unwrap();

    // never ack: the message must come back with the resent flag and the
    // same sequence, and the timeout must have doubled from its 200ms floor
    let mut first: Option<Seq> = None;
    let mut resent: Option<Seq> = None;
    let deadline = Instant::now() + Duration::from_secs(3);
    while resent.is_none() && Instant::now() < deadline {
        if let Some((packet, kind, _)) = client.recv() {
            if kind != CLIENT_KIND {
                continue;
            }
            if packet.header.flags.contains(Flags::RESENT) {
                resent = Some(packet.header.seq);
            } else if first.is_none() {
                first = Some(packet.header.seq);
            }
        }
    }
    let first = first.expect("original transmission never arrived");
    let resent = resent.expect("message was never retransmitted");
    assert_eq!(first, resent);
    assert!(circuit.rto() >= Duration::from_millis(400));

    transport.shutdown();
}

#[test]
fn duplicate_reliable_datagram_dispatches_once_and_acks_twice() {
    let transport = Transport::bind(test_config()).unwrap();
    let session = session();
    let circuit = transport.enable_circuit(session, false).unwrap();

    let dispatched = Arc::new(AtomicUsize::new(0));
    let seen = dispatched.clone();
    transport.register_handler(
        CLIENT_KIND,
        Arc::new(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        }),
    );

    let mut client = Client::connect(transport.local_addr());
    client.hello(&session);
    assert!(wait_until(Duration::from_secs(2), || circuit.remote().is_some()));

    // same reliable datagram twice: same sequence, same bytes
    let seq = client.send(CLIENT_KIND, b"payload", true);
    client.send_raw(seq, CLIENT_KIND, b"payload", Flags::RELIABLE);

    let mut acks_for_seq = 0;
    client.drain_until(Instant::now() + Duration::from_millis(1200), |_, kind, body| {
        if kind == MessageKind::PACKET_ACK {
            let acked = packet::get_ack_body(body).unwrap();
            acks_for_seq += acked.iter().filter(|s| s.0 == seq).count();
        }
    });

    assert_eq!(1, dispatched.load(Ordering::SeqCst), "duplicate was dispatched");
    assert!(
        acks_for_seq >= 2,
        "expected an ack for both deliveries, saw {acks_for_seq}"
    );
    assert_eq!(1, circuit.stats().duplicates_dropped);

    transport.shutdown();
}

#[test]
fn use_circuit_code_rekeys_the_remote_address() {
    let transport = Transport::bind(test_config()).unwrap();
    let session = session();
    let circuit = transport.enable_circuit(session, false).unwrap();

    let mut first = Client::connect(transport.local_addr());
    first.hello(&session);
    assert!(wait_until(Duration::from_secs(2), || circuit.remote().is_some()));
    let p1 = first.socket.local_addr().unwrap();
    assert_eq!(Some(p1), circuit.remote());

    // the same client reappears from a different source address
    let mut second = Client::connect(transport.local_addr());
    second.hello(&session);
    let p2 = second.socket.local_addr().unwrap();
    assert!(
        wait_until(Duration::from_secs(2), || circuit.remote() == Some(p2)),
        "re-keying never moved the circuit to the new address"
    );

    // identity lookup is untouched, and datagrams from the old address are
    // now from an unknown source: stats stop moving for them
    std::thread::sleep(Duration::from_millis(100));
    let before = circuit.stats().packets_received;
    first.send(CLIENT_KIND, b"stale", false);
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(before, circuit.stats().packets_received);
    let found = transport.circuit(session.agent_id).unwrap();
    assert!(Arc::ptr_eq(&found, &circuit));

    transport.shutdown();
}

#[test]
fn ping_requests_are_answered() {
    let transport = Transport::bind(test_config()).unwrap();
    let session = session();
    let circuit = transport.enable_circuit(session, false).unwrap();

    let mut client = Client::connect(transport.local_addr());
    client.hello(&session);
    assert!(wait_until(Duration::from_secs(2), || circuit.remote().is_some()));

    let mut body = Vec::new();
    packet::put_ping_request(&mut body, 9);
    client.send(MessageKind::START_PING_CHECK, &body, false);

    let mut echoed = None;
    let deadline = Instant::now() + Duration::from_secs(2);
    while echoed.is_none() && Instant::now() < deadline {
        if let Some((_, kind, body)) = client.recv() {
            if kind == MessageKind::COMPLETE_PING_CHECK {
                echoed = packet::get_ping_id(&body);
            }
        }
    }
    assert_eq!(Some(9), echoed);

    transport.shutdown();
}
