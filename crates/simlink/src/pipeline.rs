//! The inbound pipeline: datagram reception, decode, circuit lookup,
//! duplicate suppression, ACK harvesting, and mailbox handoff.
//!
//! Runs on the socket reader thread, or on a pool of pipeline workers when
//! async packet handling is configured. Nothing here ever blocks on
//! application state: the mailbox handoff is a `try_send`, and overflow
//! drops the message with a warning.

use std::{io, sync::atomic::Ordering, sync::Arc, time::Instant};

use simlink_proto::{
    kind::MessageKind,
    packet::{self, Flags},
};

use crate::{
    buffer::DatagramBuffer,
    message::{CircuitHello, InboundMessage},
    server::Inner,
};

/// Socket reader loop: pulls datagrams into pooled buffers and hands them
/// to the pipeline, inline or via the worker channel.
pub(crate) fn run_reader(inner: &Arc<Inner>, workers: Option<flume::Sender<DatagramBuffer>>) {
    while inner.running.load(Ordering::Acquire) {
        let mut buffer = inner.pool.pop();
        match inner.socket.recv_from(&mut buffer.data) {
            Ok((len, remote)) => {
                buffer.len = len;
                buffer.remote = Some(remote);
                match &workers {
                    Some(tx) => {
                        if tx.send(buffer).is_err() {
                            return;
                        }
                    }
                    None => process(inner, buffer, Instant::now()),
                }
            }
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                ) =>
            {
                inner.pool.push(buffer);
            }
            Err(err) => {
                inner.pool.push(buffer);
                if inner.running.load(Ordering::Acquire) {
                    tracing::error!(%err, "udp receive failed");
                }
            }
        }
    }
}

/// Pipeline worker loop for async packet handling.
pub(crate) fn run_worker(inner: &Arc<Inner>, raw_rx: &flume::Receiver<DatagramBuffer>) {
    for buffer in raw_rx.iter() {
        process(inner, buffer, Instant::now());
    }
}

/// Runs one datagram through the full inbound pipeline.
pub(crate) fn process(inner: &Arc<Inner>, buffer: DatagramBuffer, now: Instant) {
    let remote = buffer
        .remote
        .expect("received datagram always carries its source");
    let wire_len = buffer.len;

    let packet = match packet::decode(buffer.valid()) {
        Ok(packet) => packet,
        Err(err) => {
            tracing::error!(%remote, %err, "malformed datagram");
            inner.pool.push(buffer);
            return;
        }
    };
    inner.pool.push(buffer);

    let mut body = packet.payload.clone();
    let Some(kind) = MessageKind::get(&mut body) else {
        tracing::error!(%remote, "datagram payload too short for a message kind");
        return;
    };

    // first contact binds identity to source address; everything else is
    // looked up by where it came from
    let circuit = if kind == MessageKind::USE_CIRCUIT_CODE {
        let Some(hello) = CircuitHello::get(&body) else {
            tracing::error!(%remote, "malformed use-circuit-code body");
            return;
        };
        let Some(circuit) = inner.registry.by_agent(hello.agent_id) else {
            tracing::debug!(%remote, agent = %hello.agent_id, "use-circuit-code for unknown agent");
            return;
        };
        if circuit.circuit_code() != hello.code || circuit.session_id() != hello.session_id {
            tracing::debug!(%remote, agent = %hello.agent_id, "use-circuit-code credentials mismatch");
            return;
        }
        if !circuit.is_connected() {
            return;
        }
        inner.registry.rebind(&circuit, remote);
        inner.send_ack_block(&circuit, &[packet.header.seq], now);
        circuit
    } else {
        let Some(circuit) = inner.registry.by_addr(remote) else {
            tracing::debug!(%remote, "datagram from unknown source");
            return;
        };
        if !circuit.is_connected() {
            return;
        }
        circuit
    };

    circuit.mark_recv(now);
    circuit.stats_ref().add_received(wire_len);
    inner.stats.add_received(wire_len);

    // harvest piggybacked ACKs, then the body of a standalone ACK block
    for ack in &packet.acks {
        circuit.ack(*ack, now);
    }
    if kind == MessageKind::PACKET_ACK {
        match packet::get_ack_body(&body) {
            Ok(seqs) => {
                for seq in seqs {
                    circuit.ack(seq, now);
                }
            }
            Err(err) => tracing::error!(%remote, %err, "malformed ack block"),
        }
        return;
    }

    // pings turn around locally and never reach the dispatcher
    if kind == MessageKind::START_PING_CHECK {
        if let Some(ping_id) = packet::get_ping_id(&body) {
            let mut reply = Vec::with_capacity(1);
            packet::put_ping_reply(&mut reply, ping_id);
            inner.send_control(&circuit, MessageKind::COMPLETE_PING_CHECK, &reply, now);
        }
        return;
    }
    if kind == MessageKind::COMPLETE_PING_CHECK {
        return;
    }

    if packet.header.flags.contains(Flags::RELIABLE) {
        let fresh = circuit.seen.lock().unwrap().try_insert(packet.header.seq);
        if !fresh {
            // duplicate: re-acknowledge so the peer stops resending, but
            // deliver nothing
            circuit.stats_ref().add_duplicate();
            inner.send_ack_block(&circuit, &[packet.header.seq], now);
            return;
        }
        circuit.pending_acks.lock().unwrap().push_back(packet.header.seq);
    }

    let message = InboundMessage {
        circuit: circuit.clone(),
        kind,
        body,
        received_at: now,
    };
    if inner.mailbox_tx.try_send(message).is_err() {
        tracing::warn!(
            agent = %circuit.agent_id(),
            kind = %kind,
            "inbound mailbox full, dropping message"
        );
    }
}
