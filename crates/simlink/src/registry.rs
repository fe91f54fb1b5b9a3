//! See [`CircuitRegistry`].

use std::{
    net::SocketAddr,
    sync::{Arc, RwLock},
};

use ahash::AHashMap;
use uuid::Uuid;

use crate::circuit::Circuit;

#[derive(Debug, Default)]
struct Indexes {
    by_agent: AHashMap<Uuid, Arc<Circuit>>,
    by_addr: AHashMap<SocketAddr, Arc<Circuit>>,
}

/// Owns every live circuit, indexed both by agent identity and by remote
/// address.
///
/// Both indexes live under one lock so that address re-keying is
/// point-in-time atomic: an I/O thread looking up concurrently sees either
/// the old binding or the new one, never a half-updated pair. The sender
/// tick iterates over a snapshot, so it never holds the lock across sends.
#[derive(Debug, Default)]
pub struct CircuitRegistry {
    inner: RwLock<Indexes>,
}

impl CircuitRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live circuits.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().unwrap().by_agent.len()
    }

    /// Whether no circuits are live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.read().unwrap().by_agent.is_empty()
    }

    /// Inserts a freshly admitted circuit. Its address index entry appears
    /// later, when first contact binds a remote address.
    pub fn insert(&self, circuit: Arc<Circuit>) {
        let mut inner = self.inner.write().unwrap();
        if let Some(addr) = circuit.remote() {
            inner.by_addr.insert(addr, circuit.clone());
        }
        inner.by_agent.insert(circuit.agent_id(), circuit);
    }

    /// Removes a circuit from both indexes.
    pub fn remove(&self, circuit: &Arc<Circuit>) {
        let mut inner = self.inner.write().unwrap();
        // the agent entry may already belong to a replacement circuit for
        // the same identity; only remove it if it is still this one
        if inner
            .by_agent
            .get(&circuit.agent_id())
            .is_some_and(|current| Arc::ptr_eq(current, circuit))
        {
            inner.by_agent.remove(&circuit.agent_id());
        }
        if let Some(addr) = circuit.remote() {
            if inner
                .by_addr
                .get(&addr)
                .is_some_and(|current| Arc::ptr_eq(current, circuit))
            {
                inner.by_addr.remove(&addr);
            }
        }
    }

    /// Looks a circuit up by agent identity.
    #[must_use]
    pub fn by_agent(&self, agent_id: Uuid) -> Option<Arc<Circuit>> {
        self.inner.read().unwrap().by_agent.get(&agent_id).cloned()
    }

    /// Looks a circuit up by the remote address its datagrams arrive from.
    #[must_use]
    pub fn by_addr(&self, addr: SocketAddr) -> Option<Arc<Circuit>> {
        self.inner.read().unwrap().by_addr.get(&addr).cloned()
    }

    /// Atomically re-keys a circuit to a new remote address, preserving its
    /// identity entry. The circuit's own remote-address field is updated
    /// inside the same critical section.
    pub fn rebind(&self, circuit: &Arc<Circuit>, addr: SocketAddr) {
        let mut inner = self.inner.write().unwrap();
        if let Some(old) = circuit.remote() {
            if old == addr {
                return;
            }
            if inner
                .by_addr
                .get(&old)
                .is_some_and(|current| Arc::ptr_eq(current, circuit))
            {
                inner.by_addr.remove(&old);
            }
        }
        circuit.set_remote(addr);
        inner.by_addr.insert(addr, circuit.clone());
    }

    /// Copies out the live circuits for iteration off-lock.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<Circuit>> {
        self.inner.read().unwrap().by_agent.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use simlink_proto::bucket::TokenBucket;

    use super::*;
    use crate::{circuit::SessionInfo, config::TransportConfig};

    fn new_circuit(agent_id: Uuid) -> Arc<Circuit> {
        let now = Instant::now();
        Circuit::new(
            &SessionInfo {
                agent_id,
                session_id: Uuid::new_v4(),
                circuit_code: 1,
                position: [0.0; 3],
                facing: [0.0; 3],
            },
            false,
            &TransportConfig::default(),
            &Arc::new(TokenBucket::new(0, 0, now)),
            now,
        )
    }

    #[test]
    fn rebind_moves_address_index_only() {
        let registry = CircuitRegistry::new();
        let circuit = new_circuit(Uuid::new_v4());
        registry.insert(circuit.clone());

        let p1: SocketAddr = "10.0.0.1:5000".parse().unwrap();
        let p2: SocketAddr = "10.0.0.2:6000".parse().unwrap();

        registry.rebind(&circuit, p1);
        assert!(registry.by_addr(p1).is_some());

        registry.rebind(&circuit, p2);
        assert!(registry.by_addr(p1).is_none());
        assert!(
            registry
                .by_addr(p2)
                .is_some_and(|found| Arc::ptr_eq(&found, &circuit))
        );
        assert!(
            registry
                .by_agent(circuit.agent_id())
                .is_some_and(|found| Arc::ptr_eq(&found, &circuit))
        );
        assert_eq!(Some(p2), circuit.remote());
    }

    #[test]
    fn remove_spares_a_replacement() {
        let registry = CircuitRegistry::new();
        let agent_id = Uuid::new_v4();
        let old = new_circuit(agent_id);
        registry.insert(old.clone());

        let replacement = new_circuit(agent_id);
        registry.insert(replacement.clone());

        // tearing down the evicted circuit must not unregister its successor
        registry.remove(&old);
        assert!(
            registry
                .by_agent(agent_id)
                .is_some_and(|found| Arc::ptr_eq(&found, &replacement))
        );
        assert_eq!(1, registry.len());
    }
}
