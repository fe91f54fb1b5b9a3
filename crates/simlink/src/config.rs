//! See [`TransportConfig`].

use std::{
    net::{IpAddr, Ipv4Addr},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use simlink_proto::{DEFAULT_RTO, MAX_RTO};

/// Drip rate and burst cap for one token bucket, in bytes per second and
/// bytes. A zero `limit` disables the bucket entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThrottleLimits {
    /// Bytes added to the bucket per second.
    pub rate: u64,
    /// Burst cap in bytes.
    pub limit: u64,
}

/// Configuration of a [`Transport`](crate::Transport).
///
/// Every field has a default, so partial configuration files deserialize
/// cleanly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Local address to bind the UDP socket on.
    pub bind_address: IpAddr,
    /// UDP port to bind; 0 asks the OS for one.
    pub port: u16,
    /// Whether to fall back to an OS-assigned port if `port` is taken.
    pub allow_alternate_port: bool,
    /// Address to advertise to clients instead of the bound one, for
    /// servers behind NAT.
    pub masquerade_address: Option<IpAddr>,
    /// Socket receive buffer size in bytes; 0 keeps the OS default.
    pub recv_buffer_size: usize,
    /// Whether inbound datagrams are handled on a worker pool instead of
    /// inline on the socket reader thread.
    pub async_packet_handling: bool,
    /// Worker threads for inbound handling when `async_packet_handling` is
    /// set.
    pub pipeline_workers: usize,
    /// Bandwidth cap shared by every circuit on this transport.
    pub scene_throttle: ThrottleLimits,
    /// Default bandwidth cap per circuit.
    pub client_throttle: ThrottleLimits,
    /// Default bandwidth cap per traffic category within a circuit.
    pub category_throttle: ThrottleLimits,
    /// Retransmission timeout before any RTT samples, in milliseconds.
    pub default_rto_ms: u64,
    /// Upper bound on the retransmission timeout, in milliseconds.
    pub max_rto_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 9000,
            allow_alternate_port: false,
            masquerade_address: None,
            recv_buffer_size: 0,
            async_packet_handling: false,
            pipeline_workers: 2,
            scene_throttle: ThrottleLimits { rate: 0, limit: 0 },
            client_throttle: ThrottleLimits {
                rate: 187_500,
                limit: 375_000,
            },
            category_throttle: ThrottleLimits {
                rate: 26_250,
                limit: 52_500,
            },
            default_rto_ms: DEFAULT_RTO.as_millis() as u64,
            max_rto_ms: MAX_RTO.as_millis() as u64,
        }
    }
}

impl TransportConfig {
    /// Retransmission timeout floor as a [`Duration`].
    #[must_use]
    pub const fn default_rto(&self) -> Duration {
        Duration::from_millis(self.default_rto_ms)
    }

    /// Retransmission timeout ceiling as a [`Duration`].
    #[must_use]
    pub const fn max_rto(&self) -> Duration {
        Duration::from_millis(self.max_rto_ms)
    }
}
