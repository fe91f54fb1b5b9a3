//! Reliable circuit transport over UDP for virtual-world simulators.
//!
//! One server-side socket multiplexes many long-lived client circuits. The
//! transport provides selective acknowledgement, duplicate suppression, and
//! RTT-adaptive retransmission per circuit, enforces bandwidth fairness
//! with a hierarchical token-bucket scheduler across seven traffic
//! categories, and signals the upper layer when a category's outbound queue
//! runs dry so bandwidth can be refilled just in time.
//!
//! Upper layers interact through [`Transport`]: register typed message
//! handlers, admit circuits for verified sessions, and enqueue outbound
//! [`Message`]s tagged with a [`Category`]. The wire protocol itself lives
//! in the `simlink_proto` crate.

pub mod buffer;
pub mod circuit;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod message;
mod pipeline;
pub mod registry;
mod server;
mod tick;

pub use simlink_proto as proto;
pub use simlink_proto::{category::Category, kind::MessageKind, seq::Seq};

pub use crate::{
    circuit::{CategorySet, Circuit, Pose, SessionInfo, TrafficSnapshot},
    config::{ThrottleLimits, TransportConfig},
    dispatch::{Handler, HandlerId},
    error::{AdmitError, BindError, SendError, ThrottleError},
    message::{InboundMessage, Message},
    server::{DisconnectHook, QueueEmptyHook, Transport},
};
