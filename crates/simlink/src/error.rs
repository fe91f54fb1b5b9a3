//! Error types for the server transport.

use std::io;

/// Error when binding the transport's UDP socket.
#[derive(Debug, thiserror::Error)]
pub enum BindError {
    /// Failed to create or configure the socket.
    #[error("failed to configure udp socket")]
    Configure(#[source] io::Error),
    /// Failed to bind to the requested (or any permitted alternate) port.
    #[error("failed to bind udp socket")]
    Bind(#[source] io::Error),
}

/// Error when accepting a message for transmission.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    /// The target circuit has been disconnected.
    #[error("circuit is not connected")]
    NotConnected,
}

/// Error when admitting a circuit for a session.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdmitError {
    /// A root circuit already exists for this agent; a child connection may
    /// not replace it. The refusal carries no other side effects.
    #[error("agent already has a root circuit")]
    RootExists,
}

/// Error when applying a client throttle block.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ThrottleError {
    /// The block is not exactly seven little-endian floats.
    #[error("throttle block must be {expected} bytes, got {got}")]
    BadLength {
        /// Required block length.
        expected: usize,
        /// Observed block length.
        got: usize,
    },
}
