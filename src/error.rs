//! Transport Error Types
//!
//! Typed failures surfaced by the transport layer. Most of these never reach a
//! `request` caller: reader/writer workers log them and tear the session down.
//! They are returned from the start-up and registration entry points.

use crate::transport::types::NodeId;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("frame body of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },

    #[error("failed to bind {addr}: {reason}")]
    Bind { addr: String, reason: String },

    /// `identity` and `heartbeat` are installed on every node and cannot be replaced.
    #[error("operation '{0}' is reserved")]
    ReservedOperation(String),

    #[error("no session for node {0:?}")]
    UnknownNode(NodeId),

    #[error("transport closed")]
    Closed,

    #[error("transport is in {0:?} mode")]
    InvalidMode(crate::transport::types::Mode),
}

pub type Result<T> = std::result::Result<T, TransportError>;
