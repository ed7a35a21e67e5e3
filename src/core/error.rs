use std::time::Duration;

use thiserror::Error;

use crate::core::packet::{CodecError, ConnectReturnCode};

/// Why a session ended. Every variant is scoped to one connection.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("no traffic within keepalive of {0:?}")]
    KeepaliveTimeout(Duration),

    #[error("handshake refused: {0}")]
    HandshakeRejected(ConnectReturnCode),

    #[error("taken over by a newer connection with the same client id")]
    TakenOver,

    #[error("outbound writer failed")]
    WriterFailed,
}

impl SessionError {
    /// The peer went away between packets rather than misbehaving.
    pub fn is_eof(&self) -> bool {
        matches!(self, SessionError::Codec(e) if e.is_eof())
    }
}

/// Outcome of a non-blocking enqueue onto a session's outbound queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EnqueueError {
    #[error("outbound queue is full")]
    Full,

    #[error("outbound queue is closed")]
    Closed,
}
