//! Transport error taxonomy.

use crate::protocol::RequestId;

/// Errors surfaced to callers of the transport.
///
/// Every variant is cloneable so a single fatal cause can fan out to all
/// outstanding callers during teardown.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The transport tore down: stream read failure, peer hangup, or
    /// explicit shutdown. Every outstanding call fails with the same cause,
    /// and calls issued afterwards fail immediately. The transport is never
    /// reconnected; the embedder constructs a new one.
    #[error("transport closed: {reason}")]
    Closed { reason: String },

    /// Writing one specific outbound request failed. Only that caller is
    /// affected; the transport keeps draining its queue.
    #[error("failed to write request {id}: {reason}")]
    WriteFailed { id: RequestId, reason: String },

    /// The allocated request id is already outstanding. Either the id
    /// counter wrapped all the way around or the table is corrupted; the
    /// call is rejected rather than clobbering the existing entry.
    #[error("request id {id} already in flight")]
    IdCollision { id: RequestId },
}

impl TransportError {
    pub fn closed(reason: impl Into<String>) -> Self {
        Self::Closed {
            reason: reason.into(),
        }
    }

    /// True for causes that take the whole transport down with them.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Closed { .. })
    }
}
