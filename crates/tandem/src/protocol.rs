//! Wire protocol types exchanged over the transport stream.
//!
//! The outermost framed unit is an [`Envelope`] tagged as either a request
//! or a response. Correlation between the two is purely by [`RequestId`];
//! payloads are opaque to the transport.

use serde::{Deserialize, Serialize};

/// Correlation id shared by a request and its response.
///
/// Allocated from a per-transport monotonic counter. The `u64` space is wide
/// enough that wraparound is not reachable in practice; registration
/// additionally rejects an id that is somehow still outstanding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(u64);

impl RequestId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An RPC call addressed to a named service on the remote peer.
///
/// `id` is assigned by the issuing transport, never by the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: RequestId,
    pub service: String,
    pub payload: serde_json::Value,
}

/// The reply to a single [`Request`], carrying the same id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: RequestId,
    pub payload: serde_json::Value,
}

/// The outermost framed unit exchanged over the stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    Request(Request),
    Response(Response),
}

impl Envelope {
    /// The correlation id this envelope carries, whichever side it is.
    pub fn id(&self) -> RequestId {
        match self {
            Envelope::Request(request) => request.id,
            Envelope::Response(response) => response.id,
        }
    }
}
