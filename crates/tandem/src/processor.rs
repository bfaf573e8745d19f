//! Handler seam for peer-initiated requests.

use async_trait::async_trait;

use crate::protocol::Request;

/// Application-supplied handler for requests initiated by the remote peer.
///
/// Invoked once per inbound request, off the receive loop, at most
/// `request_workers` at a time. The returned payload becomes the response
/// sent back under the request's id. An error drops the request without any
/// reply; the peer's call stays unresolved.
#[async_trait]
pub trait RequestProcessor: Send + Sync + 'static {
    async fn execute(&self, request: Request) -> anyhow::Result<serde_json::Value>;
}
