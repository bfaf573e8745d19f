//! tandem: duplex request/response transport over a single byte stream.
//!
//! Multiplexes asynchronous RPC-style calls over one duplex stream that is
//! shared with unsolicited inbound calls from the remote peer. Replies are
//! correlated to callers by request id, all writes funnel through a single
//! send loop, and a dead stream fails every outstanding call exactly once.

pub mod codec;
mod error;
mod pending;
mod processor;
pub mod protocol;
mod transport;

pub use codec::EnvelopeCodec;
pub use error::TransportError;
pub use processor::RequestProcessor;
pub use protocol::{Envelope, Request, RequestId, Response};
pub use transport::{MessageTransport, ResponseFuture, TerminationHook, TransportConfig};
