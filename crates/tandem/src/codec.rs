//! Length-delimited JSON framing for [`Envelope`]s.
//!
//! Each frame is a four-byte big-endian length prefix followed by one JSON
//! document. The length prefix makes message boundaries recoverable from any
//! split of the byte stream, which the receive loop depends on. Works over
//! any `AsyncRead`/`AsyncWrite` half (sockets, pipes, in-memory duplex).

use std::io;

use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::protocol::Envelope;

/// Frames above this size are treated as stream corruption rather than
/// buffered indefinitely.
const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Frames exactly one [`Envelope`] per length-prefixed JSON frame.
pub struct EnvelopeCodec {
    inner: LengthDelimitedCodec,
}

impl EnvelopeCodec {
    pub fn new() -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .length_field_length(4)
                .max_frame_length(MAX_FRAME_BYTES)
                .new_codec(),
        }
    }
}

impl Default for EnvelopeCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for EnvelopeCodec {
    type Item = Envelope;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Envelope>, io::Error> {
        let Some(frame) = self.inner.decode(src)? else {
            return Ok(None);
        };
        let envelope = serde_json::from_slice(&frame)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        Ok(Some(envelope))
    }
}

impl Encoder<Envelope> for EnvelopeCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Envelope, dst: &mut BytesMut) -> Result<(), io::Error> {
        let body = serde_json::to_vec(&item)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        tracing::trace!(frame_bytes = body.len(), "encoding frame");
        self.inner.encode(Bytes::from(body), dst)
    }
}
