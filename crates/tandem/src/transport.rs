//! The transport facade and its I/O loops.
//!
//! Architecture:
//! - one receive loop task owning the read half, routing inbound frames
//! - one send loop task owning the write half, draining the outgoing queue
//! - a bounded executor invoking the [`RequestProcessor`] for peer requests
//!
//! Responses are correlated to callers by request id through the pending
//! table. The stream has exactly one reader and one writer, so frames never
//! interleave and the I/O layer needs no locking. A dead stream fails every
//! outstanding call exactly once.

use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Semaphore, mpsc, oneshot};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::codec::EnvelopeCodec;
use crate::error::TransportError;
use crate::pending::PendingRequestTable;
use crate::processor::RequestProcessor;
use crate::protocol::{Envelope, Request, RequestId, Response};

/// Invoked exactly once when fatal teardown runs, with the cause.
pub type TerminationHook = Box<dyn FnOnce(TransportError) + Send>;

/// Construction-time knobs for [`MessageTransport`].
pub struct TransportConfig {
    /// Maximum number of inbound requests handled concurrently.
    pub request_workers: usize,
    /// Hook observing fatal teardown.
    pub on_termination: Option<TerminationHook>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            request_workers: 4,
            on_termination: None,
        }
    }
}

/// One unit of outgoing work for the send loop.
enum SendItem {
    /// An outbound request somebody is waiting on; a write failure must
    /// fail that specific caller.
    AwaitingReply { id: RequestId, envelope: Envelope },
    /// A reply to a peer-initiated request; no one observes a write failure.
    FireAndForget(Envelope),
}

/// State shared between the facade and its loops.
struct Shared {
    table: PendingRequestTable,
    cancel: CancellationToken,
    on_termination: StdMutex<Option<TerminationHook>>,
}

impl Shared {
    /// One-time fatal teardown: close the table, fail every outstanding
    /// request with `cause`, fire the termination hook, stop both loops.
    fn tear_down(&self, cause: TransportError) {
        if !self.table.close_and_fail_all(cause.clone()) {
            return;
        }
        tracing::debug!(%cause, "transport tearing down");
        let hook = match self.on_termination.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(hook) = hook {
            hook(cause);
        }
        self.cancel.cancel();
    }
}

/// Duplex request/response transport over a single byte stream.
///
/// Live from construction: `new` spawns the receive loop, the send loop,
/// and the inbound-request dispatcher. Callers issue requests with
/// [`execute_request`](Self::execute_request) and the peer's unsolicited
/// requests are fed to the supplied [`RequestProcessor`]. Share across
/// tasks behind an [`Arc`].
///
/// Dropping the transport (or calling [`shutdown`](Self::shutdown)) fails
/// every outstanding call; the transport is never reconnected.
pub struct MessageTransport {
    next_id: AtomicU64,
    outgoing_tx: mpsc::UnboundedSender<SendItem>,
    shared: Arc<Shared>,
}

impl MessageTransport {
    /// Start a transport over the given stream halves with default config.
    pub fn new<R, W, P>(reader: R, writer: W, processor: P) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
        P: RequestProcessor,
    {
        Self::with_config(reader, writer, processor, TransportConfig::default())
    }

    pub fn with_config<R, W, P>(
        reader: R,
        writer: W,
        processor: P,
        config: TransportConfig,
    ) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
        P: RequestProcessor,
    {
        let shared = Arc::new(Shared {
            table: PendingRequestTable::new(),
            cancel: CancellationToken::new(),
            on_termination: StdMutex::new(config.on_termination),
        });

        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        tokio::spawn(send_loop(
            FramedWrite::new(writer, EnvelopeCodec::new()),
            outgoing_rx,
            Arc::clone(&shared),
        ));
        tokio::spawn(receive_loop(
            FramedRead::new(reader, EnvelopeCodec::new()),
            inbound_tx,
            Arc::clone(&shared),
        ));
        tokio::spawn(dispatch_inbound(
            inbound_rx,
            Arc::new(processor),
            outgoing_tx.clone(),
            config.request_workers,
        ));

        Self {
            next_id: AtomicU64::new(1),
            outgoing_tx,
            shared,
        }
    }

    /// Issue an asynchronous request to the peer.
    ///
    /// The pending entry is registered before the frame is queued for
    /// sending, so a reply can never arrive ahead of its registration. The
    /// calling task is never blocked here; it blocks only by awaiting the
    /// returned future. Once the transport has torn down, the returned
    /// future is already failed and the stream is not touched.
    pub fn execute_request(
        &self,
        service: impl Into<String>,
        payload: serde_json::Value,
    ) -> ResponseFuture {
        let id = RequestId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (resolver, waiter) = oneshot::channel();

        if let Err(e) = self.shared.table.register(id, resolver) {
            return ResponseFuture::failed(e);
        }

        let envelope = Envelope::Request(Request {
            id,
            service: service.into(),
            payload,
        });
        if self
            .outgoing_tx
            .send(SendItem::AwaitingReply { id, envelope })
            .is_err()
        {
            // Send loop already gone; undo the registration so the entry
            // does not park forever.
            if let Some(pending) = self.shared.table.remove(id) {
                pending.resolve(Err(TransportError::closed("send queue closed")));
            }
        } else {
            tracing::debug!(%id, "queued outbound request");
        }

        ResponseFuture::waiting(waiter)
    }

    /// True once fatal teardown has run.
    pub fn is_closed(&self) -> bool {
        self.shared.table.is_closed()
    }

    /// Tear the transport down: fail outstanding calls and stop both loops.
    /// Idempotent.
    pub fn shutdown(&self) {
        self.shared.tear_down(TransportError::closed("transport shut down"));
    }
}

impl Drop for MessageTransport {
    fn drop(&mut self) {
        // Outstanding callers must not hang on a transport no one can drive.
        self.shared.tear_down(TransportError::closed("transport dropped"));
    }
}

/// Future returned by [`MessageTransport::execute_request`].
pub struct ResponseFuture {
    state: FutureState,
}

enum FutureState {
    /// Failed before it was ever queued (transport closed, id collision).
    Failed(Option<TransportError>),
    Waiting(oneshot::Receiver<Result<Response, TransportError>>),
}

impl ResponseFuture {
    fn failed(cause: TransportError) -> Self {
        Self {
            state: FutureState::Failed(Some(cause)),
        }
    }

    fn waiting(waiter: oneshot::Receiver<Result<Response, TransportError>>) -> Self {
        Self {
            state: FutureState::Waiting(waiter),
        }
    }
}

impl Future for ResponseFuture {
    type Output = Result<Response, TransportError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().state {
            FutureState::Failed(cause) => Poll::Ready(Err(cause
                .take()
                .unwrap_or_else(|| TransportError::closed("result already taken")))),
            FutureState::Waiting(waiter) => Pin::new(waiter).poll(cx).map(|recv| match recv {
                Ok(result) => result,
                // The table always resolves before dropping an entry, so
                // this only fires if the whole runtime is being torn down.
                Err(_) => Err(TransportError::closed("transport dropped the request")),
            }),
        }
    }
}

/// Drains the outgoing queue onto the write half, one frame at a time.
///
/// A write failure fails the one caller waiting on that item (if any) and
/// the loop keeps going; only queue closure or shutdown stops it.
async fn send_loop<W>(
    mut sink: FramedWrite<W, EnvelopeCodec>,
    mut outgoing_rx: mpsc::UnboundedReceiver<SendItem>,
    shared: Arc<Shared>,
) where
    W: AsyncWrite + Send + Unpin + 'static,
{
    loop {
        let item = tokio::select! {
            biased;

            _ = shared.cancel.cancelled() => break,
            item = outgoing_rx.recv() => match item {
                Some(item) => item,
                None => break,
            },
        };

        match item {
            SendItem::AwaitingReply { id, envelope } => {
                if let Err(e) = sink.send(envelope).await {
                    tracing::warn!(%id, error = %e, "write failed; failing the waiting caller");
                    if let Some(pending) = shared.table.remove(id) {
                        pending.resolve(Err(TransportError::WriteFailed {
                            id,
                            reason: e.to_string(),
                        }));
                    }
                }
            }
            SendItem::FireAndForget(envelope) => {
                if let Err(e) = sink.send(envelope).await {
                    tracing::warn!(error = %e, "dropping undeliverable response");
                }
            }
        }
    }
    tracing::debug!("send loop exiting");
}

/// Reads one frame at a time from the read half and routes it.
///
/// Termination, whatever the cause, always runs teardown.
async fn receive_loop<R>(
    mut frames: FramedRead<R, EnvelopeCodec>,
    inbound_tx: mpsc::UnboundedSender<Request>,
    shared: Arc<Shared>,
) where
    R: AsyncRead + Send + Unpin + 'static,
{
    let cause = loop {
        let frame = tokio::select! {
            biased;

            _ = shared.cancel.cancelled() => break TransportError::closed("transport shut down"),
            frame = frames.next() => frame,
        };

        match frame {
            Some(Ok(Envelope::Response(response))) => match shared.table.remove(response.id) {
                Some(pending) => pending.resolve(Ok(response)),
                // Benign race: the entry was already resolved, or the id is
                // simply unknown.
                None => {
                    tracing::debug!(id = %response.id, "discarding response with no pending request")
                }
            },
            Some(Ok(Envelope::Request(request))) => {
                tracing::debug!(id = %request.id, service = %request.service, "inbound request");
                if inbound_tx.send(request).is_err() {
                    break TransportError::closed("request executor stopped");
                }
            }
            Some(Err(e)) => {
                tracing::error!(error = %e, "stream read failed");
                break TransportError::closed(format!("stream read failed: {e}"));
            }
            None => break TransportError::closed("stream closed by peer"),
        }
    };

    shared.tear_down(cause);
    tracing::debug!("receive loop exiting");
}

/// Runs the [`RequestProcessor`] for inbound requests, at most
/// `request_workers` at a time, so one slow handler never stalls the
/// receive loop.
async fn dispatch_inbound(
    mut inbound_rx: mpsc::UnboundedReceiver<Request>,
    processor: Arc<dyn RequestProcessor>,
    outgoing_tx: mpsc::UnboundedSender<SendItem>,
    request_workers: usize,
) {
    let limit = Arc::new(Semaphore::new(request_workers.max(1)));

    while let Some(request) = inbound_rx.recv().await {
        let Ok(permit) = Arc::clone(&limit).acquire_owned().await else {
            break;
        };
        let processor = Arc::clone(&processor);
        let outgoing_tx = outgoing_tx.clone();
        tokio::spawn(async move {
            let _permit = permit;
            let id = request.id;
            match processor.execute(request).await {
                Ok(payload) => {
                    let reply = Envelope::Response(Response { id, payload });
                    let _ = outgoing_tx.send(SendItem::FireAndForget(reply));
                }
                Err(e) => {
                    // TODO: send an application-level error response instead
                    // of going silent; today the peer's call never resolves.
                    tracing::warn!(%id, error = %e, "request handler failed; dropping request without a reply");
                }
            }
        });
    }
    tracing::debug!("request dispatcher exiting");
}
