//! Bookkeeping for in-flight outbound requests.
//!
//! One lock covers registration, removal, and close-all. Nothing slow runs
//! under it; resolution happens after the guard is dropped.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use tokio::sync::oneshot;

use crate::error::TransportError;
use crate::protocol::{RequestId, Response};

/// Completion side of one caller's wait, consumed on use.
pub(crate) type Resolver = oneshot::Sender<Result<Response, TransportError>>;

/// A registered, unresolved outbound request.
///
/// Exclusively owned by the table until resolution. Resolving consumes the
/// record, so delivering a second result is unrepresentable.
pub(crate) struct PendingRequest {
    id: RequestId,
    resolver: Resolver,
}

impl PendingRequest {
    pub(crate) fn resolve(self, result: Result<Response, TransportError>) {
        if self.resolver.send(result).is_err() {
            // The caller dropped its future; the result has nowhere to go.
            tracing::debug!(id = %self.id, "resolved request had no waiter");
        }
    }
}

/// Registry of in-flight requests, keyed by id.
pub(crate) struct PendingRequestTable {
    inner: Mutex<TableInner>,
}

struct TableInner {
    entries: HashMap<RequestId, PendingRequest>,
    closed: Option<TransportError>,
}

impl PendingRequestTable {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(TableInner {
                entries: HashMap::new(),
                closed: None,
            }),
        }
    }

    /// Register a pending request. Fails with the closed-cause once the
    /// table has been torn down, and rejects an id that is already in use.
    pub(crate) fn register(&self, id: RequestId, resolver: Resolver) -> Result<(), TransportError> {
        let mut inner = self.lock();
        if let Some(cause) = &inner.closed {
            return Err(cause.clone());
        }
        if inner.entries.contains_key(&id) {
            return Err(TransportError::IdCollision { id });
        }
        inner.entries.insert(id, PendingRequest { id, resolver });
        Ok(())
    }

    /// Atomic lookup-and-remove.
    pub(crate) fn remove(&self, id: RequestId) -> Option<PendingRequest> {
        self.lock().entries.remove(&id)
    }

    /// Close the table and fail every outstanding request with `cause`.
    ///
    /// Idempotent: only the first call performs the close (and returns
    /// true); later causes are dropped.
    pub(crate) fn close_and_fail_all(&self, cause: TransportError) -> bool {
        let drained: Vec<PendingRequest> = {
            let mut inner = self.lock();
            if inner.closed.is_some() {
                return false;
            }
            inner.closed = Some(cause.clone());
            inner.entries.drain().map(|(_, pending)| pending).collect()
        };

        if !drained.is_empty() {
            tracing::debug!(count = drained.len(), %cause, "failing outstanding requests");
        }
        for pending in drained {
            pending.resolve(Err(cause.clone()));
        }
        true
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.lock().closed.is_some()
    }

    fn lock(&self) -> MutexGuard<'_, TableInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn channel() -> (Resolver, oneshot::Receiver<Result<Response, TransportError>>) {
        oneshot::channel()
    }

    #[test]
    fn register_then_remove_returns_the_entry() {
        let table = PendingRequestTable::new();
        let (tx, _rx) = channel();

        table.register(RequestId::new(1), tx).unwrap();
        assert!(table.remove(RequestId::new(1)).is_some());
        assert!(table.remove(RequestId::new(1)).is_none());
    }

    #[test]
    fn remove_of_unknown_id_is_none() {
        let table = PendingRequestTable::new();
        assert!(table.remove(RequestId::new(42)).is_none());
    }

    #[test]
    fn duplicate_id_is_rejected() {
        let table = PendingRequestTable::new();
        let (tx1, _rx1) = channel();
        let (tx2, _rx2) = channel();

        table.register(RequestId::new(5), tx1).unwrap();
        let err = table.register(RequestId::new(5), tx2).unwrap_err();
        assert_eq!(
            err,
            TransportError::IdCollision {
                id: RequestId::new(5)
            }
        );
    }

    #[tokio::test]
    async fn close_fails_every_outstanding_entry_with_the_cause() {
        let table = PendingRequestTable::new();
        let mut waiters = Vec::new();
        for raw in 1..=3u64 {
            let (tx, rx) = channel();
            table.register(RequestId::new(raw), tx).unwrap();
            waiters.push(rx);
        }

        let cause = TransportError::closed("stream read failed");
        assert!(table.close_and_fail_all(cause.clone()));

        for rx in waiters {
            assert_eq!(rx.await.unwrap(), Err(cause.clone()));
        }
    }

    #[test]
    fn register_after_close_fails_with_the_original_cause() {
        let table = PendingRequestTable::new();
        let cause = TransportError::closed("peer hangup");
        table.close_and_fail_all(cause.clone());

        let (tx, _rx) = channel();
        assert_eq!(table.register(RequestId::new(1), tx).unwrap_err(), cause);
        assert!(table.is_closed());
    }

    #[test]
    fn second_close_is_a_no_op_and_first_cause_wins() {
        let table = PendingRequestTable::new();
        let first = TransportError::closed("first");

        assert!(table.close_and_fail_all(first.clone()));
        assert!(!table.close_and_fail_all(TransportError::closed("second")));

        let (tx, _rx) = channel();
        assert_eq!(table.register(RequestId::new(1), tx).unwrap_err(), first);
    }

    #[tokio::test]
    async fn resolving_a_removed_entry_reaches_its_waiter() {
        let table = PendingRequestTable::new();
        let (tx, rx) = channel();
        table.register(RequestId::new(8), tx).unwrap();

        let response = Response {
            id: RequestId::new(8),
            payload: json!("done"),
        };
        table
            .remove(RequestId::new(8))
            .unwrap()
            .resolve(Ok(response.clone()));

        assert_eq!(rx.await.unwrap(), Ok(response));
    }
}
