//! Pending-response table correlating requests with their responses.
//!
//! Every id registered here is removed exactly once: when its response
//! arrives, when its wait times out or is cancelled, when the table is torn
//! down, or when the waiting handle is dropped.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::{ComposerError, Result, TranslationError};
use crate::protocol::{JsonRpcResponse, RequestId};

type Slot = (u64, oneshot::Sender<Result<JsonRpcResponse>>);

/// Table of in-flight requests keyed by request id.
#[derive(Debug)]
pub struct PendingTable {
    name: String,
    entries: Mutex<HashMap<RequestId, Slot>>,
    seq: AtomicU64,
}

impl PendingTable {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            entries: Mutex::new(HashMap::new()),
            seq: AtomicU64::new(0),
        })
    }

    /// Register `id` before the request is forwarded.
    pub fn register(self: &Arc<Self>, id: RequestId) -> Result<PendingHandle> {
        let (tx, rx) = oneshot::channel();
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);

        let mut entries = self.entries.lock();
        if entries.contains_key(&id) {
            return Err(TranslationError::DuplicateId(id.to_string()).into());
        }
        entries.insert(id.clone(), (seq, tx));
        drop(entries);

        trace!(table = %self.name, id = %id, "Registered pending request");
        Ok(PendingHandle {
            id,
            seq,
            rx,
            table: Arc::clone(self),
        })
    }

    /// Deliver a response. Returns `false` if nobody was waiting for this id.
    pub fn resolve(&self, response: JsonRpcResponse) -> bool {
        let Some(id) = response.id.clone() else {
            return false;
        };
        match self.entries.lock().remove(&id) {
            Some((_, tx)) => {
                trace!(table = %self.name, id = %id, "Resolved pending request");
                let _ = tx.send(Ok(response));
                true
            }
            None => false,
        }
    }

    /// Fail every waiter with `Cancelled`. Returns how many were waiting.
    pub fn cancel_all(&self) -> usize {
        self.fail_all(|| ComposerError::Cancelled)
    }

    /// Fail every waiter with the error built by `make`.
    pub fn fail_all(&self, make: impl Fn() -> ComposerError) -> usize {
        let drained: Vec<_> = self.entries.lock().drain().collect();
        let count = drained.len();
        for (_, (_, tx)) in drained {
            let _ = tx.send(Err(make()));
        }
        if count > 0 {
            debug!(table = %self.name, count, "Failed outstanding requests");
        }
        count
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn contains(&self, id: &RequestId) -> bool {
        self.entries.lock().contains_key(id)
    }

    fn remove_if_current(&self, id: &RequestId, seq: u64) {
        let mut entries = self.entries.lock();
        if entries.get(id).is_some_and(|(current, _)| *current == seq) {
            entries.remove(id);
        }
    }
}

/// Waiting side of one registered request.
#[derive(Debug)]
pub struct PendingHandle {
    id: RequestId,
    seq: u64,
    rx: oneshot::Receiver<Result<JsonRpcResponse>>,
    table: Arc<PendingTable>,
}

impl PendingHandle {
    pub fn id(&self) -> &RequestId {
        &self.id
    }

    /// Wait for the response, the timeout, or cancellation.
    pub async fn wait(mut self, timeout: Duration, cancel: &CancellationToken) -> Result<JsonRpcResponse> {
        tokio::select! {
            result = &mut self.rx => match result {
                Ok(outcome) => outcome,
                Err(_) => Err(ComposerError::Cancelled),
            },
            _ = tokio::time::sleep(timeout) => {
                debug!(table = %self.table.name, id = %self.id, ?timeout, "Pending request timed out");
                Err(TranslationError::Timeout {
                    id: self.id.to_string(),
                    after: timeout,
                }
                .into())
            }
            _ = cancel.cancelled() => Err(ComposerError::Cancelled),
        }
    }
}

impl Drop for PendingHandle {
    fn drop(&mut self) {
        self.table.remove_if_current(&self.id, self.seq);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_resolve_delivers_response() {
        let table = PendingTable::new("test");
        let handle = table.register(RequestId::Number(1)).unwrap();
        assert!(table.resolve(JsonRpcResponse::success(RequestId::Number(1), json!({"ok": true}))));

        let response = handle
            .wait(Duration::from_secs(1), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(response.result, Some(json!({"ok": true})));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_response_is_not_delivered() {
        let table = PendingTable::new("test");
        assert!(!table.resolve(JsonRpcResponse::success(RequestId::Number(9), json!(null))));
    }

    #[tokio::test]
    async fn test_timeout_removes_entry() {
        let table = PendingTable::new("test");
        let handle = table.register(RequestId::from("a")).unwrap();
        assert_eq!(table.len(), 1);

        let err = handle
            .wait(Duration::from_millis(20), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ComposerError::Translation(TranslationError::Timeout { .. })
        ));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_all_wakes_waiters() {
        let table = PendingTable::new("test");
        let first = table.register(RequestId::Number(1)).unwrap();
        let second = table.register(RequestId::Number(2)).unwrap();

        assert_eq!(table.cancel_all(), 2);
        let token = CancellationToken::new();
        assert!(matches!(
            first.wait(Duration::from_secs(1), &token).await,
            Err(ComposerError::Cancelled)
        ));
        assert!(matches!(
            second.wait(Duration::from_secs(1), &token).await,
            Err(ComposerError::Cancelled)
        ));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_cancellation_token_stops_wait() {
        let table = PendingTable::new("test");
        let handle = table.register(RequestId::Number(1)).unwrap();
        let token = CancellationToken::new();
        token.cancel();
        assert!(matches!(
            handle.wait(Duration::from_secs(5), &token).await,
            Err(ComposerError::Cancelled)
        ));
        assert!(table.is_empty());
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let table = PendingTable::new("test");
        let _handle = table.register(RequestId::Number(1)).unwrap();
        let err = table.register(RequestId::Number(1)).unwrap_err();
        assert!(matches!(
            err,
            ComposerError::Translation(TranslationError::DuplicateId(_))
        ));
    }

    #[test]
    fn test_dropped_handle_does_not_remove_reused_id() {
        let table = PendingTable::new("test");
        let old = table.register(RequestId::Number(1)).unwrap();
        assert!(table.resolve(JsonRpcResponse::success(RequestId::Number(1), json!(1))));

        let _new = table.register(RequestId::Number(1)).unwrap();
        drop(old);
        assert!(table.contains(&RequestId::Number(1)));
    }
}
