//! Request/response correlation.
//!
//! One tracker per transport. Outbound requests take a monotonically
//! increasing integer id; the pending table maps that id to a oneshot
//! resolver. An entry leaves the table in exactly one of three ways:
//! the matching response arrives, the per-request timer fires, or a
//! disconnect cancels everything in flight.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;

use deechat_mcp_protocol::{JsonRpcResponse, JsonRpcResponsePayload, RequestId};

use crate::core::{TransportError, TransportResult};

type PendingSender = oneshot::Sender<Result<JsonRpcResponse, TransportError>>;

/// Pending-request table with monotonic id allocation
pub struct RequestTracker {
    next_id: AtomicI64,
    pending: Mutex<HashMap<i64, PendingSender>>,
}

impl std::fmt::Debug for RequestTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestTracker")
            .field("next_id", &self.next_id.load(Ordering::Relaxed))
            .field("pending", &self.pending.lock().len())
            .finish()
    }
}

impl Default for RequestTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestTracker {
    /// Create an empty tracker; ids start at 1
    pub fn new() -> Self {
        Self {
            next_id: AtomicI64::new(1),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Allocate an id and install the pending entry
    pub fn register(
        &self,
    ) -> (i64, oneshot::Receiver<Result<JsonRpcResponse, TransportError>>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);
        (id, rx)
    }

    /// Remove an entry without resolving it (send failed, timed out)
    pub fn discard(&self, id: i64) {
        self.pending.lock().remove(&id);
    }

    /// Route an inbound response to its waiter.
    ///
    /// Returns `false` for unknown, duplicate or non-numeric ids; the
    /// caller drops those with a debug log.
    pub fn resolve(&self, response: JsonRpcResponse) -> bool {
        let Some(id) = response.id.as_request_id().and_then(request_id_as_i64) else {
            return false;
        };
        let Some(sender) = self.pending.lock().remove(&id) else {
            return false;
        };
        // A dropped receiver means the waiter already timed out; that is
        // not an error here.
        sender.send(Ok(response)).is_ok()
    }

    /// Await a registered response with a deadline.
    ///
    /// On timeout the entry is removed so a late response is dropped on
    /// arrival rather than leaking table space.
    pub async fn wait(
        &self,
        id: i64,
        rx: oneshot::Receiver<Result<JsonRpcResponse, TransportError>>,
        timeout: Duration,
    ) -> TransportResult<Value> {
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(response))) => match response.payload {
                JsonRpcResponsePayload::Success { result } => Ok(result),
                JsonRpcResponsePayload::Error { error } => Err(TransportError::Rpc {
                    code: error.code,
                    message: error.message,
                    data: error.data,
                }),
            },
            Ok(Ok(Err(canceled))) => Err(canceled),
            Ok(Err(_closed)) => {
                self.discard(id);
                Err(TransportError::Canceled("request abandoned".to_string()))
            }
            Err(_elapsed) => {
                self.discard(id);
                Err(TransportError::Timeout)
            }
        }
    }

    /// Cancel every in-flight request with the given reason.
    ///
    /// Called on disconnect; each waiter observes a `Canceled` error.
    pub fn cancel_all(&self, reason: &str) {
        let drained: Vec<PendingSender> = {
            let mut pending = self.pending.lock();
            pending.drain().map(|(_, tx)| tx).collect()
        };
        for sender in drained {
            let _ = sender.send(Err(TransportError::Canceled(reason.to_string())));
        }
    }

    /// Number of in-flight requests
    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }
}

fn request_id_as_i64(id: &RequestId) -> Option<i64> {
    match id {
        RequestId::Number(n) => Some(*n),
        // Some servers echo numeric ids back as strings.
        RequestId::String(s) => s.parse().ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use deechat_mcp_protocol::JsonRpcResponse;
    use serde_json::json;

    #[tokio::test]
    async fn response_resolves_waiter_exactly_once() {
        let tracker = RequestTracker::new();
        let (id, rx) = tracker.register();
        assert_eq!(tracker.len(), 1);

        let response = JsonRpcResponse::success(json!({"ok": true}), RequestId::Number(id));
        assert!(tracker.resolve(response.clone()));
        assert_eq!(tracker.len(), 0);
        // Second delivery of the same id has nowhere to go.
        assert!(!tracker.resolve(response));

        let value = tracker.wait(id, rx, Duration::from_secs(1)).await.unwrap();
        assert_eq!(value, json!({"ok": true}));
    }

    #[tokio::test]
    async fn timeout_releases_the_pending_entry() {
        let tracker = RequestTracker::new();
        let before = tracker.len();
        let (id, rx) = tracker.register();

        let err = tracker
            .wait(id, rx, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Timeout));
        assert_eq!(tracker.len(), before, "table returns to its prior size");
    }

    #[tokio::test]
    async fn cancel_all_fails_waiters_with_reason() {
        let tracker = RequestTracker::new();
        let (id, rx) = tracker.register();
        tracker.cancel_all("transport disconnected");

        let err = tracker.wait(id, rx, Duration::from_secs(1)).await.unwrap_err();
        match err {
            TransportError::Canceled(reason) => assert_eq!(reason, "transport disconnected"),
            other => panic!("expected Canceled, got {other:?}"),
        }
        assert!(tracker.is_empty());
    }

    #[tokio::test]
    async fn rpc_error_payload_surfaces_as_rpc_error() {
        let tracker = RequestTracker::new();
        let (id, rx) = tracker.register();

        let response = JsonRpcResponse::error(
            deechat_mcp_protocol::JsonRpcError::method_not_found("nope"),
            RequestId::Number(id),
        );
        tracker.resolve(response);

        let err = tracker.wait(id, rx, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, TransportError::Rpc { code: -32601, .. }));
    }

    #[test]
    fn string_ids_parse_when_numeric() {
        let tracker = RequestTracker::new();
        let (id, _rx) = tracker.register();

        let response =
            JsonRpcResponse::success(json!(null), RequestId::String(id.to_string()));
        assert!(tracker.resolve(response));

        let unknown = JsonRpcResponse::success(json!(null), RequestId::String("abc".into()));
        assert!(!tracker.resolve(unknown));
    }

    #[test]
    fn ids_are_monotonic() {
        let tracker = RequestTracker::new();
        let (a, _rx_a) = tracker.register();
        let (b, _rx_b) = tracker.register();
        assert!(b > a);
    }
}
