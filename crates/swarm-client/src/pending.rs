//! Pending-request demultiplexer shared by the adapters.
//!
//! Requests register a oneshot sender under their id; the transport's
//! reader task resolves them as responses arrive. When the transport
//! dies, every waiter observes a dropped sender.

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::protocol::JsonRpcResponse;

/// Map of in-flight request ids to response channels.
#[derive(Default)]
pub(crate) struct PendingMap {
    inner: Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>,
}

impl PendingMap {
    /// Register a waiter for `id`.
    pub(crate) fn register(&self, id: u64) -> oneshot::Receiver<JsonRpcResponse> {
        let (tx, rx) = oneshot::channel();
        let _ = self.inner.lock().insert(id, tx);
        rx
    }

    /// Remove the waiter for `id` (timeout or send failure).
    pub(crate) fn forget(&self, id: u64) {
        let _ = self.inner.lock().remove(&id);
    }

    /// Resolve the waiter for `id`. Returns `false` if none was registered.
    pub(crate) fn resolve(&self, id: u64, response: JsonRpcResponse) -> bool {
        match self.inner.lock().remove(&id) {
            Some(tx) => tx.send(response).is_ok(),
            None => false,
        }
    }

    /// Drop every waiter; their receivers observe closure.
    pub(crate) fn fail_all(&self) {
        self.inner.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(id: u64) -> JsonRpcResponse {
        JsonRpcResponse {
            jsonrpc: "2.0".into(),
            id: Some(id),
            result: Some(serde_json::json!({})),
            error: None,
        }
    }

    #[tokio::test]
    async fn resolve_delivers_to_waiter() {
        let map = PendingMap::default();
        let rx = map.register(1);
        assert!(map.resolve(1, response(1)));
        let resp = rx.await.unwrap();
        assert_eq!(resp.id, Some(1));
    }

    #[tokio::test]
    async fn resolve_unknown_id_is_false() {
        let map = PendingMap::default();
        assert!(!map.resolve(99, response(99)));
    }

    #[tokio::test]
    async fn fail_all_closes_receivers() {
        let map = PendingMap::default();
        let rx = map.register(1);
        map.fail_all();
        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn forget_then_resolve_is_false() {
        let map = PendingMap::default();
        let _rx = map.register(2);
        map.forget(2);
        assert!(!map.resolve(2, response(2)));
    }
}
