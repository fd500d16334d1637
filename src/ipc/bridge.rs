use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{AppError, AppResult};

/// Client half of the line-delimited envelope protocol: sends `{id, type,
/// payload}` requests and pairs incoming `{id, result}` lines back to the
/// awaiting caller. At most one waiter ever receives a given id.
pub struct BridgeClient {
    outbound: mpsc::UnboundedSender<String>,
    pending: Arc<Mutex<HashMap<String, oneshot::Sender<Value>>>>,
}

impl BridgeClient {
    pub fn new(outbound: mpsc::UnboundedSender<String>) -> Self {
        BridgeClient {
            outbound,
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Send one request and await its correlated result. Fails synchronously
    /// with `BRIDGE/UNAVAILABLE` when the transport is already gone, so
    /// callers never hang on a dead channel.
    pub async fn request(&self, kind: &str, payload: Value) -> AppResult<Value> {
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.clone(), tx);

        let line = json!({ "id": id, "type": kind, "payload": payload }).to_string();
        if self.outbound.send(line).is_err() {
            self.pending
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&id);
            return Err(AppError::new(
                "BRIDGE/UNAVAILABLE",
                "Bridge transport is closed",
            )
            .with_context("type", kind.to_string()));
        }

        rx.await.map_err(|_| {
            AppError::new("BRIDGE/CLOSED", "Bridge closed before the response arrived")
                .with_context("type", kind.to_string())
        })
    }

    /// Feed one raw incoming line. Unknown or repeated ids are logged and
    /// dropped; they never disturb other waiters.
    pub fn resolve(&self, raw: &str) {
        let value: Value = match serde_json::from_str(raw) {
            Ok(v) => v,
            Err(e) => {
                warn!(target = "daftar", event = "bridge_parse_failed", error = %e);
                return;
            }
        };
        let Some(id) = value.get("id").and_then(Value::as_str) else {
            debug!(target = "daftar", event = "bridge_line_without_id");
            return;
        };
        let waiter = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
        match waiter {
            Some(tx) => {
                let result = value.get("result").cloned().unwrap_or(Value::Null);
                // The waiter may have been dropped on timeout; that is fine.
                let _ = tx.send(result);
            }
            None => {
                debug!(target = "daftar", event = "bridge_orphan_response", id = id);
            }
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn request_resolves_with_matching_id() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let client = Arc::new(BridgeClient::new(tx));

        let requester = {
            let client = client.clone();
            tokio::spawn(async move { client.request("PING", Value::Null).await })
        };

        let line = rx.recv().await.unwrap();
        let envelope: Value = serde_json::from_str(&line).unwrap();
        let id = envelope["id"].as_str().unwrap().to_string();
        assert_eq!(envelope["type"], "PING");

        client.resolve(&json!({ "id": id, "result": { "pong": true } }).to_string());

        let result = requester.await.unwrap().unwrap();
        assert_eq!(result["pong"], true);
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn closed_transport_fails_synchronously() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let client = BridgeClient::new(tx);

        let err = client.request("PING", Value::Null).await.unwrap_err();
        assert_eq!(err.code(), "BRIDGE/UNAVAILABLE");
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn orphan_and_malformed_lines_are_ignored() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let client = BridgeClient::new(tx);

        client.resolve("{not json");
        client.resolve(&json!({ "result": 1 }).to_string());
        client.resolve(&json!({ "id": "never-sent", "result": 1 }).to_string());
        assert_eq!(client.pending_count(), 0);
    }
}
