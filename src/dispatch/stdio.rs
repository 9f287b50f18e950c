//! Stdio front door - newline-delimited JSON-RPC over stdin/stdout
//!
//! Requests are handled concurrently; responses funnel through one writer
//! task so lines never interleave. The loop also closes the sampling relay:
//! a child server's `sampling/createMessage` becomes a gateway-originated
//! request to the client, and the client's response (a frame with an id and
//! no method) resolves the relay's pending table.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use crate::dispatch::dispatcher::Dispatcher;
use crate::error::{PmlError, Result};
use crate::mux::SamplingHandler;
use crate::rpc::{Frame, JsonRpcResponse};

/// How long a relayed sampling exchange may wait on the client.
const SAMPLING_TIMEOUT: Duration = Duration::from_secs(60);

/// Cadence of `heartbeat` / `metrics.snapshot` events.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Outbound line-channel capacity.
const OUT_CHANNEL_CAPACITY: usize = 256;

/// Relays child sampling requests to the connected client.
pub struct ClientSamplingRelay {
    out_tx: mpsc::Sender<String>,
    pending: DashMap<u64, oneshot::Sender<JsonRpcResponse>>,
    next_id: AtomicU64,
}

impl ClientSamplingRelay {
    pub fn new(out_tx: mpsc::Sender<String>) -> Self {
        Self {
            out_tx,
            pending: DashMap::new(),
            // High base keeps relay ids visually distinct from client ids
            next_id: AtomicU64::new(1_000_000),
        }
    }

    /// Resolve a client response against the pending table. Unknown ids are
    /// dropped (the exchange timed out).
    pub fn complete(&self, response: JsonRpcResponse) {
        let Some(id) = response.id_u64() else {
            return;
        };
        if let Some((_, tx)) = self.pending.remove(&id) {
            let _ = tx.send(response);
        }
    }
}

#[async_trait]
impl SamplingHandler for ClientSamplingRelay {
    async fn create_message(&self, server_id: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);

        let request = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": "sampling/createMessage",
            "params": { "serverId": server_id, "request": params },
        });

        if self.out_tx.send(request.to_string()).await.is_err() {
            self.pending.remove(&id);
            return Err(PmlError::SamplingNotSupported {
                server_id: server_id.to_string(),
            });
        }

        let response = match tokio::time::timeout(SAMPLING_TIMEOUT, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) | Err(_) => {
                self.pending.remove(&id);
                return Err(PmlError::Timeout {
                    operation: "sampling relay".to_string(),
                    duration_ms: SAMPLING_TIMEOUT.as_millis() as u64,
                });
            }
        };

        if let Some(error) = response.error {
            return Err(PmlError::ToolCallFailed {
                server_id: server_id.to_string(),
                tool: "sampling/createMessage".to_string(),
                reason: error.message,
                error_code: Some(error.code),
            });
        }
        Ok(response.result.unwrap_or(Value::Null))
    }
}

/// Serve the gateway over stdio until EOF.
pub async fn serve_stdio(dispatcher: Dispatcher) -> Result<()> {
    let (out_tx, mut out_rx) = mpsc::channel::<String>(OUT_CHANNEL_CAPACITY);

    // Single writer task: whole-line writes, no interleaving
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(line) = out_rx.recv().await {
            if stdout.write_all(line.as_bytes()).await.is_err() {
                break;
            }
            if stdout.write_all(b"\n").await.is_err() {
                break;
            }
            if stdout.flush().await.is_err() {
                break;
            }
        }
    });

    let relay = Arc::new(ClientSamplingRelay::new(out_tx.clone()));
    dispatcher
        .gateway()
        .mux
        .set_sampling_handler(Arc::clone(&relay) as Arc<dyn SamplingHandler>);

    // Liveness: heartbeat + bus counters on a fixed cadence
    let heartbeat = {
        let bus = Arc::clone(&dispatcher.gateway().bus);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
            ticker.tick().await; // immediate first tick is not a heartbeat
            loop {
                ticker.tick().await;
                bus.publish(
                    "gateway",
                    crate::event::EventKind::Heartbeat {
                        uptime_ms: bus.uptime_ms(),
                    },
                );
                let stats = bus.stats();
                bus.publish(
                    "gateway",
                    crate::event::EventKind::MetricsSnapshot {
                        metrics: serde_json::to_value(&stats).unwrap_or(Value::Null),
                    },
                );
            }
        })
    };

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let value: Value = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "undecodable input line");
                continue;
            }
        };

        // Client responses feed the sampling relay; everything else is a
        // request for the dispatcher
        if let Some(Frame::Response(response)) = Frame::classify(value.clone()) {
            relay.complete(response);
            continue;
        }

        let dispatcher = dispatcher.clone();
        let out_tx = out_tx.clone();
        tokio::spawn(async move {
            if let Some(response) = dispatcher.dispatch(value).await {
                match serde_json::to_string(&response) {
                    Ok(serialized) => {
                        let _ = out_tx.send(serialized).await;
                    }
                    Err(e) => warn!(error = %e, "failed to serialize response"),
                }
            }
        });
    }

    info!("stdin EOF, shutting down");
    heartbeat.abort();
    drop(out_tx);
    // The relay keeps a sender alive, so the writer drains on a grace
    // period rather than channel close
    let mut writer = writer;
    let _ = tokio::time::timeout(Duration::from_millis(200), &mut writer).await;
    writer.abort();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn relay_round_trip() {
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let relay = Arc::new(ClientSamplingRelay::new(out_tx));

        let call = {
            let relay = Arc::clone(&relay);
            tokio::spawn(async move {
                relay
                    .create_message("db", json!({"prompt": "hello"}))
                    .await
            })
        };

        // The gateway writes the outbound request line
        let line = out_rx.recv().await.unwrap();
        let request: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(request["method"], "sampling/createMessage");
        assert_eq!(request["params"]["serverId"], "db");
        let id = request["id"].as_u64().unwrap();

        // The client answers
        relay.complete(JsonRpcResponse::success(
            json!(id),
            json!({"role": "assistant", "content": "hi"}),
        ));

        let result = call.await.unwrap().unwrap();
        assert_eq!(result["content"], "hi");
        assert!(relay.pending.is_empty());
    }

    #[tokio::test]
    async fn relay_error_response_propagates() {
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let relay = Arc::new(ClientSamplingRelay::new(out_tx));

        let call = {
            let relay = Arc::clone(&relay);
            tokio::spawn(async move { relay.create_message("db", json!({})).await })
        };

        let line = out_rx.recv().await.unwrap();
        let request: Value = serde_json::from_str(&line).unwrap();
        let id = request["id"].as_u64().unwrap();

        relay.complete(JsonRpcResponse::failure(
            json!(id),
            crate::rpc::JsonRpcError::new(-32601, "no sampling here"),
        ));

        let err = call.await.unwrap().unwrap_err();
        assert_eq!(err.code(), "PML-103");
    }

    #[tokio::test]
    async fn unknown_response_ids_are_dropped() {
        let (out_tx, _out_rx) = mpsc::channel(8);
        let relay = ClientSamplingRelay::new(out_tx);
        // Nothing pending: must not panic or grow state
        relay.complete(JsonRpcResponse::success(json!(42), json!({})));
        assert!(relay.pending.is_empty());
    }
}
