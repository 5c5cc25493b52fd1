//! Line-delimited TCP API.
//!
//! Each accepted connection gets one request line. JSON payloads go
//! through the action dispatcher; anything else is parsed as a text
//! command. `SUBSCRIBE` hands the connection to the hub; every other
//! request replies once and closes.

use std::path::Path;
use std::sync::Arc;

use serde_json::Value as JsonValue;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::core::data::VarId;
use crate::core::error::{GatewayError, Result};
use crate::gateway::config::ConfigController;
use crate::gateway::hub::SubscriptionHub;
use crate::store::DataCache;

/// Request-phase handler for client connections.
pub struct TcpServer {
    cache: Arc<DataCache>,
    hub: Arc<SubscriptionHub>,
    controller: Arc<ConfigController>,
}

impl TcpServer {
    /// Create a server over the shared components.
    pub fn new(
        cache: Arc<DataCache>,
        hub: Arc<SubscriptionHub>,
        controller: Arc<ConfigController>,
    ) -> Self {
        Self {
            cache,
            hub,
            controller,
        }
    }

    /// Accept clients until `shutdown` flips. Each connection is served
    /// on its own task so a slow client never blocks the acceptor.
    pub async fn run(&self, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, "tcp server listening");
        }

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            debug!(%peer, "client connected");
                            let cache = Arc::clone(&self.cache);
                            let hub = Arc::clone(&self.hub);
                            let controller = Arc::clone(&self.controller);
                            tokio::spawn(async move {
                                if let Err(e) =
                                    serve_client(stream, cache, hub, controller).await
                                {
                                    debug!(%peer, error = %e, "client handling error");
                                }
                            });
                        }
                        Err(e) => error!(error = %e, "accept failed"),
                    }
                }
            }
        }

        info!("tcp server stopped");
    }
}

/// Handle one connection: read the request line, dispatch, reply.
async fn serve_client(
    mut stream: TcpStream,
    cache: Arc<DataCache>,
    hub: Arc<SubscriptionHub>,
    controller: Arc<ConfigController>,
) -> Result<()> {
    let mut line = String::new();
    {
        let mut reader = BufReader::new(&mut stream);
        reader.read_line(&mut line).await?;
    }
    let request = line.trim_end();

    if let Ok(json) = serde_json::from_str::<JsonValue>(request) {
        let response = handle_json_request(&json, &cache, &controller).await;
        stream
            .write_all(format!("{response}\n").as_bytes())
            .await?;
        return Ok(());
    }

    let mut parts = request.split_whitespace();
    match parts.next() {
        Some("GET_ALL") => {
            let snapshot = cache.snapshot_all();
            stream
                .write_all(format!("{snapshot}\n").as_bytes())
                .await?;
        }
        Some("GET_HISTORY") => {
            let parsed = parts
                .next()
                .and_then(|t| t.parse::<VarId>().ok())
                .zip(parts.next().and_then(|t| t.parse::<usize>().ok()));
            match parsed {
                Some((id, count)) => {
                    let history: Vec<JsonValue> = cache
                        .history_of(id, count)
                        .iter()
                        .map(|s| s.compact())
                        .collect();
                    let body = JsonValue::Array(history);
                    stream.write_all(format!("{body}\n").as_bytes()).await?;
                }
                None => {
                    stream
                        .write_all(b"{\"error\": \"Invalid variable ID\"}\n")
                        .await?;
                    return Err(GatewayError::ClientRequest(format!(
                        "bad GET_HISTORY arguments: {request}"
                    )));
                }
            }
        }
        Some("GET_CONFIG") => {
            let body = controller.config_pretty()?;
            stream.write_all(format!("{body}\n").as_bytes()).await?;
        }
        Some("SAVE_CONFIG") => {
            let path = parts.next().map(Path::new);
            let reply = match controller.save(path) {
                Ok(()) => {
                    serde_json::json!({"status": "success", "message": "Configuration saved"})
                }
                Err(e) => {
                    serde_json::json!({"status": "error", "message": e.to_string()})
                }
            };
            stream.write_all(format!("{reply}\n").as_bytes()).await?;
        }
        Some("SUBSCRIBE") => match parts.next().map(str::parse::<VarId>) {
            Some(Ok(id)) => {
                // The hub now owns the connection; push frames flow until
                // the client goes away.
                hub.subscribe(id, stream).await?;
            }
            _ => {
                stream
                    .write_all(b"{\"error\": \"Invalid variable ID format\"}\n")
                    .await?;
                return Err(GatewayError::ClientRequest(format!(
                    "bad SUBSCRIBE id: {request}"
                )));
            }
        },
        _ => {
            stream
                .write_all(b"{\"error\": \"Unknown command\"}\n")
                .await?;
            return Err(GatewayError::ClientRequest(format!(
                "unknown command: {request}"
            )));
        }
    }

    Ok(())
}

/// Dispatch a JSON request by its `action` key.
///
/// Unknown or absent actions and malformed parameters yield an empty
/// object; clients depending on the legacy behavior keep working.
async fn handle_json_request(
    request: &JsonValue,
    cache: &DataCache,
    controller: &ConfigController,
) -> JsonValue {
    let Some(action) = request.get("action").and_then(|a| a.as_str()) else {
        return serde_json::json!({});
    };

    match action {
        "get_all" => cache.snapshot_all(),
        "get_history" => {
            let Some(id) = request.get("variable_id").and_then(|v| v.as_i64()) else {
                return serde_json::json!({});
            };
            let count = request
                .get("count")
                .and_then(|v| v.as_u64())
                .unwrap_or(10) as usize;
            let history: Vec<JsonValue> = cache
                .history_of(id, count)
                .iter()
                .map(|s| s.compact())
                .collect();
            JsonValue::Array(history)
        }
        "get_config" => controller.config(),
        "save_config" => {
            let filename = request
                .get("filename")
                .and_then(|v| v.as_str())
                .filter(|s| !s.is_empty());
            match controller.save(filename.map(Path::new)) {
                Ok(()) => serde_json::json!({
                    "status": "success",
                    "message": "Configuration saved successfully"
                }),
                Err(e) => serde_json::json!({
                    "status": "error",
                    "message": e.to_string()
                }),
            }
        }
        "update_config" => {
            let Some(config) = request.get("config") else {
                return serde_json::json!({
                    "status": "error",
                    "message": "missing config"
                });
            };
            match controller.apply_update(config.clone()).await {
                Ok(()) => serde_json::json!({
                    "status": "success",
                    "message": "Configuration updated and saved"
                }),
                Err(e) => serde_json::json!({
                    "status": "error",
                    "message": e.to_string()
                }),
            }
        }
        "get_id_map" => controller.id_map(),
        _ => serde_json::json!({}),
    }
}
