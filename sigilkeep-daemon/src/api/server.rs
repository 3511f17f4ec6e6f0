//! JSON-RPC server implementation with Unix socket support.
//!
//! Requests and responses are single-line JSON documents. Parameters may be
//! positional (`["${vault:db}"]`) or named (`{"reference": "${vault:db}"}`).

use super::handlers::{ApiState, SigilkeepApiImpl, SigilkeepApiServer, internal_error};
use anyhow::{Context, Result};
use jsonrpsee::core::RpcResult;
use jsonrpsee::types::{ErrorCode, ErrorObject};
use serde::Serialize;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Handle to a running RPC server
pub struct ServerHandle {
    shutdown: Arc<Mutex<Option<tokio::sync::mpsc::Sender<()>>>>,
    join_handle: Arc<Mutex<Option<JoinHandle<()>>>>,
}

/// Start the JSON-RPC server on a Unix socket.
///
/// A stale socket file at `socket_path` is removed first. The caller removes
/// the socket after [`ServerHandle::stop`].
pub async fn start_server(socket_path: &Path, state: ApiState) -> Result<ServerHandle> {
    if socket_path.exists() {
        warn!("Removing existing socket at {:?}", socket_path);
        std::fs::remove_file(socket_path)
            .with_context(|| format!("Failed to remove existing socket at {:?}", socket_path))?;
    }

    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create socket directory {:?}", parent))?;
    }

    info!("Starting JSON-RPC server on {:?}", socket_path);

    let listener = UnixListener::bind(socket_path)
        .with_context(|| format!("Failed to bind Unix socket at {:?}", socket_path))?;

    let api = Arc::new(SigilkeepApiImpl::new(state));

    let (tx, mut rx) = tokio::sync::mpsc::channel::<()>(1);

    let server_task: JoinHandle<()> = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = rx.recv() => {
                    debug!("Server shutdown signal received");
                    break;
                }
                result = listener.accept() => {
                    match result {
                        Ok((stream, _addr)) => {
                            let api = api.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, api).await {
                                    warn!("Connection handler error: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            warn!("Failed to accept connection: {}", e);
                        }
                    }
                }
            }
        }
    });

    info!("JSON-RPC server started and listening");

    Ok(ServerHandle {
        shutdown: Arc::new(Mutex::new(Some(tx))),
        join_handle: Arc::new(Mutex::new(Some(server_task))),
    })
}

async fn handle_connection(mut stream: UnixStream, api: Arc<SigilkeepApiImpl>) -> Result<()> {
    let (reader, mut writer) = stream.split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        line.clear();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            break;
        }
        if line.trim().is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<Value>(&line) {
            Ok(request) => process_request(request, &api).await,
            Err(e) => serde_json::json!({
                "jsonrpc": "2.0",
                "error": {
                    "code": ErrorCode::ParseError.code(),
                    "message": format!("Parse error: {}", e)
                },
                "id": null
            }),
        };

        writer.write_all(response.to_string().as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
    }

    Ok(())
}

/// Process one JSON-RPC request and build its response document.
async fn process_request(request: Value, api: &SigilkeepApiImpl) -> Value {
    let id = request.get("id").cloned().unwrap_or(Value::Null);
    let Some(method) = request.get("method").and_then(Value::as_str) else {
        return serde_json::json!({
            "jsonrpc": "2.0",
            "error": {
                "code": ErrorCode::InvalidRequest.code(),
                "message": "Invalid Request: missing method"
            },
            "id": id
        });
    };
    debug!(method, "Received request");

    let params = request.get("params").cloned().unwrap_or(Value::Array(vec![]));
    let params = Params(&params);

    let result = match method {
        "resolve" => match params.string(0, "reference") {
            Some(reference) => to_value(api.resolve(reference).await),
            None => Err(invalid_params()),
        },
        "store" => match (params.string(0, "reference"), params.string(1, "value")) {
            (Some(reference), Some(value)) => to_value(api.store(reference, value).await),
            _ => Err(invalid_params()),
        },
        "invalidate" => match (params.string(0, "backend"), params.string(1, "name")) {
            (Some(backend), Some(name)) => to_value(api.invalidate(backend, name).await),
            _ => Err(invalid_params()),
        },
        "request_lease" => match (params.string(0, "backend"), params.string(1, "role")) {
            (Some(backend), Some(role)) => to_value(api.request_lease(backend, role).await),
            _ => Err(invalid_params()),
        },
        "renew_lease" => match params.string(0, "lease_id") {
            Some(lease_id) => to_value(api.renew_lease(lease_id).await),
            None => Err(invalid_params()),
        },
        "revoke_lease" => match params.string(0, "lease_id") {
            Some(lease_id) => to_value(api.revoke_lease(lease_id).await),
            None => Err(invalid_params()),
        },
        "list_leases" => to_value(api.list_leases().await),
        "health" => to_value(api.health().await),
        _ => Err(ErrorObject::owned(
            ErrorCode::MethodNotFound.code(),
            "Method not found",
            None::<()>,
        )),
    };

    match result {
        Ok(value) => serde_json::json!({
            "jsonrpc": "2.0",
            "result": value,
            "id": id
        }),
        Err(error) => {
            let mut body = serde_json::json!({
                "code": error.code(),
                "message": error.message()
            });
            if let Some(data) = error.data() {
                if let Ok(data) = serde_json::from_str::<Value>(data.get()) {
                    body["data"] = data;
                }
            }
            serde_json::json!({
                "jsonrpc": "2.0",
                "error": body,
                "id": id
            })
        }
    }
}

/// Request parameters, positional or named.
struct Params<'a>(&'a Value);

impl Params<'_> {
    fn string(&self, index: usize, name: &str) -> Option<String> {
        let value = match self.0 {
            Value::Array(items) => items.get(index),
            Value::Object(fields) => fields.get(name),
            _ => None,
        };
        value.and_then(Value::as_str).map(str::to_string)
    }
}

fn to_value<T: Serialize>(result: RpcResult<T>) -> RpcResult<Value> {
    result.and_then(|resp| serde_json::to_value(resp).map_err(internal_error))
}

fn invalid_params() -> ErrorObject<'static> {
    ErrorObject::owned(ErrorCode::InvalidParams.code(), "Invalid params", None::<()>)
}

impl ServerHandle {
    /// Stop accepting connections and wait for the accept loop to exit.
    pub async fn stop(&self) -> Result<()> {
        if let Some(tx) = self.shutdown.lock().await.take() {
            let _ = tx.send(()).await;
        }

        if let Some(handle) = self.join_handle.lock().await.take() {
            handle.await?;
        }

        Ok(())
    }

    /// Whether [`stop`](Self::stop) has completed or is in progress.
    pub async fn is_stopped(&self) -> bool {
        self.shutdown.lock().await.is_none()
    }
}
