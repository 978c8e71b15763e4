//! Line-delimited JSON request loop and lifecycle management
//!
//! Each input line is one request `{"id", "method", "params"}`; each
//! response is written as one line. Requests without an `id`, or methods
//! under `notifications/`, get no response.

use crate::config::DaemonConfig;
use crate::error::DaemonResult;
use recall_protocol_mcp::{
    parse_arguments, register_memory_toolset, McpAdapter, McpAdapterError, McpContent,
    McpToolCall, MemoryToolsetConfig,
};
use recall_store::MemoryCoordinator;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};

const PROTOCOL_VERSION: &str = "2024-11-05";

const PARSE_ERROR: i64 = -32700;
const METHOD_NOT_FOUND: i64 = -32601;
const INVALID_PARAMS: i64 = -32602;
const INTERNAL_ERROR: i64 = -32603;
const RESOURCE_NOT_FOUND: i64 = -32002;

#[derive(Debug, Deserialize)]
struct Request {
    #[serde(default)]
    id: Option<Value>,
    method: String,
    #[serde(default)]
    params: Value,
}

#[derive(Debug, Serialize)]
struct Response {
    jsonrpc: &'static str,
    id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<RpcError>,
}

#[derive(Debug, Serialize)]
struct RpcError {
    code: i64,
    message: String,
}

impl RpcError {
    fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl From<McpAdapterError> for RpcError {
    fn from(err: McpAdapterError) -> Self {
        let code = match &err {
            McpAdapterError::ToolNotFound(_) | McpAdapterError::PromptNotFound(_) => {
                INVALID_PARAMS
            }
            McpAdapterError::ResourceNotFound(_) => RESOURCE_NOT_FOUND,
            McpAdapterError::InvalidArguments(_) => INVALID_PARAMS,
            McpAdapterError::Store(store) if store.is_not_found() => RESOURCE_NOT_FOUND,
            McpAdapterError::Store(recall_store::StoreError::InvalidInput(_)) => INVALID_PARAMS,
            _ => INTERNAL_ERROR,
        };
        Self::new(code, err.to_string())
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(INTERNAL_ERROR, err.to_string())
    }
}

#[derive(Debug, Deserialize)]
struct ToolCallParams {
    name: String,
    #[serde(default)]
    arguments: Value,
}

#[derive(Debug, Deserialize)]
struct ReadParams {
    uri: String,
}

#[derive(Debug, Deserialize)]
struct PromptParams {
    name: String,
    #[serde(default)]
    arguments: Value,
}

/// Recall daemon server
pub struct Server {
    name: String,
    adapter: McpAdapter,
    coordinator: Arc<MemoryCoordinator>,
}

impl Server {
    /// Create a server around an already built coordinator.
    pub fn new(config: &DaemonConfig, coordinator: Arc<MemoryCoordinator>) -> Self {
        let mut adapter = McpAdapter::new();
        register_memory_toolset(
            &mut adapter,
            coordinator.clone(),
            MemoryToolsetConfig {
                default_limit: config.search.default_limit,
            },
        );
        Self {
            name: config.server.name.clone(),
            adapter,
            coordinator,
        }
    }

    /// Serve stdin/stdout until EOF or Ctrl-C.
    pub async fn run(self) -> DaemonResult<()> {
        tracing::info!(server = %self.name, "Serving requests on stdio");
        self.serve(
            BufReader::new(tokio::io::stdin()),
            tokio::io::stdout(),
            shutdown_signal(),
        )
        .await
    }

    /// Request loop over any line reader and writer. Closes the store on the
    /// way out.
    pub async fn serve<R, W, S>(&self, reader: R, mut writer: W, shutdown: S) -> DaemonResult<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
        S: Future<Output = ()>,
    {
        let mut lines = reader.lines();
        tokio::pin!(shutdown);

        let outcome = loop {
            tokio::select! {
                _ = &mut shutdown => break Ok(()),
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        if let Some(response) = self.handle_line(&line).await {
                            if let Err(err) = write_line(&mut writer, &response).await {
                                break Err(err);
                            }
                        }
                    }
                    Ok(None) => {
                        tracing::info!("Input closed");
                        break Ok(());
                    }
                    Err(err) => break Err(err),
                },
            }
        };

        tracing::info!("Recall daemon shutting down");
        self.coordinator.close().await?;
        outcome.map_err(Into::into)
    }

    /// Handle one input line; `None` when nothing should be written back.
    pub async fn handle_line(&self, line: &str) -> Option<String> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }

        let response = match serde_json::from_str::<Request>(line) {
            Ok(request) => {
                let is_notification =
                    request.id.is_none() || request.method.starts_with("notifications/");
                let result = self.dispatch(&request.method, request.params).await;
                if is_notification {
                    return None;
                }
                let id = request.id.unwrap_or(Value::Null);
                match result {
                    Ok(result) => Response {
                        jsonrpc: "2.0",
                        id,
                        result: Some(result),
                        error: None,
                    },
                    Err(error) => {
                        tracing::debug!(method = %request.method, code = error.code, error = %error.message, "Request failed");
                        Response {
                            jsonrpc: "2.0",
                            id,
                            result: None,
                            error: Some(error),
                        }
                    }
                }
            }
            Err(err) => Response {
                jsonrpc: "2.0",
                id: Value::Null,
                result: None,
                error: Some(RpcError::new(PARSE_ERROR, err.to_string())),
            },
        };

        match serde_json::to_string(&response) {
            Ok(encoded) => Some(encoded),
            Err(err) => {
                tracing::error!(error = %err, "Failed to encode response");
                None
            }
        }
    }

    async fn dispatch(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        match method {
            "initialize" => Ok(json!({
                "protocolVersion": PROTOCOL_VERSION,
                "serverInfo": {
                    "name": self.name,
                    "version": env!("CARGO_PKG_VERSION"),
                },
                "capabilities": {
                    "tools": {},
                    "resources": {},
                    "prompts": {},
                },
            })),
            "ping" => Ok(json!({})),
            "notifications/initialized" => Ok(Value::Null),
            "tools/list" => Ok(json!({ "tools": self.adapter.list_tools() })),
            "tools/call" => {
                let params: ToolCallParams = parse_arguments(&params)?;
                let (result, record) = self
                    .adapter
                    .call_tool(McpToolCall::new(params.name, params.arguments))
                    .await?;
                tracing::debug!(tool = %record.tool_name, success = record.success, "Tool call");
                Ok(serde_json::to_value(result)?)
            }
            "resources/list" => Ok(json!({ "resources": self.adapter.list_resources().await? })),
            "resources/templates/list" => Ok(json!({
                "resourceTemplates": self.adapter.list_resource_templates()
            })),
            "resources/read" => {
                let params: ReadParams = parse_arguments(&params)?;
                let content = self.adapter.read_resource(&params.uri).await?;
                let contents = match content {
                    McpContent::Resource { uri, text } => json!([{
                        "uri": uri,
                        "mimeType": "application/json",
                        "text": text,
                    }]),
                    McpContent::Text { text } => json!([{ "uri": params.uri, "text": text }]),
                };
                Ok(json!({ "contents": contents }))
            }
            "prompts/list" => Ok(json!({ "prompts": self.adapter.list_prompts() })),
            "prompts/get" => {
                let params: PromptParams = parse_arguments(&params)?;
                let rendered = self
                    .adapter
                    .get_prompt(&params.name, &params.arguments)
                    .await?;
                Ok(serde_json::to_value(rendered)?)
            }
            other => Err(RpcError::new(
                METHOD_NOT_FOUND,
                format!("Method not found: {other}"),
            )),
        }
    }
}

async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, line: &str) -> std::io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %err, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::warn!(error = %err, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        }
    }
}
