//! Model Context Protocol (MCP) Adapter for Recall
//!
//! This crate exposes the memory store engine to MCP clients. Every tool,
//! resource and prompt is bound to a `MemoryCoordinator` operation by explicit
//! registration; nothing is discovered implicitly.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                   MCP PROTOCOL ADAPTER                   │
//! ├──────────────────────────────────────────────────────────┤
//! │   ┌────────────┐   ┌──────────────┐   ┌──────────────┐   │
//! │   │ MCP Tools  │   │MCP Resources │   │ MCP Prompts  │   │
//! │   └─────┬──────┘   └──────┬───────┘   └──────┬───────┘   │
//! │         │                 │                  │           │
//! │         ▼                 ▼                  ▼           │
//! │   ┌──────────────────────────────────────────────────┐   │
//! │   │      Tool registry / providers / call history    │   │
//! │   └──────────────────────────────────────────────────┘   │
//! │                           │                              │
//! │                           ▼                              │
//! │   ┌──────────────────────────────────────────────────┐   │
//! │   │          recall_store::MemoryCoordinator         │   │
//! │   └──────────────────────────────────────────────────┘   │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Key Principles
//!
//! 1. **MCP as Transport**: the adapter validates and forwards; all memory
//!    semantics live in the coordinator.
//!
//! 2. **Tool errors are results**: a failing tool call produces a result
//!    with `isError = true`. Only an unknown tool name is an adapter error.
//!
//! 3. **Auditable calls**: every tool invocation leaves an [`McpCallRecord`]
//!    in a bounded history.

#![deny(unsafe_code)]

pub mod memory;

pub use memory::{
    register_memory_toolset, MemoryResourceProvider, MemoryToolsetConfig, SummarizePrompt,
    DEFAULT_SEARCH_LIMIT,
};

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use recall_store::StoreError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// MCP Tool definition (MCP wire shape).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpTool {
    /// Tool name.
    pub name: String,
    /// Tool description.
    pub description: String,
    /// Input schema (JSON Schema).
    #[serde(rename = "inputSchema")]
    pub input_schema: serde_json::Value,
    /// Optional annotations.
    #[serde(default)]
    pub annotations: McpAnnotations,
}

/// MCP annotations for tools.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct McpAnnotations {
    /// Title for display.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Whether this tool has read-only behavior.
    #[serde(rename = "readOnlyHint", skip_serializing_if = "Option::is_none")]
    pub read_only_hint: Option<bool>,
    /// Whether this tool is destructive.
    #[serde(rename = "destructiveHint", skip_serializing_if = "Option::is_none")]
    pub destructive_hint: Option<bool>,
    /// Whether this tool is idempotent.
    #[serde(rename = "idempotentHint", skip_serializing_if = "Option::is_none")]
    pub idempotent_hint: Option<bool>,
}

/// MCP Resource definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpResource {
    /// Resource URI.
    pub uri: String,
    /// Resource name.
    pub name: String,
    /// Optional description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// MIME type.
    #[serde(rename = "mimeType", skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// Parameterised resource URI such as `memory://{domain}/{query}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpResourceTemplate {
    #[serde(rename = "uriTemplate")]
    pub uri_template: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "mimeType", skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// MCP Tool call request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpToolCall {
    /// Tool name.
    pub name: String,
    /// Arguments (JSON object).
    #[serde(default)]
    pub arguments: serde_json::Value,
    /// Request ID for correlation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl McpToolCall {
    pub fn new(name: impl Into<String>, arguments: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            arguments,
            request_id: None,
        }
    }
}

/// MCP Tool call result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpToolResult {
    /// Content blocks.
    pub content: Vec<McpContent>,
    /// Whether the tool call failed.
    #[serde(rename = "isError", skip_serializing_if = "Option::is_none")]
    pub is_error: Option<bool>,
}

impl McpToolResult {
    /// Successful result with one text block.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![McpContent::Text { text: text.into() }],
            is_error: Some(false),
        }
    }

    /// Successful result carrying a JSON document as text.
    pub fn json(value: &serde_json::Value) -> Result<Self, McpAdapterError> {
        Ok(Self::text(serde_json::to_string(value)?))
    }

    /// Failed call; the message is shown to the model.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            content: vec![McpContent::Text {
                text: message.into(),
            }],
            is_error: Some(true),
        }
    }

    pub fn failed(&self) -> bool {
        self.is_error.unwrap_or(false)
    }

    /// First text block, if any.
    pub fn first_text(&self) -> Option<&str> {
        self.content.iter().find_map(|c| match c {
            McpContent::Text { text } => Some(text.as_str()),
            _ => None,
        })
    }
}

/// MCP Content block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum McpContent {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "resource")]
    Resource { uri: String, text: String },
}

/// MCP prompt descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpPrompt {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub arguments: Vec<McpPromptArgument>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpPromptArgument {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub required: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpPromptMessage {
    pub role: String,
    pub content: McpContent,
}

/// Rendered prompt (MCP prompts/get response).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpPromptResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub messages: Vec<McpPromptMessage>,
}

/// Tool executor trait for MCP tools.
#[async_trait]
pub trait McpToolExecutor: Send + Sync {
    /// Execute a tool call and return the result.
    async fn execute(&self, call: &McpToolCall) -> Result<McpToolResult, McpAdapterError>;

    /// Get the tool definition.
    fn tool(&self) -> &McpTool;
}

/// Resource provider trait for MCP resources.
#[async_trait]
pub trait McpResourceProvider: Send + Sync {
    /// List concrete resources.
    async fn list(&self) -> Result<Vec<McpResource>, McpAdapterError>;

    /// URI templates this provider answers.
    fn templates(&self) -> Vec<McpResourceTemplate> {
        Vec::new()
    }

    /// Whether `uri` belongs to this provider without listing.
    fn handles(&self, _uri: &str) -> bool {
        false
    }

    /// Read a resource by URI.
    async fn read(&self, uri: &str) -> Result<McpContent, McpAdapterError>;
}

/// Prompt provider trait for MCP prompts.
#[async_trait]
pub trait McpPromptProvider: Send + Sync {
    fn prompt(&self) -> &McpPrompt;

    async fn render(&self, arguments: &serde_json::Value)
        -> Result<McpPromptResult, McpAdapterError>;
}

/// Registry of MCP tools and their executors.
#[derive(Default)]
pub struct McpToolRegistry {
    executors: BTreeMap<String, Arc<dyn McpToolExecutor>>,
}

impl McpToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool under its descriptor name, replacing any previous one.
    pub fn register(&mut self, executor: Arc<dyn McpToolExecutor>) {
        self.executors
            .insert(executor.tool().name.clone(), executor);
    }

    /// Get an executor by name.
    pub fn get(&self, name: &str) -> Option<&Arc<dyn McpToolExecutor>> {
        self.executors.get(name)
    }

    /// List all registered tools, ordered by name.
    pub fn list_tools(&self) -> Vec<&McpTool> {
        self.executors.values().map(|e| e.tool()).collect()
    }

    pub fn len(&self) -> usize {
        self.executors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }
}

/// MCP call record for audit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpCallRecord {
    /// Unique call ID.
    pub call_id: String,
    /// Tool name.
    pub tool_name: String,
    /// Arguments.
    pub arguments: serde_json::Value,
    /// When the call was made.
    pub called_at: DateTime<Utc>,
    /// When the call completed.
    pub completed_at: Option<DateTime<Utc>>,
    /// Whether successful.
    pub success: bool,
    /// Result summary.
    pub result_summary: Option<String>,
}

/// Configuration for the MCP adapter.
#[derive(Debug, Clone)]
pub struct McpAdapterConfig {
    /// Maximum call history to retain.
    pub max_call_history: usize,
    /// Keep tool arguments in call records.
    pub record_arguments: bool,
}

impl Default for McpAdapterConfig {
    fn default() -> Self {
        Self {
            max_call_history: 1000,
            record_arguments: true,
        }
    }
}

/// The main MCP protocol adapter.
#[derive(Default)]
pub struct McpAdapter {
    /// Tool registry.
    registry: McpToolRegistry,
    /// Resource providers.
    resource_providers: Vec<Arc<dyn McpResourceProvider>>,
    /// Prompts by name.
    prompts: BTreeMap<String, Arc<dyn McpPromptProvider>>,
    /// Call history for audit.
    call_history: std::sync::RwLock<Vec<McpCallRecord>>,
    /// Configuration.
    config: McpAdapterConfig,
}

impl McpAdapter {
    /// Create a new MCP adapter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create with custom configuration.
    pub fn with_config(mut self, config: McpAdapterConfig) -> Self {
        self.config = config;
        self
    }

    /// Register a tool with executor.
    pub fn register_tool(&mut self, executor: Arc<dyn McpToolExecutor>) {
        tracing::debug!(tool = %executor.tool().name, "Registered MCP tool");
        self.registry.register(executor);
    }

    /// Register a resource provider.
    pub fn register_resource_provider(&mut self, provider: Arc<dyn McpResourceProvider>) {
        self.resource_providers.push(provider);
    }

    /// Register a prompt.
    pub fn register_prompt(&mut self, provider: Arc<dyn McpPromptProvider>) {
        self.prompts
            .insert(provider.prompt().name.clone(), provider);
    }

    /// List available tools (MCP tools/list response).
    pub fn list_tools(&self) -> Vec<McpTool> {
        self.registry.list_tools().into_iter().cloned().collect()
    }

    /// List available resources (MCP resources/list response).
    pub async fn list_resources(&self) -> Result<Vec<McpResource>, McpAdapterError> {
        let mut resources = Vec::new();
        for provider in &self.resource_providers {
            resources.extend(provider.list().await?);
        }
        Ok(resources)
    }

    /// List URI templates (MCP resources/templates/list response).
    pub fn list_resource_templates(&self) -> Vec<McpResourceTemplate> {
        self.resource_providers
            .iter()
            .flat_map(|p| p.templates())
            .collect()
    }

    /// Read a resource (MCP resources/read response).
    pub async fn read_resource(&self, uri: &str) -> Result<McpContent, McpAdapterError> {
        for provider in &self.resource_providers {
            if provider.handles(uri) {
                return provider.read(uri).await;
            }
            let resources = provider.list().await?;
            if resources.iter().any(|r| r.uri == uri) {
                return provider.read(uri).await;
            }
        }
        Err(McpAdapterError::ResourceNotFound(uri.to_string()))
    }

    /// List available prompts (MCP prompts/list response).
    pub fn list_prompts(&self) -> Vec<McpPrompt> {
        self.prompts.values().map(|p| p.prompt().clone()).collect()
    }

    /// Render a prompt (MCP prompts/get response).
    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: &serde_json::Value,
    ) -> Result<McpPromptResult, McpAdapterError> {
        let provider = self
            .prompts
            .get(name)
            .ok_or_else(|| McpAdapterError::PromptNotFound(name.to_string()))?;
        provider.render(arguments).await
    }

    /// Call a tool and record the call.
    ///
    /// Executor failures come back as an `isError` result; only an unknown
    /// tool name is returned as `Err`.
    pub async fn call_tool(
        &self,
        tool_call: McpToolCall,
    ) -> Result<(McpToolResult, McpCallRecord), McpAdapterError> {
        let executor = self
            .registry
            .get(&tool_call.name)
            .ok_or_else(|| McpAdapterError::ToolNotFound(tool_call.name.clone()))?;

        let call_id = tool_call
            .request_id
            .clone()
            .unwrap_or_else(|| format!("mcp-call-{}", uuid::Uuid::new_v4()));
        let called_at = Utc::now();

        let result = match executor.execute(&tool_call).await {
            Ok(result) => result,
            Err(err) => {
                tracing::warn!(tool = %tool_call.name, error = %err, "MCP tool call failed");
                McpToolResult::error(err.to_string())
            }
        };

        let record = McpCallRecord {
            call_id,
            tool_name: tool_call.name.clone(),
            arguments: if self.config.record_arguments {
                tool_call.arguments.clone()
            } else {
                serde_json::Value::Null
            },
            called_at,
            completed_at: Some(Utc::now()),
            success: !result.failed(),
            result_summary: Some(
                result
                    .content
                    .first()
                    .map(|c| match c {
                        McpContent::Text { text } => text.chars().take(100).collect::<String>(),
                        McpContent::Resource { uri, .. } => format!("[resource: {}]", uri),
                    })
                    .unwrap_or_else(|| "[empty]".to_string()),
            ),
        };

        if let Ok(mut history) = self.call_history.write() {
            history.push(record.clone());
            let excess = history.len().saturating_sub(self.config.max_call_history);
            history.drain(..excess);
        }

        Ok((result, record))
    }

    /// Most recent calls first.
    pub fn call_history(&self, limit: usize) -> Vec<McpCallRecord> {
        self.call_history
            .read()
            .map(|h| h.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default()
    }
}

/// Decode tool or prompt arguments; a missing argument object reads as `{}`.
pub fn parse_arguments<T: DeserializeOwned>(
    arguments: &serde_json::Value,
) -> Result<T, McpAdapterError> {
    let value = if arguments.is_null() {
        serde_json::Value::Object(Default::default())
    } else {
        arguments.clone()
    };
    serde_json::from_value(value).map_err(|e| McpAdapterError::InvalidArguments(e.to_string()))
}

/// MCP adapter errors.
#[derive(Debug, Error)]
pub enum McpAdapterError {
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    #[error("Prompt not found: {0}")]
    PromptNotFound(String),

    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for McpAdapterError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
