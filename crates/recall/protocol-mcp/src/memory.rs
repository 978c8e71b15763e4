//! Memory toolset: binds `MemoryCoordinator` operations to MCP tools, the
//! `memory://` resource and the `summarize_memories` prompt.

use std::sync::Arc;

use async_trait::async_trait;
use recall_store::{
    DomainName, MemoryCoordinator, MemoryHit, MemoryId, MemoryUpdate, NewMemory, SearchRequest,
    StoreError,
};
use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::{
    parse_arguments, McpAdapter, McpAdapterError, McpAnnotations, McpContent, McpPrompt,
    McpPromptArgument, McpPromptMessage, McpPromptProvider, McpPromptResult, McpResource,
    McpResourceProvider, McpResourceTemplate, McpTool, McpToolCall, McpToolExecutor,
    McpToolResult,
};

pub const DEFAULT_SEARCH_LIMIT: usize = 5;
const URI_SCHEME: &str = "memory://";

/// Knobs the toolset needs beyond the coordinator itself.
#[derive(Debug, Clone)]
pub struct MemoryToolsetConfig {
    /// Limit used when a search or resource read does not pass one.
    pub default_limit: usize,
}

impl Default for MemoryToolsetConfig {
    fn default() -> Self {
        Self {
            default_limit: DEFAULT_SEARCH_LIMIT,
        }
    }
}

/// Register the memory tools, resource and prompt on `adapter`.
///
/// `list_memory_domains` is only registered for multi-domain backends.
pub fn register_memory_toolset(
    adapter: &mut McpAdapter,
    coordinator: Arc<MemoryCoordinator>,
    config: MemoryToolsetConfig,
) {
    adapter.register_tool(Arc::new(StoreMemoryTool::new(coordinator.clone())));
    adapter.register_tool(Arc::new(UpdateMemoryTool::new(coordinator.clone())));
    adapter.register_tool(Arc::new(SearchMemoriesTool::new(
        coordinator.clone(),
        config.default_limit,
    )));
    if coordinator.is_multi_domain() {
        adapter.register_tool(Arc::new(ListDomainsTool::new(coordinator.clone())));
    }
    adapter.register_resource_provider(Arc::new(MemoryResourceProvider::new(
        coordinator,
        config.default_limit,
    )));
    adapter.register_prompt(Arc::new(SummarizePrompt::new()));
}

fn hit_to_json(hit: &MemoryHit, query: Option<&str>) -> Value {
    let mut value = json!({
        "id": hit.memory.id,
        "content": hit.memory.content,
        "metadata": hit.memory.metadata(),
        "score": hit.score,
    });
    if let (Some(query), Value::Object(object)) = (query, &mut value) {
        object.insert("query".to_string(), Value::String(query.to_string()));
    }
    value
}

fn annotations(title: &str, read_only: bool, idempotent: bool) -> McpAnnotations {
    McpAnnotations {
        title: Some(title.to_string()),
        read_only_hint: Some(read_only),
        destructive_hint: Some(false),
        idempotent_hint: Some(idempotent),
    }
}

#[derive(Debug, Deserialize)]
struct StoreMemoryArgs {
    content: String,
    #[serde(default)]
    domain: Option<String>,
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    importance: Option<f32>,
    #[serde(default)]
    metadata: Map<String, Value>,
}

struct StoreMemoryTool {
    coordinator: Arc<MemoryCoordinator>,
    tool: McpTool,
}

impl StoreMemoryTool {
    fn new(coordinator: Arc<MemoryCoordinator>) -> Self {
        Self {
            coordinator,
            tool: McpTool {
                name: "store_memory".to_string(),
                description: "Store a new memory. The content is chunked and indexed for \
                              semantic search; returns the memory id."
                    .to_string(),
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "content": {"type": "string", "description": "Text to remember"},
                        "domain": {"type": "string", "description": "Memory domain (default: \"default\")"},
                        "source": {"type": "string", "description": "Where the memory came from, e.g. \"conversation\""},
                        "importance": {"type": "number", "minimum": 0.0, "maximum": 1.0},
                        "metadata": {"type": "object", "description": "Extra metadata keys"}
                    },
                    "required": ["content"]
                }),
                annotations: annotations("Store memory", false, false),
            },
        }
    }
}

#[async_trait]
impl McpToolExecutor for StoreMemoryTool {
    async fn execute(&self, call: &McpToolCall) -> Result<McpToolResult, McpAdapterError> {
        let args: StoreMemoryArgs = parse_arguments(&call.arguments)?;
        let receipt = self
            .coordinator
            .store(NewMemory {
                content: args.content,
                domain: args.domain,
                source: args.source,
                importance: args.importance,
                attributes: args.metadata,
            })
            .await?;

        let mut result = McpToolResult::text(receipt.memory_id.to_string());
        for warning in &receipt.warnings {
            result.content.push(McpContent::Text {
                text: format!("warning: {}", serde_json::to_string(warning)?),
            });
        }
        Ok(result)
    }

    fn tool(&self) -> &McpTool {
        &self.tool
    }
}

#[derive(Debug, Deserialize)]
struct UpdateMemoryArgs {
    memory_id: String,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    importance: Option<f32>,
    #[serde(default)]
    domain: Option<String>,
    #[serde(default)]
    metadata: Map<String, Value>,
}

struct UpdateMemoryTool {
    coordinator: Arc<MemoryCoordinator>,
    tool: McpTool,
}

impl UpdateMemoryTool {
    fn new(coordinator: Arc<MemoryCoordinator>) -> Self {
        Self {
            coordinator,
            tool: McpTool {
                name: "update_memory".to_string(),
                description: "Update an existing memory. New content replaces the old \
                              content and is re-indexed. Returns true on success and false \
                              when the memory id is unknown."
                    .to_string(),
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "memory_id": {"type": "string"},
                        "content": {"type": "string"},
                        "importance": {"type": "number", "minimum": 0.0, "maximum": 1.0},
                        "domain": {"type": "string"},
                        "metadata": {"type": "object"}
                    },
                    "required": ["memory_id"]
                }),
                annotations: annotations("Update memory", false, true),
            },
        }
    }
}

#[async_trait]
impl McpToolExecutor for UpdateMemoryTool {
    async fn execute(&self, call: &McpToolCall) -> Result<McpToolResult, McpAdapterError> {
        let args: UpdateMemoryArgs = parse_arguments(&call.arguments)?;
        let update = MemoryUpdate {
            content: args.content,
            importance: args.importance,
            attributes: args.metadata,
        };
        let memory_id = MemoryId::new(args.memory_id);
        match self
            .coordinator
            .update(&memory_id, update, args.domain.as_deref())
            .await
        {
            Ok(receipt) => {
                let mut result = McpToolResult::text("true");
                for warning in &receipt.warnings {
                    result.content.push(McpContent::Text {
                        text: format!("warning: {}", serde_json::to_string(warning)?),
                    });
                }
                Ok(result)
            }
            Err(StoreError::NotFound(what)) => {
                tracing::debug!(memory_id = %memory_id, %what, "Update target not found");
                Ok(McpToolResult::text("false"))
            }
            Err(err) => Err(err.into()),
        }
    }

    fn tool(&self) -> &McpTool {
        &self.tool
    }
}

#[derive(Debug, Deserialize)]
struct SearchMemoriesArgs {
    query: String,
    #[serde(default)]
    domain: Option<String>,
    #[serde(default)]
    limit: Option<usize>,
    #[serde(default)]
    use_vector: Option<bool>,
}

struct SearchMemoriesTool {
    coordinator: Arc<MemoryCoordinator>,
    default_limit: usize,
    tool: McpTool,
}

impl SearchMemoriesTool {
    fn new(coordinator: Arc<MemoryCoordinator>, default_limit: usize) -> Self {
        Self {
            coordinator,
            default_limit,
            tool: McpTool {
                name: "search_memories".to_string(),
                description: "Search memories by meaning, falling back to text search when \
                              embeddings are unavailable or use_vector is false."
                    .to_string(),
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "query": {"type": "string"},
                        "domain": {"type": "string"},
                        "limit": {"type": "integer", "minimum": 1, "default": default_limit},
                        "use_vector": {"type": "boolean", "default": true}
                    },
                    "required": ["query"]
                }),
                annotations: annotations("Search memories", true, true),
            },
        }
    }
}

#[async_trait]
impl McpToolExecutor for SearchMemoriesTool {
    async fn execute(&self, call: &McpToolCall) -> Result<McpToolResult, McpAdapterError> {
        let args: SearchMemoriesArgs = parse_arguments(&call.arguments)?;
        let mut request = SearchRequest::new(
            args.query.clone(),
            args.limit.unwrap_or(self.default_limit),
        );
        request.domain = args.domain;
        request.use_vector = args.use_vector.unwrap_or(true);

        let outcome = self.coordinator.search(request).await?;
        let results: Vec<Value> = outcome
            .hits
            .iter()
            .map(|hit| hit_to_json(hit, Some(&args.query)))
            .collect();
        McpToolResult::json(&Value::Array(results))
    }

    fn tool(&self) -> &McpTool {
        &self.tool
    }
}

struct ListDomainsTool {
    coordinator: Arc<MemoryCoordinator>,
    tool: McpTool,
}

impl ListDomainsTool {
    fn new(coordinator: Arc<MemoryCoordinator>) -> Self {
        Self {
            coordinator,
            tool: McpTool {
                name: "list_memory_domains".to_string(),
                description: "List the memory domains that exist.".to_string(),
                input_schema: json!({"type": "object", "properties": {}}),
                annotations: annotations("List memory domains", true, true),
            },
        }
    }
}

#[async_trait]
impl McpToolExecutor for ListDomainsTool {
    async fn execute(&self, _call: &McpToolCall) -> Result<McpToolResult, McpAdapterError> {
        let domains = self.coordinator.list_domains().await?;
        McpToolResult::json(&json!(domains))
    }

    fn tool(&self) -> &McpTool {
        &self.tool
    }
}

/// Read-only search addressed as `memory://{domain}/{query}` or
/// `memory://{query}`.
pub struct MemoryResourceProvider {
    coordinator: Arc<MemoryCoordinator>,
    default_limit: usize,
}

impl MemoryResourceProvider {
    pub fn new(coordinator: Arc<MemoryCoordinator>, default_limit: usize) -> Self {
        Self {
            coordinator,
            default_limit,
        }
    }
}

/// Split a memory URI into an optional domain and the decoded query.
///
/// A leading segment counts as a domain only if it is a valid domain name;
/// otherwise the whole path is the query.
pub fn parse_memory_uri(uri: &str) -> Result<(Option<String>, String), McpAdapterError> {
    let path = uri
        .strip_prefix(URI_SCHEME)
        .ok_or_else(|| McpAdapterError::ResourceNotFound(uri.to_string()))?;

    let decode = |raw: &str| {
        urlencoding::decode(raw)
            .map(|s| s.into_owned())
            .map_err(|e| McpAdapterError::InvalidArguments(format!("bad percent-encoding: {e}")))
    };

    let (domain, query) = match path.split_once('/') {
        Some((head, rest)) if !rest.is_empty() && DomainName::parse(head).is_ok() => {
            (Some(head.to_string()), decode(rest)?)
        }
        _ => (None, decode(path)?),
    };
    if query.trim().is_empty() {
        return Err(McpAdapterError::InvalidArguments(
            "memory URI has an empty query".to_string(),
        ));
    }
    Ok((domain, query))
}

#[async_trait]
impl McpResourceProvider for MemoryResourceProvider {
    async fn list(&self) -> Result<Vec<McpResource>, McpAdapterError> {
        Ok(Vec::new())
    }

    fn templates(&self) -> Vec<McpResourceTemplate> {
        let mut templates = vec![McpResourceTemplate {
            uri_template: "memory://{query}".to_string(),
            name: "memories".to_string(),
            description: Some("Memories relevant to a query in the default domain".to_string()),
            mime_type: Some("application/json".to_string()),
        }];
        if self.coordinator.is_multi_domain() {
            templates.push(McpResourceTemplate {
                uri_template: "memory://{domain}/{query}".to_string(),
                name: "domain-memories".to_string(),
                description: Some("Memories relevant to a query within one domain".to_string()),
                mime_type: Some("application/json".to_string()),
            });
        }
        templates
    }

    fn handles(&self, uri: &str) -> bool {
        uri.starts_with(URI_SCHEME)
    }

    async fn read(&self, uri: &str) -> Result<McpContent, McpAdapterError> {
        let (domain, query) = parse_memory_uri(uri)?;
        let mut request = SearchRequest::new(query, self.default_limit);
        request.domain = domain;
        let outcome = self.coordinator.search(request).await?;
        let results: Vec<Value> = outcome.hits.iter().map(|hit| hit_to_json(hit, None)).collect();
        Ok(McpContent::Resource {
            uri: uri.to_string(),
            text: serde_json::to_string(&results)?,
        })
    }
}

/// `summarize_memories`: turns a list of memories into a summarisation
/// prompt.
pub struct SummarizePrompt {
    prompt: McpPrompt,
}

impl SummarizePrompt {
    pub fn new() -> Self {
        Self {
            prompt: McpPrompt {
                name: "summarize_memories".to_string(),
                description: Some("Create a prompt for summarizing a list of memories".to_string()),
                arguments: vec![McpPromptArgument {
                    name: "memories".to_string(),
                    description: Some(
                        "Memories to summarize: objects with a content field, or strings"
                            .to_string(),
                    ),
                    required: true,
                }],
            },
        }
    }

    /// Prompt text for the given memory contents.
    pub fn render_text<S: AsRef<str>>(contents: &[S]) -> String {
        let lines: Vec<String> = contents
            .iter()
            .enumerate()
            .map(|(i, content)| format!("Memory {}: {}", i + 1, content.as_ref()))
            .collect();
        format!(
            "Below are several memory chunks related to a user's interests and history.\n\
             Please create a concise summary that captures the key points and patterns:\n\n\
             {}\n\nSummary:",
            lines.join("\n")
        )
    }
}

impl Default for SummarizePrompt {
    fn default() -> Self {
        Self::new()
    }
}

/// Memory contents from a `memories` argument. MCP prompt arguments are
/// strings, so a JSON-encoded array is accepted as well as a native one.
fn memory_contents(arguments: &Value) -> Result<Vec<String>, McpAdapterError> {
    let raw = arguments
        .get("memories")
        .ok_or_else(|| McpAdapterError::InvalidArguments("missing `memories`".to_string()))?;
    let items = match raw {
        Value::String(encoded) => serde_json::from_str::<Value>(encoded)
            .map_err(|e| McpAdapterError::InvalidArguments(format!("`memories`: {e}")))?,
        other => other.clone(),
    };
    let Value::Array(items) = items else {
        return Err(McpAdapterError::InvalidArguments(
            "`memories` must be an array".to_string(),
        ));
    };
    items
        .into_iter()
        .map(|item| match item {
            Value::String(text) => Ok(text),
            Value::Object(mut object) => match object.remove("content") {
                Some(Value::String(text)) => Ok(text),
                _ => Err(McpAdapterError::InvalidArguments(
                    "memory object without a string `content`".to_string(),
                )),
            },
            _ => Err(McpAdapterError::InvalidArguments(
                "memories must be strings or objects".to_string(),
            )),
        })
        .collect()
}

#[async_trait]
impl McpPromptProvider for SummarizePrompt {
    fn prompt(&self) -> &McpPrompt {
        &self.prompt
    }

    async fn render(&self, arguments: &Value) -> Result<McpPromptResult, McpAdapterError> {
        let contents = memory_contents(arguments)?;
        Ok(McpPromptResult {
            description: self.prompt.description.clone(),
            messages: vec![McpPromptMessage {
                role: "user".to_string(),
                content: McpContent::Text {
                    text: Self::render_text(&contents),
                },
            }],
        })
    }
}
