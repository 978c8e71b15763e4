//! Embedding port adapters.
//!
//! Every adapter makes exactly one HTTP attempt per call. Callers decide what
//! a failure means; the coordinator degrades to lexical-only mode.

use crate::traits::EmbeddingProvider;
use crate::EmbeddingError;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

pub const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";
pub const DEFAULT_EMBEDDING_MODEL: &str = "nomic-embed-text";
pub const DEFAULT_EMBEDDING_DIMENSIONS: usize = 768;

#[derive(Debug, Deserialize)]
struct OllamaEmbeddingResponse {
    embedding: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct OllamaTagsResponse {
    #[serde(default)]
    models: Vec<OllamaModel>,
}

#[derive(Debug, Deserialize)]
struct OllamaModel {
    name: String,
}

#[derive(Debug, Deserialize)]
struct OpenAiEmbeddingData {
    embedding: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct OpenAiEmbeddingResponse {
    data: Vec<OpenAiEmbeddingData>,
}

/// Result of probing an embedding service at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeStatus {
    Ready,
    ModelMissing { installed: Vec<String> },
    Unreachable(String),
}

/// Embeddings from a local Ollama server.
#[derive(Debug, Clone)]
pub struct OllamaEmbedder {
    client: Client,
    base_url: String,
    model: String,
    timeout: Duration,
}

impl OllamaEmbedder {
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, EmbeddingError> {
        Ok(Self {
            client: build_http_client(timeout)?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            timeout,
        })
    }

    /// Checks that the server answers and has the configured model pulled.
    pub async fn probe(&self) -> ProbeStatus {
        let url = format!("{}/api/tags", self.base_url);
        let response = match self.client.get(&url).send().await {
            Ok(response) if response.status().is_success() => response,
            Ok(response) => {
                return ProbeStatus::Unreachable(format!("HTTP {}", response.status().as_u16()))
            }
            Err(err) => return ProbeStatus::Unreachable(err.to_string()),
        };
        let tags: OllamaTagsResponse = match response.json().await {
            Ok(tags) => tags,
            Err(err) => return ProbeStatus::Unreachable(format!("invalid tags response: {err}")),
        };
        let wanted = self.model.trim_end_matches(":latest");
        let installed: Vec<String> = tags.models.into_iter().map(|m| m.name).collect();
        if installed
            .iter()
            .any(|name| name == &self.model || name.trim_end_matches(":latest") == wanted)
        {
            ProbeStatus::Ready
        } else {
            ProbeStatus::ModelMissing { installed }
        }
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let url = format!("{}/api/embeddings", self.base_url);
        let payload = json!({
            "model": self.model,
            "prompt": text,
        });

        let response = self
            .client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| request_error(e, self.timeout))?;

        let body: OllamaEmbeddingResponse = decode(response, self.timeout).await?;
        non_degenerate(body.embedding)
    }

    fn model(&self) -> &str {
        &self.model
    }
}

/// Embeddings from any server speaking the OpenAI `/embeddings` API.
#[derive(Debug, Clone)]
pub struct OpenAiCompatibleEmbedder {
    client: Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
    timeout: Duration,
}

impl OpenAiCompatibleEmbedder {
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, EmbeddingError> {
        Ok(Self {
            client: build_http_client(timeout)?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            api_key,
            timeout,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiCompatibleEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let url = if self.base_url.ends_with("/embeddings") {
            self.base_url.clone()
        } else {
            format!("{}/embeddings", self.base_url)
        };
        let payload = json!({
            "model": self.model,
            "input": [text],
        });

        let mut request = self.client.post(&url).json(&payload);
        if let Some(api_key) = self.api_key.as_deref() {
            request = request.bearer_auth(api_key);
        }
        let response = request
            .send()
            .await
            .map_err(|e| request_error(e, self.timeout))?;

        let body: OpenAiEmbeddingResponse = decode(response, self.timeout).await?;
        let first = body
            .data
            .into_iter()
            .next()
            .ok_or_else(|| EmbeddingError::InvalidResponse("response has no data".to_string()))?;
        non_degenerate(first.embedding)
    }

    fn model(&self) -> &str {
        &self.model
    }
}

/// Provider used when embeddings are switched off; every call fails.
#[derive(Debug, Clone, Default)]
pub struct DisabledEmbedder;

#[async_trait]
impl EmbeddingProvider for DisabledEmbedder {
    async fn embed(&self, _text: &str) -> Result<Vec<f32>, EmbeddingError> {
        Err(EmbeddingError::Disabled)
    }

    fn model(&self) -> &str {
        "disabled"
    }
}

fn build_http_client(timeout: Duration) -> Result<Client, EmbeddingError> {
    let mut builder = Client::builder().timeout(timeout);
    let allow_system_proxy = std::env::var("RECALL_USE_SYSTEM_PROXY")
        .map(|value| matches!(value.as_str(), "1" | "true" | "yes"))
        .unwrap_or(false);

    if !allow_system_proxy {
        builder = builder.no_proxy();
    }

    builder
        .build()
        .map_err(|e| EmbeddingError::Unavailable(format!("failed to build HTTP client: {e}")))
}

fn request_error(err: reqwest::Error, timeout: Duration) -> EmbeddingError {
    if err.is_timeout() {
        EmbeddingError::Timeout(timeout.as_millis().min(u64::MAX as u128) as u64)
    } else {
        EmbeddingError::Unavailable(err.to_string())
    }
}

async fn decode<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
    timeout: Duration,
) -> Result<T, EmbeddingError> {
    if !response.status().is_success() {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        return Err(EmbeddingError::Http {
            status,
            body: truncate(&body, 320),
        });
    }
    let bytes = response
        .bytes()
        .await
        .map_err(|e| request_error(e, timeout))?;
    serde_json::from_slice(&bytes).map_err(|e| EmbeddingError::InvalidResponse(e.to_string()))
}

fn non_degenerate(embedding: Vec<f32>) -> Result<Vec<f32>, EmbeddingError> {
    if embedding.is_empty() {
        return Err(EmbeddingError::InvalidResponse(
            "embedding is empty".to_string(),
        ));
    }
    if embedding.iter().any(|v| !v.is_finite()) {
        return Err(EmbeddingError::InvalidResponse(
            "embedding contains non-finite values".to_string(),
        ));
    }
    if embedding.iter().all(|v| *v == 0.0) {
        return Err(EmbeddingError::Degenerate);
    }
    Ok(embedding)
}

fn truncate(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        value.to_string()
    } else {
        let mut out: String = value.chars().take(max_chars).collect();
        out.push_str("...");
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const TIMEOUT: Duration = Duration::from_secs(2);

    #[tokio::test]
    async fn ollama_returns_embedding() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/embeddings"))
            .and(body_partial_json(json!({"model": "nomic-embed-text", "prompt": "hello"})))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"embedding": [0.1, 0.2, 0.3]})),
            )
            .mount(&server)
            .await;

        let embedder = OllamaEmbedder::new(server.uri(), DEFAULT_EMBEDDING_MODEL, TIMEOUT).unwrap();
        let vector = embedder.embed("hello").await.unwrap();
        assert_eq!(vector, vec![0.1, 0.2, 0.3]);
    }

    #[tokio::test]
    async fn ollama_http_error_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/embeddings"))
            .respond_with(ResponseTemplate::new(500).set_body_string("model not loaded"))
            .mount(&server)
            .await;

        let embedder = OllamaEmbedder::new(server.uri(), "m", TIMEOUT).unwrap();
        let err = embedder.embed("hello").await.unwrap_err();
        assert!(matches!(err, EmbeddingError::Http { status: 500, .. }));
    }

    #[tokio::test]
    async fn malformed_payload_is_invalid_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/embeddings"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"vector": []})))
            .mount(&server)
            .await;

        let embedder = OllamaEmbedder::new(server.uri(), "m", TIMEOUT).unwrap();
        let err = embedder.embed("hello").await.unwrap_err();
        assert!(matches!(err, EmbeddingError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn zero_vector_is_degenerate() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/embeddings"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"embedding": [0.0, 0.0]})))
            .mount(&server)
            .await;

        let embedder = OllamaEmbedder::new(server.uri(), "m", TIMEOUT).unwrap();
        assert_eq!(
            embedder.embed("hello").await.unwrap_err(),
            EmbeddingError::Degenerate
        );
    }

    #[tokio::test]
    async fn slow_server_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/embeddings"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"embedding": [1.0]}))
                    .set_delay(Duration::from_millis(500)),
            )
            .mount(&server)
            .await;

        let embedder =
            OllamaEmbedder::new(server.uri(), "m", Duration::from_millis(50)).unwrap();
        let err = embedder.embed("hello").await.unwrap_err();
        assert!(matches!(err, EmbeddingError::Timeout(50)));
    }

    #[tokio::test]
    async fn probe_accepts_latest_tag() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/tags"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "models": [{"name": "llama3:8b"}, {"name": "nomic-embed-text:latest"}]
            })))
            .mount(&server)
            .await;

        let embedder = OllamaEmbedder::new(server.uri(), "nomic-embed-text", TIMEOUT).unwrap();
        assert_eq!(embedder.probe().await, ProbeStatus::Ready);

        let other = OllamaEmbedder::new(server.uri(), "mxbai-embed-large", TIMEOUT).unwrap();
        assert!(matches!(
            other.probe().await,
            ProbeStatus::ModelMissing { installed } if installed.len() == 2
        ));
    }

    #[tokio::test]
    async fn openai_compatible_sends_bearer_and_reads_first_item() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/embeddings"))
            .and(header("authorization", "Bearer secret"))
            .and(body_partial_json(json!({"model": "text-embedding-3-small", "input": ["hi"]})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{"embedding": [0.5, 0.5], "index": 0}]
            })))
            .mount(&server)
            .await;

        let embedder = OpenAiCompatibleEmbedder::new(
            format!("{}/v1", server.uri()),
            "text-embedding-3-small",
            Some("secret".to_string()),
            TIMEOUT,
        )
        .unwrap();
        assert_eq!(embedder.embed("hi").await.unwrap(), vec![0.5, 0.5]);
    }

    #[tokio::test]
    async fn unreachable_server_is_unavailable() {
        let embedder =
            OllamaEmbedder::new("http://127.0.0.1:9", "m", Duration::from_millis(500)).unwrap();
        let err = embedder.embed("hello").await.unwrap_err();
        assert!(matches!(
            err,
            EmbeddingError::Unavailable(_) | EmbeddingError::Timeout(_)
        ));
    }

    #[tokio::test]
    async fn disabled_always_fails() {
        assert_eq!(
            DisabledEmbedder.embed("x").await.unwrap_err(),
            EmbeddingError::Disabled
        );
    }
}
