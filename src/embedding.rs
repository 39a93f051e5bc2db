//! Embedding engine adapters.
//!
//! - **[`OpenAIEmbedder`]**: `POST {url}/embeddings`, requires `OPENAI_API_KEY`.
//! - **[`OllamaEmbedder`]**: `POST {url}/api/embed` on a local Ollama instance
//!   (default `http://localhost:11434`).
//!
//! `provider = "disabled"` yields no engine; the vector tier then reports
//! itself unavailable and retrieval falls back to the metadata-only tier.
//!
//! Adapters make a single attempt per call. Retries, backoff, and timeouts
//! belong to the policy engine and the worker pool.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;

use memory_agent_core::embedding::{Embedding, EmbeddingEngine};
use memory_agent_core::{MemoryError, MemoryResult};

use crate::config::EmbeddingConfig;
use crate::http::post_json;

const OPENAI_URL: &str = "https://api.openai.com/v1";
const OLLAMA_URL: &str = "http://localhost:11434";

/// Build the configured engine, or `None` when embeddings are disabled.
pub fn create_embedder(config: &EmbeddingConfig, timeout: Duration) -> Result<Option<Arc<dyn EmbeddingEngine>>> {
    let client = reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .context("Failed to build HTTP client")?;
    let engine: Arc<dyn EmbeddingEngine> = match config.provider.as_str() {
        "disabled" => return Ok(None),
        "openai" => Arc::new(OpenAIEmbedder::new(config, client)?),
        "ollama" => Arc::new(OllamaEmbedder::new(config, client)?),
        other => bail!("Unknown embedding provider: {}", other),
    };
    Ok(Some(engine))
}

pub struct OpenAIEmbedder {
    client: reqwest::Client,
    api_key: String,
    model: String,
    url: String,
}

impl OpenAIEmbedder {
    pub fn new(config: &EmbeddingConfig, client: reqwest::Client) -> Result<Self> {
        let model = config
            .model
            .clone()
            .context("embedding.model required for OpenAI provider")?;
        let api_key = std::env::var("OPENAI_API_KEY").context("OPENAI_API_KEY environment variable not set")?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| OPENAI_URL.to_string());
        Ok(Self {
            client,
            api_key,
            model,
            url: url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl EmbeddingEngine for OpenAIEmbedder {
    fn model_version(&self) -> &str {
        &self.model
    }

    async fn embed(&self, text: &str) -> MemoryResult<Embedding> {
        let body = serde_json::json!({
            "model": self.model,
            "input": [text],
        });
        let request = self
            .client
            .post(format!("{}/embeddings", self.url))
            .header("Authorization", format!("Bearer {}", self.api_key));
        let json = post_json("OpenAI", request, &body).await?;
        Ok(Embedding {
            vector: parse_openai_response(&json)?,
            model_version: self.model.clone(),
        })
    }
}

/// First `data[].embedding` array of an OpenAI embeddings response.
fn parse_openai_response(json: &serde_json::Value) -> MemoryResult<Vec<f32>> {
    let embedding = json
        .get("data")
        .and_then(|d| d.as_array())
        .and_then(|d| d.first())
        .and_then(|item| item.get("embedding"))
        .and_then(|e| e.as_array())
        .ok_or_else(|| MemoryError::internal("Invalid OpenAI response: missing data[0].embedding"))?;
    Ok(to_vector(embedding))
}

pub struct OllamaEmbedder {
    client: reqwest::Client,
    model: String,
    url: String,
}

impl OllamaEmbedder {
    pub fn new(config: &EmbeddingConfig, client: reqwest::Client) -> Result<Self> {
        let model = config
            .model
            .clone()
            .context("embedding.model required for Ollama provider")?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| OLLAMA_URL.to_string());
        Ok(Self {
            client,
            model,
            url: url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl EmbeddingEngine for OllamaEmbedder {
    fn model_version(&self) -> &str {
        &self.model
    }

    async fn embed(&self, text: &str) -> MemoryResult<Embedding> {
        let body = serde_json::json!({
            "model": self.model,
            "input": [text],
        });
        let request = self.client.post(format!("{}/api/embed", self.url));
        let json = post_json("Ollama", request, &body).await?;
        Ok(Embedding {
            vector: parse_ollama_response(&json)?,
            model_version: self.model.clone(),
        })
    }
}

fn parse_ollama_response(json: &serde_json::Value) -> MemoryResult<Vec<f32>> {
    let embedding = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .and_then(|e| e.first())
        .and_then(|e| e.as_array())
        .ok_or_else(|| MemoryError::internal("Invalid Ollama response: missing embeddings[0]"))?;
    Ok(to_vector(embedding))
}

fn to_vector(values: &[serde_json::Value]) -> Vec<f32> {
    values
        .iter()
        .map(|v| v.as_f64().unwrap_or(0.0) as f32)
        .collect()
}
