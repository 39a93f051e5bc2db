//! Knowledge-graph service client.
//!
//! `POST {url}/connected` with `{"seeds": [...], "max_depth": n}` and
//! expects `{"edges": [{"document_id": "...", "weight": 0.5}]}` back.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use memory_agent_core::engine::{GraphEdge, GraphService};
use memory_agent_core::{MemoryError, MemoryResult};

use crate::config::GraphConfig;
use crate::http::post_json;

/// Build the graph client, or `None` when no `graph.url` is configured.
pub fn create_graph(config: &GraphConfig, timeout: Duration) -> Result<Option<Arc<dyn GraphService>>> {
    let Some(url) = config.url.as_deref() else {
        return Ok(None);
    };
    let client = reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .context("Failed to build HTTP client")?;
    let service: Arc<dyn GraphService> = Arc::new(HttpGraphService::new(url, client));
    Ok(Some(service))
}

pub struct HttpGraphService {
    client: reqwest::Client,
    url: String,
}

impl HttpGraphService {
    pub fn new(url: &str, client: reqwest::Client) -> Self {
        Self {
            client,
            url: url.trim_end_matches('/').to_string(),
        }
    }
}

#[derive(Deserialize)]
struct ConnectedResponse {
    #[serde(default)]
    edges: Vec<GraphEdge>,
}

#[async_trait]
impl GraphService for HttpGraphService {
    async fn connected(&self, seeds: &[String], max_depth: u32) -> MemoryResult<Vec<GraphEdge>> {
        let body = json!({"seeds": seeds, "max_depth": max_depth});
        let request = self.client.post(format!("{}/connected", self.url));
        let value = post_json("Graph", request, &body).await?;
        let parsed: ConnectedResponse = serde_json::from_value(value)
            .map_err(|e| MemoryError::internal(format!("Invalid graph response: {e}")))?;
        Ok(parsed.edges)
    }
}
