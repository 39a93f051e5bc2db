//! Reasoning engine adapter for OpenAI-compatible chat completion APIs.
//!
//! The engine is asked for a JSON object and nothing else:
//!
//! ```json
//! {"selections": [{"document_id": "runbook.md", "confidence": 0.9}], "rationale": "..."}
//! ```
//!
//! Unparseable replies are reported as transient errors so the policy
//! engine retries them; ids outside the request are filtered by the
//! reasoning strategy, not here.

use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde_json::json;

use memory_agent_core::engine::{ReasoningEngine, ReasoningMode, ReasoningRequest, ReasoningResponse};
use memory_agent_core::{MemoryError, MemoryResult};

use crate::config::ReasoningConfig;
use crate::http::post_json;

/// Build the configured engine, or `None` when reasoning is disabled.
pub fn create_reasoner(config: &ReasoningConfig, timeout: Duration) -> Result<Option<Arc<dyn ReasoningEngine>>> {
    match config.provider.as_str() {
        "disabled" => Ok(None),
        "openai" => {
            let client = reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .context("Failed to build HTTP client")?;
            let engine: Arc<dyn ReasoningEngine> = Arc::new(ChatReasoner::new(config, client)?);
            Ok(Some(engine))
        }
        other => bail!("Unknown reasoning provider: {}", other),
    }
}

pub struct ChatReasoner {
    client: reqwest::Client,
    api_key: String,
    model: String,
    url: String,
}

impl ChatReasoner {
    pub fn new(config: &ReasoningConfig, client: reqwest::Client) -> Result<Self> {
        let model = config
            .model
            .clone()
            .context("reasoning.model required for openai provider")?;
        let api_key = std::env::var("OPENAI_API_KEY").context("OPENAI_API_KEY environment variable not set")?;
        Ok(Self {
            client,
            api_key,
            model,
            url: config.url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl ReasoningEngine for ChatReasoner {
    async fn reason(&self, request: &ReasoningRequest) -> MemoryResult<ReasoningResponse> {
        let body = json!({
            "model": self.model,
            "temperature": 0,
            "max_tokens": request.max_output_tokens,
            "response_format": {"type": "json_object"},
            "messages": [
                {"role": "system", "content": system_prompt(request)},
                {"role": "user", "content": user_prompt(request)},
            ],
        });
        let http = self
            .client
            .post(format!("{}/chat/completions", self.url))
            .header("Authorization", format!("Bearer {}", self.api_key));
        let json = post_json("Reasoning", http, &body).await?;
        parse_chat_response(&json)
    }
}

fn system_prompt(request: &ReasoningRequest) -> String {
    let task = match request.mode {
        ReasoningMode::Shortlist => "Shortlist the candidate documents worth a closer look for the query.",
        ReasoningMode::Final => "Rank the candidate documents most relevant to the query.",
    };
    format!(
        "{task} Select at most {} documents, best first, using only the ids shown. \
         Reply with a JSON object of the form \
         {{\"selections\": [{{\"document_id\": \"<id>\", \"confidence\": <0..1>}}], \"rationale\": \"<one sentence>\"}}. \
         Return an empty selections array when nothing is relevant.",
        request.max_selections
    )
}

fn user_prompt(request: &ReasoningRequest) -> String {
    let mut prompt = format!("Query: {}\n\nCandidates:\n", request.query);
    for candidate in &request.candidates {
        let _ = write!(prompt, "\n### id: {}\n{}\n", candidate.document_id, candidate.content);
    }
    prompt
}

/// Decode `choices[0].message.content` as a [`ReasoningResponse`].
fn parse_chat_response(json: &serde_json::Value) -> MemoryResult<ReasoningResponse> {
    let content = json
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
        .and_then(|c| c.pointer("/message/content"))
        .and_then(|c| c.as_str())
        .ok_or_else(|| MemoryError::transient("reasoning reply has no message content"))?;

    let trimmed = content
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();
    serde_json::from_str(trimmed)
        .map_err(|e| MemoryError::transient(format!("reasoning reply is not the expected JSON: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use memory_agent_core::engine::ReasoningCandidate;

    fn request(mode: ReasoningMode) -> ReasoningRequest {
        ReasoningRequest {
            query: "how do I roll back?".into(),
            candidates: vec![
                ReasoningCandidate {
                    document_id: "deploy.md".into(),
                    content: "Roll back with `deploy --undo`.".into(),
                },
                ReasoningCandidate {
                    document_id: "lunch.md".into(),
                    content: "Tacos on Tuesday.".into(),
                },
            ],
            max_output_tokens: 256,
            mode,
            max_selections: 3,
        }
    }

    #[test]
    fn test_prompts_carry_ids_and_limits() {
        let req = request(ReasoningMode::Shortlist);
        assert!(system_prompt(&req).starts_with("Shortlist"));
        assert!(system_prompt(&req).contains("at most 3 documents"));
        assert!(system_prompt(&request(ReasoningMode::Final)).starts_with("Rank"));
        let user = user_prompt(&req);
        assert!(user.starts_with("Query: how do I roll back?"));
        assert!(user.contains("### id: deploy.md\nRoll back"));
        assert!(user.contains("### id: lunch.md"));
    }

    #[test]
    fn test_parse_chat_response() {
        let reply = json!({
            "choices": [{"message": {"role": "assistant", "content":
                "```json\n{\"selections\": [{\"document_id\": \"deploy.md\", \"confidence\": 0.8}, {\"document_id\": \"x\"}], \"rationale\": \"mentions rollback\"}\n```"
            }}]
        });
        let parsed = parse_chat_response(&reply).unwrap();
        assert_eq!(parsed.selections.len(), 2);
        assert_eq!(parsed.selections[0].document_id, "deploy.md");
        assert_eq!(parsed.selections[0].confidence, Some(0.8));
        assert_eq!(parsed.selections[1].confidence, None);
        assert_eq!(parsed.rationale.as_deref(), Some("mentions rollback"));
    }

    #[test]
    fn test_unparseable_reply_is_transient() {
        let reply = json!({"choices": [{"message": {"content": "I think deploy.md"}}]});
        assert!(parse_chat_response(&reply).unwrap_err().is_retryable());
        assert!(parse_chat_response(&json!({"choices": []})).unwrap_err().is_retryable());
    }
}
