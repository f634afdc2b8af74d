//! LLM provider client.
//!
//! The core needs exactly two contracts from the provider: batched trend
//! scoring and text moderation. Prompt construction and response-shape
//! details stay inside this module.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::error::{http_error, PipelineError};

/// One scored topic out of a batch call. Dimension scores are 1-10,
/// overall is 1.0-10.0.
#[derive(Debug, Clone, Deserialize)]
pub struct TopicScore {
    pub index: usize,
    pub velocity: i32,
    pub commercial: i32,
    pub safety: i32,
    pub uniqueness: i32,
    pub overall: f64,
    #[serde(default)]
    pub reasoning: String,
}

/// Batch scoring result with the token usage that prices it.
#[derive(Debug, Clone, Default)]
pub struct BatchScoreResponse {
    pub scores: Vec<TopicScore>,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Moderation verdict for a piece of text.
#[derive(Debug, Clone, Deserialize)]
pub struct Moderation {
    pub max_score: f64,
    #[serde(default)]
    pub categories: Vec<(String, f64)>,
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Score a batch of topics in a single call.
    async fn batch_score(&self, topics: &[String]) -> Result<BatchScoreResponse, PipelineError>;

    /// Moderate a piece of text.
    async fn moderate(&self, text: &str) -> Result<Moderation, PipelineError>;
}

const SCORING_PROMPT: &str = "Score each topic below for vinyl-sticker potential. For every \
topic return a JSON object with fields index, velocity, commercial, safety, uniqueness \
(integers 1-10), overall (float 1.0-10.0) and reasoning. Respond with a JSON array only.";

pub struct HttpLlmClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl HttpLlmClient {
    pub fn new(base_url: String, api_key: String, model: String) -> Result<Self, PipelineError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|err| PipelineError::api("llm", err))?;
        Ok(Self {
            client,
            base_url,
            api_key,
            model,
        })
    }
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: String,
}

#[derive(Deserialize, Default)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn batch_score(&self, topics: &[String]) -> Result<BatchScoreResponse, PipelineError> {
        let numbered: Vec<String> = topics
            .iter()
            .enumerate()
            .map(|(i, t)| format!("{i}. {t}"))
            .collect();
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&json!({
                "model": self.model,
                "messages": [
                    {"role": "system", "content": SCORING_PROMPT},
                    {"role": "user", "content": numbered.join("\n")},
                ],
                "temperature": 0.2,
            }))
            .send()
            .await
            .map_err(|err| http_error("llm", err))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(PipelineError::api("llm", format!("{status}: {body}")));
        }

        let chat: ChatResponse = response
            .json()
            .await
            .map_err(|err| http_error("llm", err))?;
        let content = chat
            .choices
            .first()
            .map(|c| c.message.content.as_str())
            .ok_or_else(|| PipelineError::Validation("empty chat response".to_string()))?;
        let scores: Vec<TopicScore> = serde_json::from_str(content.trim())
            .map_err(|err| PipelineError::Validation(format!("score payload: {err}")))?;
        let usage = chat.usage.unwrap_or_default();
        Ok(BatchScoreResponse {
            scores,
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
        })
    }

    async fn moderate(&self, text: &str) -> Result<Moderation, PipelineError> {
        #[derive(Deserialize)]
        struct ModerationResult {
            category_scores: std::collections::BTreeMap<String, f64>,
        }
        #[derive(Deserialize)]
        struct ModerationResponse {
            results: Vec<ModerationResult>,
        }

        let response = self
            .client
            .post(format!("{}/moderations", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&json!({ "input": text }))
            .send()
            .await
            .map_err(|err| http_error("llm", err))?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(PipelineError::api("llm", format!("moderation {status}")));
        }

        let parsed: ModerationResponse = response
            .json()
            .await
            .map_err(|err| http_error("llm", err))?;
        let result = parsed
            .results
            .into_iter()
            .next()
            .ok_or_else(|| PipelineError::Validation("empty moderation response".to_string()))?;
        let max_score = result
            .category_scores
            .values()
            .copied()
            .fold(0.0_f64, f64::max);
        Ok(Moderation {
            max_score,
            categories: result.category_scores.into_iter().collect(),
        })
    }
}
