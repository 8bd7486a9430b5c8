//! Inference endpoint plumbing
//!
//! Both inference services speak the same chat-completion dialect: a JSON
//! request carrying a model name, a system prompt, and a user prompt; a JSON
//! response whose `choices[0].message.content` is itself a JSON document.
//! The typed decoders live with their callers ([`classifier`], [`analyzer`]).

pub mod analyzer;
pub mod classifier;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Connection settings for one inference service
#[derive(Debug, Clone)]
pub struct InferenceEndpoint {
    pub url: String,
    pub api_key: String,
    pub model: String,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f64,
    max_tokens: u32,
    response_format: ResponseFormat<'a>,
}

#[derive(Serialize)]
struct ResponseFormat<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: Option<String>,
}

/// Minimal chat-completion client shared by the classifier and analyzer
pub struct ChatClient {
    http: reqwest::Client,
    endpoint: InferenceEndpoint,
}

impl ChatClient {
    pub fn new(endpoint: InferenceEndpoint) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint,
        }
    }

    pub fn model(&self) -> &str {
        &self.endpoint.model
    }

    /// One JSON-mode completion bounded by `deadline`; the error string
    /// covers transport failures, timeouts, and malformed responses alike
    pub async fn complete_json(
        &self,
        system: &str,
        user: &str,
        max_tokens: u32,
        deadline: Duration,
    ) -> Result<Value, String> {
        let request = ChatRequest {
            model: &self.endpoint.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system,
                },
                ChatMessage {
                    role: "user",
                    content: user,
                },
            ],
            temperature: 0.1,
            max_tokens,
            response_format: ResponseFormat { kind: "json_object" },
        };

        let url = format!(
            "{}/chat/completions",
            self.endpoint.url.trim_end_matches('/')
        );

        let round_trip = async {
            let response = self
                .http
                .post(&url)
                .bearer_auth(&self.endpoint.api_key)
                .json(&request)
                .send()
                .await
                .map_err(|e| format!("transport error: {e}"))?;

            if !response.status().is_success() {
                return Err(format!("endpoint returned {}", response.status()));
            }

            response
                .json::<ChatResponse>()
                .await
                .map_err(|e| format!("malformed completion body: {e}"))
        };

        let body = tokio::time::timeout(deadline, round_trip)
            .await
            .map_err(|_| format!("timed out after {deadline:?}"))??;

        let content = body
            .choices
            .first()
            .and_then(|c| c.message.content.as_deref())
            .ok_or_else(|| "completion carried no content".to_string())?;

        extract_json(content)
    }
}

/// Parse the model's content as JSON, tolerating prose before the document
pub fn extract_json(text: &str) -> Result<Value, String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err("empty completion content".to_string());
    }
    if let Ok(value) = serde_json::from_str(trimmed) {
        return Ok(value);
    }
    let start = trimmed
        .find(['{', '['])
        .ok_or_else(|| "no JSON document in completion".to_string())?;
    serde_json::from_str(&trimmed[start..]).map_err(|e| format!("invalid JSON in completion: {e}"))
}

/// Truncate a line to at most `max` characters
pub fn truncate_chars(line: &str, max: usize) -> &str {
    match line.char_indices().nth(max) {
        Some((idx, _)) => &line[..idx],
        None => line,
    }
}
