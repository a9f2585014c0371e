//! Completion collaborator - turns an assembled prompt into an answer

use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tracing::debug;

use super::post_json;
use crate::retry::{with_retry, RetryPolicy};

/// Trait for answer generation
pub trait Completer: Send + Sync {
    fn complete(&self, prompt: &str) -> Result<String>;

    fn model(&self) -> &str;
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<Content>,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    #[serde(default)]
    text: Option<String>,
}

/// Gemini `generateContent` client
pub struct GeminiCompleter {
    endpoint: String,
    model: String,
    api_key: Option<String>,
    max_tokens: u32,
    temperature: f32,
    timeout: Duration,
    retry: RetryPolicy,
}

impl GeminiCompleter {
    pub const DEFAULT_ENDPOINT: &'static str = "https://generativelanguage.googleapis.com/v1beta";

    pub fn new(endpoint: &str, model: &str) -> Self {
        Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            model: model.to_string(),
            api_key: None,
            max_tokens: 1000,
            temperature: 0.1,
            timeout: Duration::from_secs(60),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_api_key(mut self, key: Option<String>) -> Self {
        self.api_key = key;
        self
    }

    pub fn with_generation(mut self, max_tokens: u32, temperature: f32) -> Self {
        self.max_tokens = max_tokens;
        self.temperature = temperature;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn url(&self) -> String {
        format!("{}/models/{}:generateContent", self.endpoint, self.model)
    }
}

impl Completer for GeminiCompleter {
    fn complete(&self, prompt: &str) -> Result<String> {
        let payload = serde_json::json!({
            "contents": [{"role": "user", "parts": [{"text": prompt}]}],
            "generationConfig": {
                "temperature": self.temperature,
                "maxOutputTokens": self.max_tokens,
            }
        });

        let mut headers: Vec<(&str, &str)> = Vec::new();
        if let Some(key) = self.api_key.as_deref() {
            headers.push(("x-goog-api-key", key));
        }

        let url = self.url();
        let json = with_retry(&self.retry, "completion", || {
            post_json(&url, &headers, self.timeout, &payload)
        })
        .context("Failed to send completion request")?;

        let answer = extract_text(json)?;
        debug!(model = %self.model, chars = answer.len(), "Completion generated");
        Ok(answer)
    }

    fn model(&self) -> &str {
        &self.model
    }
}

/// Concatenate the text parts of the first candidate
fn extract_text(json: serde_json::Value) -> Result<String> {
    let response: GenerateResponse =
        serde_json::from_value(json).context("Failed to parse completion response")?;

    let text: String = response
        .candidates
        .into_iter()
        .next()
        .and_then(|c| c.content)
        .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
        .unwrap_or_default();

    if text.trim().is_empty() {
        bail!("completion response contained no text");
    }
    Ok(text.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_text() {
        let json = serde_json::json!({
            "candidates": [{
                "content": {"role": "model", "parts": [{"text": "The DB "}, {"text": "was down. "}]},
                "finishReason": "STOP"
            }]
        });
        assert_eq!(extract_text(json).unwrap(), "The DB was down.");
    }

    #[test]
    fn test_extract_text_blocked() {
        let json = serde_json::json!({"candidates": [], "promptFeedback": {"blockReason": "SAFETY"}});
        assert!(extract_text(json).is_err());
    }

    #[test]
    fn test_url() {
        let completer = GeminiCompleter::new("https://example.test/v1beta/", "gemini-2.5-flash");
        assert_eq!(
            completer.url(),
            "https://example.test/v1beta/models/gemini-2.5-flash:generateContent"
        );
    }
}
