//! HTTP backends for the real provider APIs.
//!
//! One attempt per `complete()` call; retries live in the adapter.
//!
//! | provider   | wire format                 | auth                 |
//! |------------|-----------------------------|----------------------|
//! | OpenAI     | chat completions            | `Authorization` bearer |
//! | Perplexity | chat completions            | `Authorization` bearer |
//! | Anthropic  | messages                    | `x-api-key`          |
//! | Google     | Gemini `generateContent`    | `key` query param    |

use crate::error::{DispatchError, Result};
use crate::provider::{BackendError, Completion, ProviderBackend, ProviderKind, QueryRequest};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

const OPENAI_URL: &str = "https://api.openai.com/v1";
const PERPLEXITY_URL: &str = "https://api.perplexity.ai";
const ANTHROPIC_URL: &str = "https://api.anthropic.com/v1";
const GEMINI_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Default base URL of a provider's API.
pub fn default_base_url(provider: ProviderKind) -> &'static str {
    match provider {
        ProviderKind::OpenAi => OPENAI_URL,
        ProviderKind::Perplexity => PERPLEXITY_URL,
        ProviderKind::Anthropic => ANTHROPIC_URL,
        ProviderKind::Google => GEMINI_URL,
    }
}

/// Real provider over HTTPS.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    provider: ProviderKind,
    client: reqwest::Client,
    api_key: Option<String>,
    base_url: String,
}

impl HttpBackend {
    /// Creates a backend. A missing key only fails at call time.
    pub fn new(provider: ProviderKind, api_key: Option<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DispatchError::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            provider,
            client,
            api_key,
            base_url: default_base_url(provider).to_string(),
        })
    }

    /// Points the backend at a compatible server (proxy, local gateway).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn provider(&self) -> ProviderKind {
        self.provider
    }

    fn request_for(
        &self,
        api_key: &str,
        request: &QueryRequest,
        model: &str,
        system_prompt: &str,
    ) -> reqwest::RequestBuilder {
        let body = request_body(self.provider, request, model, system_prompt);
        match self.provider {
            ProviderKind::OpenAi | ProviderKind::Perplexity => self
                .client
                .post(format!("{}/chat/completions", self.base_url))
                .bearer_auth(api_key)
                .json(&body),
            ProviderKind::Anthropic => self
                .client
                .post(format!("{}/messages", self.base_url))
                .header("x-api-key", api_key)
                .header("anthropic-version", ANTHROPIC_VERSION)
                .json(&body),
            ProviderKind::Google => self
                .client
                .post(format!("{}/models/{}:generateContent", self.base_url, model))
                .query(&[("key", api_key)])
                .json(&body),
        }
    }
}

#[async_trait]
impl ProviderBackend for HttpBackend {
    async fn complete(
        &self,
        request: &QueryRequest,
        model: &str,
        system_prompt: &str,
    ) -> std::result::Result<Completion, BackendError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or(BackendError::MissingKey(self.provider))?;

        let response = self
            .request_for(api_key, request, model, system_prompt)
            .send()
            .await
            .map_err(|e| BackendError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "failed to read response body".into());
            return Err(BackendError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|e| BackendError::Malformed(e.to_string()))?;
        parse_completion(self.provider, model, payload)
    }
}

/// JSON body for one request.
pub fn request_body(provider: ProviderKind, request: &QueryRequest, model: &str, system_prompt: &str) -> Value {
    match provider {
        ProviderKind::OpenAi | ProviderKind::Perplexity => json!({
            "model": model,
            "messages": [
                { "role": "system", "content": system_prompt },
                { "role": "user", "content": request.text },
            ],
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
        }),
        ProviderKind::Anthropic => json!({
            "model": model,
            "system": system_prompt,
            "messages": [{ "role": "user", "content": request.text }],
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
        }),
        ProviderKind::Google => json!({
            "systemInstruction": { "parts": [{ "text": system_prompt }] },
            "contents": [{ "role": "user", "parts": [{ "text": request.text }] }],
            "generationConfig": {
                "temperature": request.temperature,
                "maxOutputTokens": request.max_tokens,
            },
        }),
    }
}

// =============================================================================
// RESPONSE SHAPES
// =============================================================================

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
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
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChatUsage {
    #[serde(default)]
    total_tokens: u64,
}

#[derive(Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    usage: Option<MessagesUsage>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Deserialize)]
struct MessagesUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    #[serde(default)]
    usage_metadata: Option<GeminiUsage>,
}

#[derive(Deserialize)]
struct GeminiCandidate {
    #[serde(default)]
    content: Option<GeminiContent>,
}

#[derive(Deserialize)]
struct GeminiContent {
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Deserialize)]
struct GeminiPart {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiUsage {
    #[serde(default)]
    total_token_count: u64,
}

/// Extracts the completion from a successful response body.
///
/// A body without any text is an `Empty` failure.
pub fn parse_completion(
    provider: ProviderKind,
    model: &str,
    payload: Value,
) -> std::result::Result<Completion, BackendError> {
    let malformed = |e: serde_json::Error| BackendError::Malformed(e.to_string());

    let (text, reported_model, tokens_used) = match provider {
        ProviderKind::OpenAi | ProviderKind::Perplexity => {
            let response: ChatResponse = serde_json::from_value(payload).map_err(malformed)?;
            let text = response
                .choices
                .into_iter()
                .next()
                .and_then(|choice| choice.message.content)
                .unwrap_or_default();
            (text, response.model, response.usage.map(|u| u.total_tokens).unwrap_or(0))
        }
        ProviderKind::Anthropic => {
            let response: MessagesResponse = serde_json::from_value(payload).map_err(malformed)?;
            let text: String = response
                .content
                .into_iter()
                .filter(|block| block.kind == "text")
                .filter_map(|block| block.text)
                .collect();
            let tokens = response
                .usage
                .map(|u| u.input_tokens + u.output_tokens)
                .unwrap_or(0);
            (text, response.model, tokens)
        }
        ProviderKind::Google => {
            let response: GeminiResponse = serde_json::from_value(payload).map_err(malformed)?;
            let text: String = response
                .candidates
                .into_iter()
                .next()
                .and_then(|candidate| candidate.content)
                .map(|content| content.parts.into_iter().filter_map(|part| part.text).collect())
                .unwrap_or_default();
            let tokens = response.usage_metadata.map(|u| u.total_token_count).unwrap_or(0);
            (text, None, tokens)
        }
    };

    if text.trim().is_empty() {
        return Err(BackendError::Empty);
    }
    Ok(Completion {
        text,
        model: reported_model.unwrap_or_else(|| model.to_string()),
        tokens_used,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_openai_body_carries_system_prompt() {
        let request = QueryRequest::new("best crm?", ProviderKind::OpenAi).with_max_tokens(64);
        let body = request_body(ProviderKind::OpenAi, &request, "gpt-4o", "be brief");

        assert_eq!(body["model"], "gpt-4o");
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][0]["content"], "be brief");
        assert_eq!(body["messages"][1]["content"], "best crm?");
        assert_eq!(body["max_tokens"], 64);
    }

    #[test]
    fn test_gemini_body_shape() {
        let request = QueryRequest::new("hi", ProviderKind::Google);
        let body = request_body(ProviderKind::Google, &request, "gemini-1.5-flash", "sys");
        assert_eq!(body["systemInstruction"]["parts"][0]["text"], "sys");
        assert_eq!(body["generationConfig"]["maxOutputTokens"], 2048);
    }

    #[test]
    fn test_parse_chat_completion() {
        let payload = json!({
            "model": "gpt-4o-2024-08-06",
            "choices": [{ "message": { "role": "assistant", "content": "Try Acme." } }],
            "usage": { "prompt_tokens": 10, "completion_tokens": 4, "total_tokens": 14 }
        });
        let completion = parse_completion(ProviderKind::OpenAi, "gpt-4o", payload).unwrap();
        assert_eq!(completion.text, "Try Acme.");
        assert_eq!(completion.model, "gpt-4o-2024-08-06");
        assert_eq!(completion.tokens_used, 14);
    }

    #[test]
    fn test_parse_anthropic_messages() {
        let payload = json!({
            "content": [
                { "type": "text", "text": "Acme " },
                { "type": "text", "text": "is fine." }
            ],
            "usage": { "input_tokens": 7, "output_tokens": 5 }
        });
        let completion = parse_completion(ProviderKind::Anthropic, "claude-3-5-sonnet-20241022", payload).unwrap();
        assert_eq!(completion.text, "Acme is fine.");
        assert_eq!(completion.model, "claude-3-5-sonnet-20241022");
        assert_eq!(completion.tokens_used, 12);
    }

    #[test]
    fn test_parse_gemini() {
        let payload = json!({
            "candidates": [{ "content": { "parts": [{ "text": "Acme." }] } }],
            "usageMetadata": { "totalTokenCount": 9 }
        });
        let completion = parse_completion(ProviderKind::Google, "gemini-1.5-flash", payload).unwrap();
        assert_eq!(completion.text, "Acme.");
        assert_eq!(completion.tokens_used, 9);
    }

    #[test]
    fn test_empty_completion_is_failure() {
        let payload = json!({ "choices": [{ "message": { "content": "  " } }] });
        assert!(matches!(
            parse_completion(ProviderKind::Perplexity, "sonar", payload),
            Err(BackendError::Empty)
        ));

        let payload = json!({ "candidates": [] });
        assert!(matches!(
            parse_completion(ProviderKind::Google, "gemini-1.5-flash", payload),
            Err(BackendError::Empty)
        ));
    }

    #[tokio::test]
    async fn test_missing_key_fails_before_network() {
        let backend = HttpBackend::new(ProviderKind::Anthropic, None, Duration::from_secs(1)).unwrap();
        let request = QueryRequest::new("hi", ProviderKind::Anthropic);
        let err = backend.complete(&request, "claude", "sys").await.unwrap_err();
        assert!(matches!(err, BackendError::MissingKey(ProviderKind::Anthropic)));
        assert!(!err.is_retryable());
    }
}
