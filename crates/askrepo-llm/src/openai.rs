//! Client for OpenAI-compatible `/chat/completions` endpoints.
//!
//! Gemini, OpenAI and most local model servers expose this shape. The
//! response is read whole; no streaming.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, AUTHORIZATION, CONTENT_TYPE, RETRY_AFTER};
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use askrepo_core::context::{ChatMessage, ChatRole, LlmContext};
use askrepo_core::errors::GatewayError;
use askrepo_core::provider::{Completion, CompletionOptions, LanguageModel};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Debug)]
pub struct ChatCompletionsConfig {
    /// API root; `/chat/completions` is appended.
    pub base_url: String,
    pub model: String,
    /// Sent as a bearer token when present.
    pub api_key: Option<SecretString>,
    /// Budget for a single HTTP attempt.
    pub request_timeout: Duration,
}

pub struct ChatCompletionsProvider {
    client: Client,
    endpoint: String,
    model: String,
    api_key: Option<SecretString>,
    request_timeout: Duration,
}

#[derive(Serialize)]
struct RequestBody<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
}

#[derive(Deserialize)]
struct ResponseBody {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

impl ChatCompletionsProvider {
    pub fn new(config: ChatCompletionsConfig) -> Result<Self, GatewayError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| GatewayError::NetworkError(format!("http client: {e}")))?;

        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            model: config.model,
            api_key: config.api_key,
            request_timeout: config.request_timeout,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

fn build_messages(context: &LlmContext) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(context.messages.len() + 1);
    if let Some(system) = &context.system_prompt {
        messages.push(ChatMessage {
            role: ChatRole::System,
            content: system.clone(),
        });
    }
    messages.extend(context.messages.iter().cloned());
    messages
}

/// `Retry-After` in delta-seconds form. HTTP-date values are ignored.
fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?;
    let secs: f64 = value.trim().parse().ok()?;
    (secs.is_finite() && secs >= 0.0).then(|| Duration::from_secs_f64(secs))
}

fn parse_completion(body: &str) -> Result<Completion, GatewayError> {
    let parsed: ResponseBody = serde_json::from_str(body)
        .map_err(|e| GatewayError::InvalidResponse(format!("decode: {e}")))?;
    let choice = parsed
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| GatewayError::InvalidResponse("no choices".into()))?;

    let text = choice.message.content.unwrap_or_default();
    if text.trim().is_empty() {
        return Err(GatewayError::EmptyCompletion);
    }
    Ok(Completion {
        text,
        finish_reason: choice.finish_reason,
    })
}

#[async_trait]
impl LanguageModel for ChatCompletionsProvider {
    fn name(&self) -> &str {
        "openai-compatible"
    }

    fn model(&self) -> &str {
        &self.model
    }

    #[instrument(skip(self, context, options), fields(model = %self.model))]
    async fn complete(
        &self,
        context: &LlmContext,
        options: &CompletionOptions,
    ) -> Result<Completion, GatewayError> {
        let body = RequestBody {
            model: &self.model,
            messages: build_messages(context),
            max_tokens: options.max_tokens,
            temperature: options.temperature,
        };

        let mut req = self
            .client
            .post(&self.endpoint)
            .timeout(self.request_timeout)
            .header(CONTENT_TYPE, "application/json")
            .json(&body);
        if let Some(key) = &self.api_key {
            req = req.header(AUTHORIZATION, format!("Bearer {}", key.expose_secret()));
        }

        let resp = req.send().await.map_err(|e| {
            if e.is_timeout() {
                GatewayError::Timeout(self.request_timeout)
            } else {
                GatewayError::NetworkError(e.to_string())
            }
        })?;

        let status = resp.status().as_u16();
        let retry_after = parse_retry_after(resp.headers());
        let text = resp.text().await.map_err(|e| {
            if e.is_timeout() {
                GatewayError::Timeout(self.request_timeout)
            } else {
                GatewayError::NetworkError(e.to_string())
            }
        })?;

        if !(200..300).contains(&status) {
            debug!(status, "completion request rejected");
            return Err(GatewayError::from_status(status, text, retry_after));
        }

        parse_completion(&text)
    }
}
