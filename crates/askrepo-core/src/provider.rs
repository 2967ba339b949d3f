use async_trait::async_trait;

use crate::context::LlmContext;
use crate::errors::GatewayError;

/// Options controlling a single completion.
#[derive(Clone, Debug, Default)]
pub struct CompletionOptions {
    pub max_tokens: Option<u32>,
    pub temperature: Option<f64>,
}

/// A finished, non-streamed completion.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Completion {
    pub text: String,
    pub finish_reason: Option<String>,
}

impl Completion {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            finish_reason: Some("stop".into()),
        }
    }
}

/// Trait implemented by each language-model backend.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    fn name(&self) -> &str;
    fn model(&self) -> &str;

    async fn complete(
        &self,
        context: &LlmContext,
        options: &CompletionOptions,
    ) -> Result<Completion, GatewayError>;
}
