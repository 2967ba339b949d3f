use std::sync::Arc;
use std::time::Duration;

use tracing::{instrument, warn};

use askrepo_core::context::LlmContext;
use askrepo_core::errors::GatewayError;
use askrepo_core::messages::Turn;
use askrepo_core::provider::{CompletionOptions, LanguageModel};

const SYSTEM_PROMPT: &str = "You are a helpful code assistant answering questions about a codebase \
in a chat workspace. Answers are shown in a chat client that does not render markdown.

FORMATTING RULES:
- Do NOT use markdown headers (###) or bold text (**)
- Do NOT use asterisks, hashes, or other markdown symbols
- Use plain text only with simple line breaks and spacing for structure
- If the answer contains code, use plain code blocks or inline code only

If the tool's response is unclear or reports a problem, say so.";

const FALLBACK_NOTE: &str = "[Note: AI processing unavailable, showing raw response]";

/// Final answer text. `fallback` holds the model failure when the text is
/// the raw finding instead of a synthesized answer.
#[derive(Clone, Debug)]
pub struct Synthesis {
    pub text: String,
    pub fallback: Option<GatewayError>,
}

/// Turns an agent finding into a chat-ready answer.
pub struct ResponseSynthesizer {
    model: Arc<dyn LanguageModel>,
    timeout: Duration,
    options: CompletionOptions,
}

impl ResponseSynthesizer {
    pub fn new(model: Arc<dyn LanguageModel>, timeout: Duration) -> Self {
        Self {
            model,
            timeout,
            options: CompletionOptions::default(),
        }
    }

    pub fn with_options(mut self, options: CompletionOptions) -> Self {
        self.options = options;
        self
    }

    /// Prior turns as chat messages, then one user message with the
    /// question and the agent's finding.
    pub fn build_context(query: &str, finding: &str, history: &[Turn]) -> LlmContext {
        let mut context = LlmContext::from_history(history).with_system(SYSTEM_PROMPT);
        let follow_up = if history.is_empty() {
            ""
        } else {
            "\n\nThis may be a follow-up question; use the earlier messages to resolve what it refers to."
        };
        context.push_user(format!(
            "A user asked: \"{query}\"\n\n\
             The codebase query tool returned the following response:\n\n\
             {finding}{follow_up}\n\n\
             Please provide a clear, concise, and helpful answer to the user's question \
             based on the information above."
        ));
        context
    }

    /// Never fails: when the model is unavailable the raw finding is
    /// returned with a notice and the cause kept in `fallback`.
    #[instrument(skip_all, fields(model = %self.model.model(), history = history.len()))]
    pub async fn synthesize(&self, query: &str, finding: &str, history: &[Turn]) -> Synthesis {
        let context = Self::build_context(query, finding, history);

        let outcome = tokio::time::timeout(self.timeout, self.model.complete(&context, &self.options))
            .await
            .unwrap_or(Err(GatewayError::Timeout(self.timeout)));

        match outcome {
            Ok(completion) if !completion.text.trim().is_empty() => Synthesis {
                text: completion.text,
                fallback: None,
            },
            Ok(_) => {
                warn!("synthesis returned empty text, falling back to raw finding");
                Self::fallback(finding, GatewayError::EmptyCompletion)
            }
            Err(e) => {
                warn!(error = %e, kind = e.error_kind(), "synthesis failed, falling back to raw finding");
                Self::fallback(finding, e)
            }
        }
    }

    fn fallback(finding: &str, cause: GatewayError) -> Synthesis {
        Synthesis {
            text: format!("{finding}\n\n{FALLBACK_NOTE}"),
            fallback: Some(cause),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use askrepo_core::context::ChatRole;
    use askrepo_llm::{MockProvider, MockResponse};

    fn synthesizer(mock: &Arc<MockProvider>, timeout: Duration) -> ResponseSynthesizer {
        ResponseSynthesizer::new(mock.clone(), timeout)
    }

    #[tokio::test]
    async fn formats_answer() {
        let mock = Arc::new(MockProvider::new(vec![MockResponse::text("Routing is in src/http.rs.")]));
        let out = synthesizer(&mock, Duration::from_secs(5))
            .synthesize("where is routing?", "src/http.rs defines Router", &[])
            .await;
        assert_eq!(out.text, "Routing is in src/http.rs.");
        assert!(out.fallback.is_none());
    }

    #[tokio::test]
    async fn history_precedes_final_message() {
        let mock = Arc::new(MockProvider::new(vec![MockResponse::text("ok")]));
        let history = vec![Turn::user("what is X?"), Turn::assistant("X is a parser.")];
        synthesizer(&mock, Duration::from_secs(5))
            .synthesize("how is it tested?", "tests/x.rs", &history)
            .await;

        let ctx = &mock.captured()[0];
        assert!(ctx.system_prompt.as_deref().unwrap().contains("plain text"));
        assert_eq!(ctx.messages.len(), 3);
        assert_eq!(ctx.messages[0].content, "what is X?");
        assert_eq!(ctx.messages[1].role, ChatRole::Assistant);
        let last = &ctx.messages[2].content;
        assert!(last.contains("how is it tested?"));
        assert!(last.contains("tests/x.rs"));
        assert!(last.contains("follow-up"));
    }

    #[tokio::test]
    async fn error_falls_back_to_finding() {
        let mock = Arc::new(MockProvider::new(vec![MockResponse::Error(
            GatewayError::AuthenticationFailed("bad key".into()),
        )]));
        let out = synthesizer(&mock, Duration::from_secs(5))
            .synthesize("q", "the raw finding", &[])
            .await;
        assert_eq!(
            out.fallback.as_ref().map(GatewayError::error_kind),
            Some("authentication_failed")
        );
        assert!(out.text.starts_with("the raw finding"));
        assert!(out.text.ends_with(FALLBACK_NOTE));
        assert!(!out.text.contains("bad key"));
    }

    #[tokio::test]
    async fn empty_completion_falls_back() {
        let mock = Arc::new(MockProvider::new(vec![MockResponse::text("  \n")]));
        let out = synthesizer(&mock, Duration::from_secs(5))
            .synthesize("q", "finding", &[])
            .await;
        assert!(matches!(out.fallback, Some(GatewayError::EmptyCompletion)));
        assert!(out.text.contains("finding"));
    }

    #[tokio::test(start_paused = true)]
    async fn overall_timeout_falls_back() {
        let mock = Arc::new(MockProvider::new(vec![MockResponse::delayed(
            Duration::from_secs(120),
            MockResponse::text("too late"),
        )]));
        let out = synthesizer(&mock, Duration::from_secs(60))
            .synthesize("q", "finding", &[])
            .await;
        assert!(matches!(out.fallback, Some(GatewayError::Timeout(d)) if d == Duration::from_secs(60)));
        assert!(!out.text.contains("too late"));
    }
}
