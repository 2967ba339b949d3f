use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use askrepo_core::context::LlmContext;
use askrepo_core::errors::GatewayError;
use askrepo_core::provider::{Completion, CompletionOptions, LanguageModel};

/// Pre-programmed responses for deterministic testing without API calls.
#[derive(Clone, Debug)]
pub enum MockResponse {
    Text(String),
    Error(GatewayError),
    /// Wait a duration, then produce the inner response.
    Delay(Duration, Box<MockResponse>),
}

impl MockResponse {
    pub fn text(text: &str) -> Self {
        Self::Text(text.to_string())
    }

    pub fn delayed(delay: Duration, inner: MockResponse) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// Language model returning pre-programmed responses in sequence.
///
/// Every context it receives is captured for later assertions.
pub struct MockProvider {
    responses: Vec<MockResponse>,
    call_count: AtomicUsize,
    captured: Mutex<Vec<LlmContext>>,
}

impl MockProvider {
    pub fn new(responses: Vec<MockResponse>) -> Self {
        Self {
            responses,
            call_count: AtomicUsize::new(0),
            captured: Mutex::new(Vec::new()),
        }
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::Relaxed)
    }

    /// Contexts passed to `complete`, in call order.
    pub fn captured(&self) -> Vec<LlmContext> {
        self.captured.lock().clone()
    }
}

#[async_trait]
impl LanguageModel for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    fn model(&self) -> &str {
        "mock-model"
    }

    async fn complete(
        &self,
        context: &LlmContext,
        _options: &CompletionOptions,
    ) -> Result<Completion, GatewayError> {
        let idx = self.call_count.fetch_add(1, Ordering::Relaxed);
        self.captured.lock().push(context.clone());

        let Some(mut response) = self.responses.get(idx) else {
            return Err(GatewayError::InvalidRequest(format!(
                "MockProvider: no response configured for call {idx}"
            )));
        };

        loop {
            match response {
                MockResponse::Delay(delay, inner) => {
                    tokio::time::sleep(*delay).await;
                    response = inner;
                }
                MockResponse::Text(text) => return Ok(Completion::text(text.clone())),
                MockResponse::Error(e) => return Err(e.clone()),
            }
        }
    }
}
