use std::time::Duration;

/// Typed error hierarchy for language-model gateway calls.
/// Classifies errors as fatal (don't retry), retryable, or operational.
#[derive(Clone, Debug, thiserror::Error)]
pub enum GatewayError {
    // Fatal: never retried
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("empty completion")]
    EmptyCompletion,

    // Retryable
    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },
    #[error("server error {status}: {body}")]
    ServerError { status: u16, body: String },
    #[error("provider overloaded")]
    ProviderOverloaded,
    #[error("network error: {0}")]
    NetworkError(String),

    // Operational
    #[error("timeout after {0:?}")]
    Timeout(Duration),
    #[error("circuit open")]
    CircuitOpen,
}

impl GatewayError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. }
                | Self::ServerError { .. }
                | Self::ProviderOverloaded
                | Self::NetworkError(_)
                | Self::Timeout(_)
        )
    }

    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::AuthenticationFailed(_)
                | Self::InvalidRequest(_)
                | Self::InvalidResponse(_)
                | Self::EmptyCompletion
        )
    }

    pub fn suggested_delay(&self) -> Option<Duration> {
        if let Self::RateLimited { retry_after } = self {
            *retry_after
        } else {
            None
        }
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::AuthenticationFailed(_) => "authentication_failed",
            Self::InvalidRequest(_) => "invalid_request",
            Self::InvalidResponse(_) => "invalid_response",
            Self::EmptyCompletion => "empty_completion",
            Self::RateLimited { .. } => "rate_limited",
            Self::ServerError { .. } => "server_error",
            Self::ProviderOverloaded => "provider_overloaded",
            Self::NetworkError(_) => "network_error",
            Self::Timeout(_) => "timeout",
            Self::CircuitOpen => "circuit_open",
        }
    }

    /// Classify an HTTP status code into the appropriate error variant.
    pub fn from_status(status: u16, body: String, retry_after: Option<Duration>) -> Self {
        match status {
            401 | 403 => Self::AuthenticationFailed(body),
            400 | 404 | 422 => Self::InvalidRequest(body),
            429 => Self::RateLimited { retry_after },
            503 | 529 => Self::ProviderOverloaded,
            500..=599 => Self::ServerError { status, body },
            _ => Self::InvalidRequest(format!("unexpected status {status}: {body}")),
        }
    }
}

/// Request-level failure taxonomy of the question pipeline.
///
/// `Display` carries internal detail for the operational log;
/// [`QueryError::user_message`] is the only text a chat user ever sees.
#[derive(Clone, Debug, thiserror::Error)]
pub enum QueryError {
    #[error("session store degraded: {0}")]
    SessionStoreDegraded(String),
    #[error("repository lock failed: {0}")]
    RepositoryLock(String),
    #[error("agent timed out after {0:?}")]
    AgentTimeout(Duration),
    #[error("agent produced malformed output")]
    AgentMalformedOutput,
    #[error("agent process failed: {0}")]
    AgentProcessError(String),
    #[error("synthesis unavailable: {0}")]
    SynthesisUnavailable(String),
    #[error("agent pool saturated")]
    PoolSaturated,
}

impl QueryError {
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::SessionStoreDegraded(_) => "session_store_degraded",
            Self::RepositoryLock(_) => "repository_lock",
            Self::AgentTimeout(_) => "agent_timeout",
            Self::AgentMalformedOutput => "agent_malformed_output",
            Self::AgentProcessError(_) => "agent_process_error",
            Self::SynthesisUnavailable(_) => "synthesis_unavailable",
            Self::PoolSaturated => "pool_saturated",
        }
    }

    /// Whether asking the same question again later can reasonably succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::AgentTimeout(_))
    }

    /// Chat-safe explanation. Never includes paths, stderr, or agent output.
    pub fn user_message(&self) -> String {
        match self {
            Self::SessionStoreDegraded(_) => {
                "I couldn't load our earlier conversation, so I answered without it.".into()
            }
            Self::RepositoryLock(_) => "Sorry, I couldn't safely open the repository for analysis \
                 right now. Please try again in a moment."
                .into(),
            Self::AgentTimeout(budget) => format!(
                "Sorry, the code analysis took longer than {} and was stopped. \
                 Try asking a narrower question.",
                humanize(*budget)
            ),
            Self::AgentMalformedOutput => {
                "Sorry, the code analysis returned a result I couldn't read. Please try again."
                    .into()
            }
            Self::AgentProcessError(_) => {
                "Sorry, the code analysis tool failed to run. Please try again later.".into()
            }
            Self::SynthesisUnavailable(_) => {
                "The answer formatter is unavailable, so here is the raw analysis.".into()
            }
            Self::PoolSaturated => {
                "I'm busy answering other questions right now. Please try again in a minute."
                    .into()
            }
        }
    }
}

fn humanize(d: Duration) -> String {
    let secs = d.as_secs();
    if secs >= 60 && secs % 60 == 0 {
        let mins = secs / 60;
        if mins == 1 {
            "1 minute".into()
        } else {
            format!("{mins} minutes")
        }
    } else {
        format!("{secs} seconds")
    }
}
