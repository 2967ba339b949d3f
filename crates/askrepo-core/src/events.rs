use serde::{Deserialize, Serialize};

use crate::ids::RequestId;

/// Stages of a single question as it moves through the pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryStage {
    ResolvingSession,
    AcquiringRepo,
    InvokingAgent,
    Synthesizing,
    Recording,
    Done,
    Failed,
}

impl QueryStage {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    /// Whether `next` is a legal successor of `self`.
    pub fn can_advance_to(&self, next: QueryStage) -> bool {
        use QueryStage::*;
        if self.is_terminal() {
            return false;
        }
        if next == Failed {
            return true;
        }
        matches!(
            (self, next),
            (ResolvingSession, AcquiringRepo)
                | (AcquiringRepo, InvokingAgent)
                | (InvokingAgent, Synthesizing)
                | (Synthesizing, Recording)
                | (Recording, Done)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ResolvingSession => "resolving_session",
            Self::AcquiringRepo => "acquiring_repo",
            Self::InvokingAgent => "invoking_agent",
            Self::Synthesizing => "synthesizing",
            Self::Recording => "recording",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for QueryStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a question ended, as reported to the transport.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QuestionStatus {
    Answered,
    /// Answered, but without synthesis or without conversation context.
    Degraded { reasons: Vec<String> },
    Busy,
    /// `retryable` tells the caller whether asking again later can help.
    Failed { error_kind: String, retryable: bool },
    /// Empty question; a greeting was returned.
    Greeting,
}

/// Lifecycle events broadcast while a question is handled. Transports use
/// these to drive ephemeral status indicators (e.g. a "processing" reaction).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum QueryEvent {
    #[serde(rename = "processing")]
    Processing {
        request_id: RequestId,
        session_key: String,
    },

    #[serde(rename = "stage_changed")]
    StageChanged {
        request_id: RequestId,
        stage: QueryStage,
    },

    #[serde(rename = "completed")]
    Completed {
        request_id: RequestId,
        status: QuestionStatus,
        duration_ms: u64,
    },
}

impl QueryEvent {
    pub fn request_id(&self) -> &RequestId {
        match self {
            Self::Processing { request_id, .. }
            | Self::StageChanged { request_id, .. }
            | Self::Completed { request_id, .. } => request_id,
        }
    }
}
