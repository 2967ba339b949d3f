//! Per-question state machine.
//!
//! `RESOLVING_SESSION → ACQUIRING_REPO → INVOKING_AGENT → SYNTHESIZING →
//! RECORDING → DONE`, with `FAILED` reachable from any non-terminal stage.
//! The repository hold taken in `ACQUIRING_REPO` is released before the
//! agent's outcome is looked at, whatever that outcome is.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, info_span, warn, Instrument};

use askrepo_core::errors::QueryError;
use askrepo_core::events::{QueryEvent, QueryStage, QuestionStatus};
use askrepo_core::ids::{RequestId, SessionKey};
use askrepo_core::messages::Role;
use askrepo_engine::{AgentInvocation, AgentPool, InvokeError, RepoGuard, ResponseSynthesizer};
use askrepo_store::SessionStore;

const GREETING: &str =
    "Hi! I'm ready to help you explore the codebase. Ask me a question about the code.";

const EVENT_CAPACITY: usize = 256;

/// A question as delivered by any transport.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QuestionEvent {
    pub actor_id: String,
    pub channel_id: String,
    #[serde(default)]
    pub thread_id: Option<String>,
    pub text: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QuestionResponse {
    pub request_id: RequestId,
    pub text: String,
    pub status: QuestionStatus,
}

#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
    /// Repository every question is asked against.
    pub repository: PathBuf,
    pub agent_timeout: Duration,
}

pub struct Orchestrator {
    store: Arc<dyn SessionStore>,
    guard: Arc<RepoGuard>,
    pool: Arc<AgentPool>,
    synthesizer: Arc<ResponseSynthesizer>,
    config: OrchestratorConfig,
    event_tx: broadcast::Sender<QueryEvent>,
}

/// Tracks the current stage of one request and broadcasts each transition.
struct Progress<'a> {
    tx: &'a broadcast::Sender<QueryEvent>,
    request_id: &'a RequestId,
    stage: QueryStage,
}

impl<'a> Progress<'a> {
    fn start(tx: &'a broadcast::Sender<QueryEvent>, request_id: &'a RequestId) -> Self {
        let progress = Self {
            tx,
            request_id,
            stage: QueryStage::ResolvingSession,
        };
        progress.emit();
        progress
    }

    fn advance(&mut self, next: QueryStage) {
        if !self.stage.can_advance_to(next) {
            warn!(from = %self.stage, to = %next, "illegal stage transition ignored");
            return;
        }
        debug!(from = %self.stage, to = %next, "stage transition");
        self.stage = next;
        self.emit();
    }

    fn emit(&self) {
        let _ = self.tx.send(QueryEvent::StageChanged {
            request_id: self.request_id.clone(),
            stage: self.stage,
        });
    }
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn SessionStore>,
        guard: Arc<RepoGuard>,
        pool: Arc<AgentPool>,
        synthesizer: Arc<ResponseSynthesizer>,
        config: OrchestratorConfig,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            store,
            guard,
            pool,
            synthesizer,
            config,
            event_tx,
        }
    }

    /// Lifecycle events for every question handled from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<QueryEvent> {
        self.event_tx.subscribe()
    }

    /// Free places (running or queued) in the agent pool.
    pub fn agent_capacity(&self) -> usize {
        self.pool.available()
    }

    /// Answer one question. Never fails: every failure is turned into a
    /// chat-safe message with a matching status.
    pub async fn handle_question(&self, event: QuestionEvent) -> QuestionResponse {
        let request_id = RequestId::new();
        let key = SessionKey::new(&event.actor_id, &event.channel_id, event.thread_id.as_deref());
        let span = info_span!("question", request_id = %request_id, session_key = %key);

        async {
            let started = Instant::now();
            let question = event.text.trim();

            let (text, status) = if question.is_empty() {
                (GREETING.to_string(), QuestionStatus::Greeting)
            } else {
                let _ = self.event_tx.send(QueryEvent::Processing {
                    request_id: request_id.clone(),
                    session_key: key.to_string(),
                });
                self.run(&request_id, &key, question).await
            };

            let duration_ms = started.elapsed().as_millis() as u64;
            info!(status = ?status, duration_ms, "question handled");
            let _ = self.event_tx.send(QueryEvent::Completed {
                request_id: request_id.clone(),
                status: status.clone(),
                duration_ms,
            });

            QuestionResponse {
                request_id: request_id.clone(),
                text,
                status,
            }
        }
        .instrument(span)
        .await
    }

    async fn run(
        &self,
        request_id: &RequestId,
        key: &SessionKey,
        question: &str,
    ) -> (String, QuestionStatus) {
        let mut progress = Progress::start(&self.event_tx, request_id);
        let mut degraded: Vec<String> = Vec::new();

        // RESOLVING_SESSION
        let history = match self.store.get_context(key) {
            Ok(history) => history,
            Err(e) => {
                let err = QueryError::SessionStoreDegraded(e.to_string());
                warn!(error = %err, "continuing without conversation context");
                degraded.push(err.error_kind().to_string());
                Vec::new()
            }
        };

        let admission = match self.pool.admit() {
            Ok(admission) => admission,
            Err(_) => return Self::fail(&mut progress, QueryError::PoolSaturated),
        };

        // ACQUIRING_REPO
        progress.advance(QueryStage::AcquiringRepo);
        let handle = match self.guard.acquire(&self.config.repository).await {
            Ok(handle) => handle,
            Err(e) => return Self::fail(&mut progress, QueryError::RepositoryLock(e.to_string())),
        };

        // INVOKING_AGENT
        progress.advance(QueryStage::InvokingAgent);
        let invocation = AgentInvocation {
            query: question.to_string(),
            workspace: self.config.repository.clone(),
            context: history.clone(),
            timeout: self.config.agent_timeout,
        };
        let outcome = admission.run(&invocation).await;
        if let Err(e) = handle.release().await {
            warn!(error = %e, "repository release failed");
        }

        let finding = match outcome {
            Ok(result) => {
                debug!(
                    status = ?result.status,
                    elapsed_ms = result.elapsed.as_millis() as u64,
                    "agent finished"
                );
                match result.into_finding(self.config.agent_timeout) {
                    Ok(finding) => finding,
                    Err(err) => return Self::fail(&mut progress, err),
                }
            }
            Err(InvokeError::Busy) => return Self::fail(&mut progress, QueryError::PoolSaturated),
            Err(e @ InvokeError::Closed) => {
                return Self::fail(&mut progress, QueryError::AgentProcessError(e.to_string()))
            }
        };

        // SYNTHESIZING
        progress.advance(QueryStage::Synthesizing);
        let synthesis = self.synthesizer.synthesize(question, &finding, &history).await;
        if let Some(cause) = &synthesis.fallback {
            let err = QueryError::SynthesisUnavailable(cause.to_string());
            warn!(error = %err, cause_kind = cause.error_kind(), "answering with the raw finding");
            degraded.push(err.error_kind().to_string());
        }

        // RECORDING
        progress.advance(QueryStage::Recording);
        let recorded = self
            .store
            .append_turn(key, Role::User, question)
            .and_then(|()| self.store.append_turn(key, Role::Assistant, &synthesis.text));
        if let Err(e) = recorded {
            warn!(error = %e, "failed to record turns");
        }

        progress.advance(QueryStage::Done);
        let status = if degraded.is_empty() {
            QuestionStatus::Answered
        } else {
            QuestionStatus::Degraded { reasons: degraded }
        };
        (synthesis.text, status)
    }

    fn fail(progress: &mut Progress<'_>, err: QueryError) -> (String, QuestionStatus) {
        warn!(error = %err, kind = err.error_kind(), stage = %progress.stage, "question failed");
        progress.advance(QueryStage::Failed);
        let status = match err {
            QueryError::PoolSaturated => QuestionStatus::Busy,
            ref other => QuestionStatus::Failed {
                error_kind: other.error_kind().to_string(),
                retryable: other.is_retryable(),
            },
        };
        (err.user_message(), status)
    }
}
