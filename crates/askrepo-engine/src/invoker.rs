use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, instrument, warn};

use askrepo_core::errors::QueryError;
use askrepo_core::messages::{format_transcript, Turn};

const MAX_OUTPUT_BYTES: usize = 1024 * 1024;

/// Keys consulted for the finding text, in order, when the envelope is not
/// a `type: "result"` message.
const FINDING_KEYS: &[&str] = &["response", "content", "text", "summary"];

/// One request to the external analysis agent.
#[derive(Clone, Debug)]
pub struct AgentInvocation {
    pub query: String,
    pub workspace: PathBuf,
    /// Prior turns of the conversation, oldest first.
    pub context: Vec<Turn>,
    pub timeout: Duration,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Success,
    Timeout,
    MalformedOutput,
    ProcessError,
}

/// What the agent produced. Raw streams are kept for the operational log only.
#[derive(Clone, Debug)]
pub struct AgentResult {
    pub status: AgentStatus,
    pub finding: Option<String>,
    pub raw_stdout: Option<String>,
    pub raw_stderr: Option<String>,
    pub exit_code: Option<i32>,
    pub elapsed: Duration,
}

impl AgentResult {
    fn failed(status: AgentStatus, stderr: impl Into<String>, elapsed: Duration) -> Self {
        Self {
            status,
            finding: None,
            raw_stdout: None,
            raw_stderr: Some(stderr.into()),
            exit_code: None,
            elapsed,
        }
    }

    /// The finding on success, or the matching request failure.
    pub fn into_finding(self, budget: Duration) -> Result<String, QueryError> {
        match (self.status, self.finding) {
            (AgentStatus::Success, Some(finding)) => Ok(finding),
            (AgentStatus::Success, None) | (AgentStatus::MalformedOutput, _) => {
                Err(QueryError::AgentMalformedOutput)
            }
            (AgentStatus::Timeout, _) => Err(QueryError::AgentTimeout(budget)),
            (AgentStatus::ProcessError, _) => {
                let detail = match (self.exit_code, self.raw_stderr.as_deref()) {
                    (Some(code), Some(err)) if !err.trim().is_empty() => {
                        format!("exit {code}: {}", err.trim())
                    }
                    (Some(code), _) => format!("exit {code}"),
                    (None, Some(err)) => err.trim().to_string(),
                    (None, None) => "unknown failure".into(),
                };
                Err(QueryError::AgentProcessError(detail))
            }
        }
    }
}

/// An analysis backend the orchestrator can delegate a question to.
#[async_trait]
pub trait AnalysisAgent: Send + Sync {
    /// Run one invocation to completion. Failures are reported in the
    /// returned status, never as a panic.
    async fn run(&self, invocation: &AgentInvocation) -> AgentResult;
}

/// Prefix the query with the conversation so far, so follow-ups make sense
/// to an agent that has no memory of its own.
pub fn augment_query(query: &str, context: &[Turn]) -> String {
    if context.is_empty() {
        return query.to_string();
    }
    format!(
        "Previous conversation:\n{}\n\nCurrent question: {query}",
        format_transcript(context)
    )
}

/// Runs the agent as a subprocess with an argument vector; never a shell.
pub struct ProcessAgent {
    command: String,
    args: Vec<String>,
    end_of_options: bool,
}

impl ProcessAgent {
    pub fn new(command: impl Into<String>, args: Vec<String>, end_of_options: bool) -> Self {
        Self {
            command: command.into(),
            args,
            end_of_options,
        }
    }

    /// `<args…> --workspace <path> [--] <query>`
    pub fn build_args(&self, invocation: &AgentInvocation) -> Vec<String> {
        let mut argv = self.args.clone();
        argv.push("--workspace".into());
        argv.push(invocation.workspace.display().to_string());
        if self.end_of_options {
            argv.push("--".into());
        }
        argv.push(augment_query(&invocation.query, &invocation.context));
        argv
    }
}

/// Read a stream to EOF, keeping at most `cap` bytes.
async fn read_capped<R: AsyncRead + Unpin>(mut reader: R, cap: usize) -> (String, bool) {
    let mut kept = Vec::new();
    let mut buf = [0u8; 8192];
    let mut truncated = false;
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let room = cap.saturating_sub(kept.len());
                if n > room {
                    truncated = true;
                }
                kept.extend_from_slice(&buf[..n.min(room)]);
            }
        }
    }
    (String::from_utf8_lossy(&kept).into_owned(), truncated)
}

fn extract_finding(envelope: &Map<String, Value>) -> String {
    let non_empty = |key: &str| {
        envelope
            .get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
            .map(str::to_string)
    };

    if envelope.get("type").and_then(Value::as_str) == Some("result") {
        if let Some(result) = non_empty("result") {
            return result;
        }
    }
    FINDING_KEYS
        .iter()
        .find_map(|key| non_empty(key))
        .unwrap_or_else(|| {
            serde_json::to_string_pretty(envelope).unwrap_or_else(|_| "{}".into())
        })
}

/// Classify a finished process by its exit code and output.
pub fn parse_output(exit_code: Option<i32>, stdout: &str) -> (AgentStatus, Option<String>) {
    let parsed = serde_json::from_str::<Value>(stdout.trim()).ok();
    match parsed {
        Some(Value::Object(envelope)) => {
            if envelope.get("is_error").and_then(Value::as_bool) == Some(true) {
                return (AgentStatus::ProcessError, None);
            }
            if exit_code != Some(0) {
                warn!(?exit_code, "agent exited non-zero but produced a result");
            }
            (AgentStatus::Success, Some(extract_finding(&envelope)))
        }
        _ if exit_code == Some(0) => (AgentStatus::MalformedOutput, None),
        _ => (AgentStatus::ProcessError, None),
    }
}

#[async_trait]
impl AnalysisAgent for ProcessAgent {
    #[instrument(skip(self, invocation), fields(command = %self.command, timeout_ms = invocation.timeout.as_millis() as u64))]
    async fn run(&self, invocation: &AgentInvocation) -> AgentResult {
        let start = Instant::now();
        let argv = self.build_args(invocation);

        let spawned = tokio::process::Command::new(&self.command)
            .args(&argv)
            .current_dir(&invocation.workspace)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true)
            .spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                warn!(error = %e, "failed to spawn agent");
                return AgentResult::failed(
                    AgentStatus::ProcessError,
                    format!("spawn {}: {e}", self.command),
                    start.elapsed(),
                );
            }
        };
        let pid = child.id();

        // Exit and EOF on both pipes share one deadline: a backgrounded
        // grandchild can hold the pipes open after the agent itself exits.
        let stdout = read_optional(child.stdout.take());
        let stderr = read_optional(child.stderr.take());
        let finished = tokio::time::timeout(invocation.timeout, async {
            tokio::join!(child.wait(), stdout, stderr)
        })
        .await;

        // Whatever is left of the group must not outlive the run.
        if let Some(pid) = pid {
            kill_group(pid);
        }

        let (status, (stdout, out_truncated), (stderr, _)) = match finished {
            Ok((Ok(status), out, err)) => (status, out, err),
            Ok((Err(e), _, _)) => {
                warn!(error = %e, "waiting on agent failed");
                reap(&mut child).await;
                return AgentResult::failed(AgentStatus::ProcessError, e.to_string(), start.elapsed());
            }
            Err(_) => {
                reap(&mut child).await;
                warn!(elapsed_ms = start.elapsed().as_millis() as u64, "agent timed out");
                return AgentResult::failed(
                    AgentStatus::Timeout,
                    format!("killed after {:?}", invocation.timeout),
                    start.elapsed(),
                );
            }
        };
        if out_truncated {
            warn!(cap = MAX_OUTPUT_BYTES, "agent stdout truncated");
        }

        let exit_code = status.code();
        let (agent_status, finding) = parse_output(exit_code, &stdout);
        if agent_status != AgentStatus::Success {
            warn!(
                ?exit_code,
                status = ?agent_status,
                stderr = %stderr.trim(),
                "agent run failed"
            );
        } else {
            debug!(?exit_code, "agent run succeeded");
        }

        AgentResult {
            status: agent_status,
            finding,
            raw_stdout: Some(stdout),
            raw_stderr: Some(stderr),
            exit_code,
            elapsed: start.elapsed(),
        }
    }
}

async fn read_optional<R: AsyncRead + Unpin>(reader: Option<R>) -> (String, bool) {
    match reader {
        Some(reader) => read_capped(reader, MAX_OUTPUT_BYTES).await,
        None => (String::new(), false),
    }
}

/// SIGKILL the agent's process group. The group id is the agent's pid.
#[allow(unsafe_code)]
fn kill_group(pid: u32) {
    let Ok(pgid) = libc::pid_t::try_from(pid) else {
        return;
    };
    // SAFETY: kill(2) takes plain integers and touches no memory of ours.
    let rc = unsafe { libc::kill(-pgid, libc::SIGKILL) };
    if rc != 0 {
        // ESRCH: the group already exited
        debug!(pgid, error = %std::io::Error::last_os_error(), "process group kill skipped");
    }
}

/// Kill (if still running) and reap the direct child.
async fn reap(child: &mut tokio::process::Child) {
    if let Err(e) = child.kill().await {
        debug!(error = %e, "agent already reaped");
    }
}

#[derive(Debug, thiserror::Error)]
pub enum InvokeError {
    #[error("agent pool busy")]
    Busy,
    #[error("agent pool closed")]
    Closed,
}

/// Fixed-capacity pool in front of an [`AnalysisAgent`].
///
/// At most `max_concurrent` runs execute at once and at most
/// `queue_capacity` more wait for a slot; anything beyond is rejected with
/// [`InvokeError::Busy`] without waiting.
pub struct AgentPool {
    agent: Arc<dyn AnalysisAgent>,
    slots: Arc<Semaphore>,
    admission: Arc<Semaphore>,
}

/// A reserved place in the pool (running or queued).
pub struct Admission {
    agent: Arc<dyn AnalysisAgent>,
    slots: Arc<Semaphore>,
    _ticket: OwnedSemaphorePermit,
}

impl AgentPool {
    pub fn new(agent: Arc<dyn AnalysisAgent>, max_concurrent: usize, queue_capacity: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            agent,
            slots: Arc::new(Semaphore::new(max_concurrent)),
            admission: Arc::new(Semaphore::new(max_concurrent + queue_capacity)),
        }
    }

    /// Reserve a place without waiting.
    pub fn admit(&self) -> Result<Admission, InvokeError> {
        let ticket = Arc::clone(&self.admission)
            .try_acquire_owned()
            .map_err(|_| InvokeError::Busy)?;
        Ok(Admission {
            agent: Arc::clone(&self.agent),
            slots: Arc::clone(&self.slots),
            _ticket: ticket,
        })
    }

    /// Admit and run in one step.
    pub async fn run(&self, invocation: &AgentInvocation) -> Result<AgentResult, InvokeError> {
        self.admit()?.run(invocation).await
    }

    /// Places (running or queued) still free.
    pub fn available(&self) -> usize {
        self.admission.available_permits()
    }
}

impl Admission {
    /// Wait for a run slot, then run the agent.
    pub async fn run(self, invocation: &AgentInvocation) -> Result<AgentResult, InvokeError> {
        let _slot = Arc::clone(&self.slots)
            .acquire_owned()
            .await
            .map_err(|_| InvokeError::Closed)?;
        Ok(self.agent.run(invocation).await)
    }
}
