//! Shared fixtures for orchestrator and server tests.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tempfile::TempDir;

use askrepo_core::ids::SessionKey;
use askrepo_core::messages::{Role, Turn};
use askrepo_engine::{
    AgentInvocation, AgentPool, AgentResult, AgentStatus, AnalysisAgent, RepoGuard,
    ResponseSynthesizer,
};
use askrepo_llm::{MockProvider, MockResponse};
use askrepo_store::{MemorySessionStore, SessionStore, StoreError};

use crate::orchestrator::{Orchestrator, OrchestratorConfig, QuestionEvent};

pub const ACTOR: &str = "U1";
pub const CHANNEL: &str = "C1";
pub const THREAD: &str = "1700000000.000100";

pub fn question(text: &str) -> QuestionEvent {
    QuestionEvent {
        actor_id: ACTOR.into(),
        channel_id: CHANNEL.into(),
        thread_id: Some(THREAD.into()),
        text: text.into(),
    }
}

fn is_writable(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|m| m.permissions().mode() & 0o200 != 0)
        .unwrap_or(false)
}

/// Agent with a canned outcome that records what it was asked.
pub struct FakeAgent {
    status: AgentStatus,
    finding: Option<String>,
    delay: Duration,
    invocations: Mutex<Vec<AgentInvocation>>,
    writable: Mutex<Vec<bool>>,
}

impl Default for FakeAgent {
    fn default() -> Self {
        Self::answering("src/lib.rs wires everything together")
    }
}

impl FakeAgent {
    pub fn answering(finding: &str) -> Self {
        Self {
            status: AgentStatus::Success,
            finding: Some(finding.into()),
            delay: Duration::ZERO,
            invocations: Mutex::new(Vec::new()),
            writable: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(status: AgentStatus) -> Self {
        Self {
            status,
            finding: None,
            ..Self::answering("")
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn invocations(&self) -> Vec<AgentInvocation> {
        self.invocations.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.invocations.lock().len()
    }

    /// Whether the workspace root had its owner write bit set, per run.
    pub fn observed_writable(&self) -> Vec<bool> {
        self.writable.lock().clone()
    }
}

#[async_trait]
impl AnalysisAgent for FakeAgent {
    async fn run(&self, invocation: &AgentInvocation) -> AgentResult {
        let started = Instant::now();
        self.invocations.lock().push(invocation.clone());
        self.writable.lock().push(is_writable(&invocation.workspace));
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        AgentResult {
            status: self.status,
            finding: self.finding.clone(),
            raw_stdout: None,
            raw_stderr: None,
            exit_code: Some(0),
            elapsed: started.elapsed(),
        }
    }
}

/// Store whose every operation fails.
pub struct BrokenStore;

impl SessionStore for BrokenStore {
    fn get_context(&self, _key: &SessionKey) -> Result<Vec<Turn>, StoreError> {
        Err(StoreError::Database("disk I/O error".into()))
    }

    fn append_turn(&self, _key: &SessionKey, _role: Role, _content: &str) -> Result<(), StoreError> {
        Err(StoreError::Database("disk I/O error".into()))
    }

    fn purge_expired(&self) -> Result<usize, StoreError> {
        Err(StoreError::Database("disk I/O error".into()))
    }

    fn evict(&self, _key: &SessionKey) -> Result<bool, StoreError> {
        Err(StoreError::Database("disk I/O error".into()))
    }

    fn backend(&self) -> &'static str {
        "broken"
    }
}

pub struct Setup {
    pub agent: FakeAgent,
    pub responses: Vec<MockResponse>,
    /// Overrides the temporary repository.
    pub repository: Option<PathBuf>,
    pub enforce: bool,
    pub broken_store: bool,
    pub max_concurrent: usize,
    pub queue_capacity: usize,
}

impl Default for Setup {
    fn default() -> Self {
        Self {
            agent: FakeAgent::default(),
            responses: Vec::new(),
            repository: None,
            enforce: false,
            broken_store: false,
            max_concurrent: 4,
            queue_capacity: 4,
        }
    }
}

pub struct Harness {
    pub orchestrator: Arc<Orchestrator>,
    pub agent: Arc<FakeAgent>,
    pub model: Arc<MockProvider>,
    pub guard: Arc<RepoGuard>,
    pub store: Arc<dyn SessionStore>,
    pub repo: TempDir,
}

impl Harness {
    /// Turns recorded for the default test session.
    pub fn history(&self) -> Vec<Turn> {
        self.store
            .get_context(&SessionKey::new(ACTOR, CHANNEL, Some(THREAD)))
            .unwrap_or_default()
    }

    pub fn repo_is_writable(&self) -> bool {
        is_writable(self.repo.path())
            && is_writable(&self.repo.path().join("src"))
            && is_writable(&self.repo.path().join("src/main.rs"))
    }
}

pub fn harness(setup: Setup) -> Harness {
    let repo = tempfile::tempdir().unwrap();
    std::fs::create_dir(repo.path().join("src")).unwrap();
    std::fs::write(repo.path().join("src/main.rs"), "fn main() {}\n").unwrap();

    let store: Arc<dyn SessionStore> = if setup.broken_store {
        Arc::new(BrokenStore)
    } else {
        Arc::new(MemorySessionStore::new(10, Duration::from_secs(3600), 100))
    };
    let agent = Arc::new(setup.agent);
    let model = Arc::new(MockProvider::new(setup.responses));
    let guard = Arc::new(RepoGuard::from_enforcement(
        setup.enforce,
        Duration::from_secs(5),
    ));
    let pool = Arc::new(AgentPool::new(
        agent.clone(),
        setup.max_concurrent,
        setup.queue_capacity,
    ));
    let synthesizer = Arc::new(ResponseSynthesizer::new(
        model.clone(),
        Duration::from_secs(5),
    ));

    let config = OrchestratorConfig {
        repository: setup
            .repository
            .unwrap_or_else(|| repo.path().to_path_buf()),
        agent_timeout: Duration::from_secs(600),
    };
    let orchestrator = Arc::new(Orchestrator::new(
        store.clone(),
        guard.clone(),
        pool,
        synthesizer,
        config,
    ));

    Harness {
        orchestrator,
        agent,
        model,
        guard,
        store,
        repo,
    }
}
