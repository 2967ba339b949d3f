//! # askrepo
//!
//! Conversational code-query service binary. Wires settings, telemetry,
//! the session store, the repository guard, the agent pool and the
//! synthesizer together, then serves questions over HTTP or answers a
//! single question from the command line.

#![deny(unsafe_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use secrecy::SecretString;
use tokio_util::sync::CancellationToken;

use askrepo_core::events::QuestionStatus;
use askrepo_core::provider::CompletionOptions;
use askrepo_engine::{AgentPool, ProcessAgent, RepoGuard, ResponseSynthesizer};
use askrepo_llm::{ChatCompletionsConfig, ChatCompletionsProvider, ReliableConfig, ReliableProvider};
use askrepo_server::sweeper::spawn_sweeper;
use askrepo_server::{Orchestrator, OrchestratorConfig, QuestionEvent, ServerConfig};
use askrepo_settings::{AskrepoSettings, SessionBackend};
use askrepo_store::{MemorySessionStore, SessionStore, SqliteSessionStore};
use askrepo_telemetry::{init_telemetry, parse_level, LogFilter, OpsLog, TelemetryConfig};

/// Ask questions about a code repository in plain language.
#[derive(Parser, Debug)]
#[command(name = "askrepo", about = "Conversational code-query service")]
struct Cli {
    /// Settings file (defaults to ~/.askrepo/settings.json).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the HTTP transport.
    Serve {
        /// Host to bind (overrides settings).
        #[arg(long)]
        host: Option<String>,
        /// Port to bind, 0 for auto-assign (overrides settings).
        #[arg(long)]
        port: Option<u16>,
    },
    /// Answer one question and print the result.
    Ask {
        question: String,
        #[arg(long, default_value = "cli")]
        actor: String,
        #[arg(long, default_value = "local")]
        channel: String,
        #[arg(long)]
        thread: Option<String>,
    },
    /// Show persisted warnings and errors from the operational log.
    Logs {
        /// Every entry for one question, oldest first.
        #[arg(long, conflicts_with_all = ["session", "level", "since", "limit"])]
        request_id: Option<String>,
        /// Entries for one conversation (`actor:channel:thread`).
        #[arg(long)]
        session: Option<String>,
        /// Only this level (`warn` or `error`).
        #[arg(long)]
        level: Option<String>,
        /// RFC 3339 lower bound, e.g. 2026-10-19T00:00:00Z.
        #[arg(long)]
        since: Option<String>,
        #[arg(long)]
        limit: Option<u32>,
        /// One JSON object per line instead of text.
        #[arg(long)]
        json: bool,
    },
}

fn load(path: Option<&Path>) -> Result<AskrepoSettings> {
    let settings = match path {
        Some(path) => askrepo_settings::load_settings_from_path(path),
        None => askrepo_settings::load_settings(),
    };
    settings.context("failed to load settings")
}

fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory: {}", parent.display()))?;
    }
    Ok(())
}

fn build_store(settings: &AskrepoSettings) -> Result<Arc<dyn SessionStore>> {
    let conv = &settings.conversation;
    let store: Arc<dyn SessionStore> = match conv.backend {
        SessionBackend::Memory => Arc::new(MemorySessionStore::new(
            conv.window,
            conv.ttl(),
            conv.max_sessions,
        )),
        SessionBackend::Sqlite => {
            let path = PathBuf::from(&conv.db_path);
            ensure_parent_dir(&path)?;
            let store = SqliteSessionStore::open(&path, conv.window, conv.ttl())
                .with_context(|| format!("failed to open session store: {}", path.display()))?;
            Arc::new(store)
        }
    };
    tracing::info!(backend = store.backend(), window = conv.window, "session store ready");
    Ok(store)
}

fn build_synthesizer(settings: &AskrepoSettings) -> Result<ResponseSynthesizer> {
    let synth = &settings.synthesis;
    let api_key = std::env::var(&synth.api_key_env)
        .ok()
        .filter(|k| !k.trim().is_empty())
        .map(SecretString::from);
    if api_key.is_none() {
        tracing::warn!(
            env = %synth.api_key_env,
            "no API key for synthesis; answers will fall back to raw findings on auth errors"
        );
    }

    let provider = ChatCompletionsProvider::new(ChatCompletionsConfig {
        base_url: synth.base_url.clone(),
        model: synth.model.clone(),
        api_key,
        request_timeout: synth.request_timeout(),
    })
    .context("failed to build language-model client")?;

    let retry = &synth.retry;
    let reliable = ReliableProvider::new(
        provider,
        ReliableConfig {
            max_retries: retry.max_retries,
            base_delay: std::time::Duration::from_millis(retry.base_delay_ms),
            max_delay: std::time::Duration::from_millis(retry.max_delay_ms),
            jitter_factor: retry.jitter_factor,
            ..ReliableConfig::default()
        },
    );

    Ok(
        ResponseSynthesizer::new(Arc::new(reliable), synth.timeout()).with_options(
            CompletionOptions {
                max_tokens: synth.max_tokens,
                ..CompletionOptions::default()
            },
        ),
    )
}

fn build_orchestrator(settings: &AskrepoSettings, store: Arc<dyn SessionStore>) -> Result<Orchestrator> {
    let repo = &settings.repository;
    let repository = PathBuf::from(&repo.path);
    if !repository.is_dir() {
        bail!("repository path is not a directory: {}", repository.display());
    }

    let guard = Arc::new(RepoGuard::from_enforcement(
        repo.readonly_enforcement,
        repo.lock_timeout(),
    ));
    if !repo.readonly_enforcement {
        tracing::warn!("read-only enforcement disabled; the agent may modify the repository");
    }

    let agent_settings = &settings.agent;
    let agent = ProcessAgent::new(
        agent_settings.command.clone(),
        agent_settings.args.clone(),
        agent_settings.end_of_options,
    );
    let pool = Arc::new(AgentPool::new(
        Arc::new(agent),
        agent_settings.max_concurrent,
        agent_settings.queue_capacity,
    ));

    let synthesizer = Arc::new(build_synthesizer(settings)?);

    Ok(Orchestrator::new(
        store,
        guard,
        pool,
        synthesizer,
        OrchestratorConfig {
            repository,
            agent_timeout: agent_settings.timeout(),
        },
    ))
}

async fn serve(settings: AskrepoSettings, host: Option<String>, port: Option<u16>) -> Result<()> {
    let store = build_store(&settings)?;
    let orchestrator = Arc::new(build_orchestrator(&settings, Arc::clone(&store))?);

    let cancel = CancellationToken::new();
    let sweeper = spawn_sweeper(
        store,
        settings.conversation.sweep_interval(),
        cancel.clone(),
    );

    let config = ServerConfig {
        host: host.unwrap_or(settings.server.host),
        port: port.unwrap_or(settings.server.port),
        bot_user_id: settings.server.bot_user_id,
    };
    let handle = askrepo_server::start(config, orchestrator)
        .await
        .context("failed to start server")?;
    tracing::info!(port = handle.port, "askrepo ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl+c")?;
    tracing::info!("shutting down");

    cancel.cancel();
    handle.shutdown().await;
    if let Err(e) = sweeper.await {
        tracing::warn!(error = %e, "sweeper join failed");
    }
    Ok(())
}

async fn ask(
    settings: AskrepoSettings,
    question: String,
    actor: String,
    channel: String,
    thread: Option<String>,
) -> Result<()> {
    let store = build_store(&settings)?;
    let orchestrator = build_orchestrator(&settings, store)?;
    let resp = orchestrator
        .handle_question(QuestionEvent {
            actor_id: actor,
            channel_id: channel,
            thread_id: thread,
            text: question,
        })
        .await;

    println!("{}", resp.text);
    match resp.status {
        QuestionStatus::Failed { error_kind, .. } => bail!("question failed: {error_kind}"),
        QuestionStatus::Busy => bail!("agent pool busy"),
        _ => Ok(()),
    }
}

fn show_logs(settings: &AskrepoSettings, request_id: Option<String>, filter: LogFilter, json: bool) -> Result<()> {
    let path = PathBuf::from(&settings.logging.log_db_path);
    let Some(log) = OpsLog::open_existing(&path)
        .with_context(|| format!("failed to open operational log: {}", path.display()))?
    else {
        bail!("no operational log at {}", path.display());
    };

    let entries = match request_id {
        Some(id) => log.request_trail(&id),
        None => log.search(&filter),
    }
    .context("failed to read operational log")?;

    for entry in &entries {
        if json {
            println!("{}", serde_json::to_string(entry)?);
        } else {
            println!("{}", entry.to_line());
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = load(cli.config.as_deref())?;

    // Reading the operational log must not append to it.
    let persist = settings.logging.log_to_sqlite && !matches!(cli.command, Command::Logs { .. });
    let log_db_path = PathBuf::from(&settings.logging.log_db_path);
    if persist {
        ensure_parent_dir(&log_db_path)?;
    }
    let telemetry = init_telemetry(TelemetryConfig {
        log_level: parse_level(&settings.logging.level),
        log_to_sqlite: persist,
        log_db_path,
        ..TelemetryConfig::default()
    });
    if persist && telemetry.ops_log().is_none() {
        tracing::warn!("operational log unavailable; warnings go to stderr only");
    }

    match cli.command {
        Command::Serve { host, port } => serve(settings, host, port).await,
        Command::Ask {
            question,
            actor,
            channel,
            thread,
        } => ask(settings, question, actor, channel, thread).await,
        Command::Logs {
            request_id,
            session,
            level,
            since,
            limit,
            json,
        } => {
            let filter = LogFilter {
                request_id: None,
                session_key: session,
                level,
                since,
                limit,
            };
            show_logs(&settings, request_id, filter, json)
        }
    }
}
