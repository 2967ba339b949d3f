use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use askrepo_core::events::QuestionStatus;
use askrepo_core::ids::RequestId;

use crate::inbound::{self, ChatEvent};
use crate::orchestrator::{Orchestrator, QuestionEvent};

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// The bot's own user id on the chat platform, for mention handling.
    pub bot_user_id: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8787,
            bot_user_id: None,
        }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub bot_user_id: Option<Arc<str>>,
}

#[derive(Debug, Serialize)]
struct AnswerBody {
    request_id: RequestId,
    text: String,
    status: QuestionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    channel: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reply_thread: Option<String>,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/v1/questions", post(question_handler))
        .route("/v1/events", post(event_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Bind and serve until the handle's token is cancelled.
pub async fn start(
    config: ServerConfig,
    orchestrator: Arc<Orchestrator>,
) -> Result<ServerHandle, std::io::Error> {
    let state = AppState {
        orchestrator,
        bot_user_id: config.bot_user_id.as_deref().map(Arc::from),
    };
    let router = build_router(state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;
    tracing::info!(addr = %local_addr, "askrepo server started");

    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    let join = tokio::spawn(async move {
        let served = axum::serve(listener, router)
            .with_graceful_shutdown(async move { token.cancelled().await })
            .await;
        if let Err(e) = served {
            tracing::error!(error = %e, "server stopped with error");
        }
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        shutdown,
        join,
    })
}

/// Handle returned by `start()`.
pub struct ServerHandle {
    pub port: u16,
    shutdown: CancellationToken,
    join: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    /// Stop accepting connections and wait for in-flight requests.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(e) = self.join.await {
            tracing::warn!(error = %e, "server task join failed");
        }
    }
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "agent_capacity": state.orchestrator.agent_capacity(),
    }))
}

async fn question_handler(
    State(state): State<AppState>,
    Json(event): Json<QuestionEvent>,
) -> impl IntoResponse {
    let resp = state.orchestrator.handle_question(event).await;
    Json(AnswerBody {
        request_id: resp.request_id,
        text: resp.text,
        status: resp.status,
        channel: None,
        reply_thread: None,
    })
}

/// Accepts a platform envelope (`url_verification` or `event_callback`) or
/// a bare event.
async fn event_handler(State(state): State<AppState>, Json(body): Json<Value>) -> Response {
    if body.get("type").and_then(Value::as_str) == Some("url_verification") {
        let challenge = body.get("challenge").cloned().unwrap_or(Value::Null);
        return Json(serde_json::json!({ "challenge": challenge })).into_response();
    }

    let raw = body.get("event").cloned().unwrap_or(body);
    let event: ChatEvent = match serde_json::from_value(raw) {
        Ok(event) => event,
        Err(e) => {
            tracing::debug!(error = %e, "unreadable chat event");
            return StatusCode::BAD_REQUEST.into_response();
        }
    };

    let Some(question) = inbound::normalize(&event, state.bot_user_id.as_deref()) else {
        return StatusCode::NO_CONTENT.into_response();
    };

    let channel = question.event.channel_id.clone();
    let resp = state.orchestrator.handle_question(question.event).await;
    Json(AnswerBody {
        request_id: resp.request_id,
        text: resp.text,
        status: resp.status,
        channel: Some(channel),
        reply_thread: question.reply_thread,
    })
    .into_response()
}
