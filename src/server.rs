use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{delete, get};
use axum::{Json, Router as AxumRouter};
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::agents::prompts::system_messages;
use crate::agents::{MasterAgent, TurnRequest, build_master_agent};
use crate::auth::{Principal, StaticTokenVerifier, TokenVerifier, bearer_token};
use crate::config::RuntimeConfig;
use crate::error::render_error_message;
use crate::llm::Role;
use crate::session::{
    ChatStore, ChatSummary, ConversationSession, StoredMessage, build_chat_store, find_owned_chat,
};
use crate::streaming::{EventSink, ServerEvent, send_event};
use crate::telemetry::TelemetrySink;

#[derive(Clone)]
pub struct ServerState {
    pub cfg: RuntimeConfig,
    pub telemetry: TelemetrySink,
    pub agent: Arc<MasterAgent>,
    pub store: Arc<dyn ChatStore>,
    pub verifier: Arc<dyn TokenVerifier>,
}

#[derive(Debug, Serialize)]
pub struct ServerHealthResponse {
    pub status: &'static str,
    pub profile: String,
    pub session_backend: String,
}

/// One client frame on the chat socket.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientFrame {
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub include_reasoning: bool,
    pub current_chat_id: Option<String>,
    pub file_url: Option<String>,
    pub image_url: Option<String>,
    pub token: Option<String>,
}

fn present(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

impl ClientFrame {
    pub fn parse(text: &str) -> Result<Self, String> {
        serde_json::from_str::<ClientFrame>(text)
            .map_err(|err| format!("invalid message: {err}"))
    }

    /// Splits the frame into the turn and the caller's token.
    pub fn into_turn(self) -> Result<(TurnRequest, Option<String>), String> {
        let query = self.query.trim().to_string();
        if query.is_empty() {
            return Err("query cannot be empty".to_string());
        }
        Ok((
            TurnRequest {
                query,
                include_reasoning: self.include_reasoning,
                chat_id: present(self.current_chat_id),
                file_url: present(self.file_url),
                image_url: present(self.image_url),
            },
            present(self.token),
        ))
    }
}

#[derive(Debug, Serialize)]
pub struct MessageView {
    pub id: i64,
    pub role: Role,
    pub content: String,
    pub reasoning: Option<String>,
    #[serde(rename = "imageUrl")]
    pub image_url: Option<String>,
    pub time_stamp: DateTime<Utc>,
}

impl From<StoredMessage> for MessageView {
    fn from(message: StoredMessage) -> Self {
        Self {
            id: message.id,
            role: message.role,
            content: message.content,
            reasoning: message.reason,
            image_url: message.image_url,
            time_stamp: message.time_stamp,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ChatTranscript {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub messages: Vec<MessageView>,
}

pub type ApiError = (StatusCode, Json<Value>);
pub type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

pub fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(json!({ "error": message.into() })))
}

fn internal_error(err: anyhow::Error) -> ApiError {
    tracing::error!("Request failed: {err:#}");
    api_error(
        StatusCode::INTERNAL_SERVER_ERROR,
        render_error_message(&err, false),
    )
}

pub async fn authenticate(state: &ServerState, headers: &HeaderMap) -> Result<Principal, ApiError> {
    let token = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(bearer_token)
        .ok_or_else(|| {
            api_error(
                StatusCode::UNAUTHORIZED,
                "missing or invalid Authorization bearer token",
            )
        })?;
    state
        .verifier
        .verify(token)
        .await
        .ok_or_else(|| api_error(StatusCode::UNAUTHORIZED, "invalid or expired token"))
}

pub async fn handle_server_health(
    State(state): State<Arc<ServerState>>,
) -> Json<ServerHealthResponse> {
    Json(ServerHealthResponse {
        status: "ok",
        profile: state.cfg.profile.clone(),
        session_backend: format!("{:?}", state.cfg.session_backend).to_ascii_lowercase(),
    })
}

pub async fn handle_list_chats(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
) -> ApiResult<Vec<ChatSummary>> {
    let principal = authenticate(&state, &headers).await?;
    let chats = state
        .store
        .list_chats(&principal.user_id)
        .await
        .map_err(internal_error)?;
    Ok(Json(chats))
}

pub async fn handle_get_chat(
    State(state): State<Arc<ServerState>>,
    Path(chat_id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<ChatTranscript> {
    let principal = authenticate(&state, &headers).await?;
    let chat = find_owned_chat(state.store.as_ref(), &principal.user_id, &chat_id)
        .await
        .map_err(internal_error)?
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "Chat not found"))?;
    let messages = state
        .store
        .list_messages(chat.id)
        .await
        .map_err(internal_error)?;
    Ok(Json(ChatTranscript {
        id: chat.unique_id,
        created_at: chat.created_at,
        messages: messages.into_iter().map(MessageView::from).collect(),
    }))
}

pub async fn handle_delete_chat(
    State(state): State<Arc<ServerState>>,
    Path(chat_id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Value> {
    let principal = authenticate(&state, &headers).await?;
    let chat = find_owned_chat(state.store.as_ref(), &principal.user_id, &chat_id)
        .await
        .map_err(internal_error)?
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "Chat not found"))?;
    state
        .store
        .delete_chat(chat.id)
        .await
        .map_err(internal_error)?;
    tracing::info!(chat_id = %chat.unique_id, user = %principal.user_id, "Chat deleted");
    Ok(Json(
        json!({ "success": true, "message": "Chat deleted successfully" }),
    ))
}

pub async fn handle_chat_socket(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let header_token = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(bearer_token)
        .map(str::to_string);
    ws.on_upgrade(move |socket| handle_socket(state, socket, header_token))
}

async fn handle_socket(state: Arc<ServerState>, socket: WebSocket, header_token: Option<String>) {
    let (mut ws_sink, mut ws_stream) = socket.split();
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<ServerEvent>();
    let (frame_tx, mut frame_rx) = mpsc::unbounded_channel::<String>();
    let cancel = CancellationToken::new();

    let writer_cancel = cancel.clone();
    let write_task = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            if ws_sink
                .send(Message::Text(event.to_json().into()))
                .await
                .is_err()
            {
                writer_cancel.cancel();
                break;
            }
        }
    });

    let reader_cancel = cancel.clone();
    let read_task = tokio::spawn(async move {
        while let Some(Ok(message)) = ws_stream.next().await {
            match message {
                Message::Text(text) => {
                    if frame_tx.send(text.as_str().to_string()).is_err() {
                        break;
                    }
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
        reader_cancel.cancel();
    });

    tracing::debug!("Chat connection opened");
    let mut session = ConversationSession::new(state.store.clone(), system_messages());
    loop {
        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            frame = frame_rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        run_frame(
            &state,
            &mut session,
            &frame,
            header_token.as_deref(),
            &event_tx,
            &cancel,
        )
        .await;
    }

    drop(event_tx);
    read_task.abort();
    if let Err(err) = write_task.await
        && !err.is_cancelled()
    {
        tracing::warn!("Chat writer task failed: {err}");
    }
    tracing::debug!("Chat connection closed");
}

/// Handles one frame. Every frame ends with a `done` event unless the
/// connection went away mid-turn.
pub async fn run_frame(
    state: &ServerState,
    session: &mut ConversationSession,
    frame: &str,
    header_token: Option<&str>,
    sink: &EventSink,
    cancel: &CancellationToken,
) {
    let parsed = ClientFrame::parse(frame).and_then(ClientFrame::into_turn);
    let (turn, token) = match parsed {
        Ok(parsed) => parsed,
        Err(message) => {
            send_event(sink, ServerEvent::Error { message });
            send_event(sink, ServerEvent::Done);
            return;
        }
    };

    let principal = match token.as_deref().or(header_token) {
        Some(token) => match state.verifier.verify(token).await {
            Some(principal) => Some(principal),
            None => {
                send_event(
                    sink,
                    ServerEvent::Error {
                        message: "invalid or expired token".to_string(),
                    },
                );
                send_event(sink, ServerEvent::Done);
                return;
            }
        },
        None => None,
    };
    session.set_principal(principal);

    let started_at = Instant::now();
    let result = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            tracing::info!("Turn abandoned; client disconnected");
            return;
        }
        result = session.handle_turn(&state.agent, &turn, sink, cancel) => result,
    };
    match result {
        Ok(outcome) => tracing::info!(
            route = outcome.route.as_str(),
            latency_ms = started_at.elapsed().as_millis() as u64,
            "Turn completed"
        ),
        Err(err) => {
            tracing::error!("Turn failed: {err:#}");
            send_event(
                sink,
                ServerEvent::Error {
                    message: render_error_message(&err, false),
                },
            );
        }
    }
    send_event(sink, ServerEvent::Done);
}

pub fn build_server_router(state: Arc<ServerState>) -> AxumRouter {
    AxumRouter::new()
        .route("/healthz", get(handle_server_health))
        .route("/chat", get(handle_chat_socket))
        .route("/chats", get(handle_list_chats))
        .route("/chats/{chat_id}", get(handle_get_chat))
        .route("/chat/delete/{chat_id}", delete(handle_delete_chat))
        .with_state(state)
}

pub async fn run_server(
    cfg: RuntimeConfig,
    host: String,
    port: u16,
    telemetry: &TelemetrySink,
) -> Result<()> {
    let addr = format!("{host}:{port}")
        .parse::<SocketAddr>()
        .with_context(|| format!("invalid server bind address '{}:{}'", host, port))?;
    let agent = Arc::new(build_master_agent(&cfg, telemetry.clone())?);
    let store = build_chat_store(&cfg).await?;
    let verifier = StaticTokenVerifier::from_pairs(&cfg.auth_tokens)?;
    if verifier.is_empty() {
        tracing::warn!("No auth tokens configured; only anonymous chats are available");
    }

    let state = Arc::new(ServerState {
        cfg: cfg.clone(),
        telemetry: telemetry.clone(),
        agent,
        store,
        verifier: Arc::new(verifier),
    });

    telemetry.emit(
        "server.started",
        json!({
            "host": host,
            "port": port,
            "profile": cfg.profile,
            "session_backend": format!("{:?}", cfg.session_backend),
            "chat_model": cfg.chat_model,
        }),
    );

    println!(
        "Server listening on http://{} (health: /healthz, chat socket: /chat, history: /chats)",
        addr
    );

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("failed to bind server listener")?;
    axum::serve(listener, build_server_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server runtime failed")
}

pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to install Ctrl+C handler: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!("failed to install SIGTERM handler: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { println!("\nReceived Ctrl+C, shutting down gracefully..."); }
        _ = terminate => { println!("\nReceived SIGTERM, shutting down gracefully..."); }
    }
}
