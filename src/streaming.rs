use anyhow::{Context, Result};
use futures_util::StreamExt;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::llm::{ChatModel, ChatRequest};

pub const NO_TEXTUAL_RESPONSE: &str = "No textual response produced by the model.";

/// Events pushed to a connected client, serialized with a `type` tag.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    Reasoning {
        data: String,
    },
    Answer {
        data: String,
    },
    NewChat {
        id: i64,
        unique_id: String,
        title: String,
    },
    Title {
        title: String,
        #[serde(rename = "chatId")]
        chat_id: String,
    },
    Done,
    Error {
        message: String,
    },
}

impl ServerEvent {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self)
            .unwrap_or_else(|_| "{\"type\":\"error\",\"message\":\"unserializable event\"}".to_string())
    }
}

pub type EventSink = mpsc::UnboundedSender<ServerEvent>;

/// Sends to a sink whose receiver may already be gone (client disconnected).
pub fn send_event(sink: &EventSink, event: ServerEvent) {
    if sink.send(event).is_err() {
        tracing::debug!("Event dropped; client connection closed");
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TurnAnswer {
    pub answer: String,
    pub reason: Option<String>,
}

impl TurnAnswer {
    pub fn text(answer: impl Into<String>) -> Self {
        Self {
            answer: answer.into(),
            reason: None,
        }
    }
}

/// Streams a model response to the client and returns the accumulated text.
///
/// Reasoning deltas are forwarded only when `include_reasoning` is set. A
/// stream error after partial output keeps what was produced; an error before
/// any output fails the turn.
pub async fn synthesize(
    model: &dyn ChatModel,
    request: ChatRequest,
    include_reasoning: bool,
    sink: &EventSink,
) -> Result<TurnAnswer> {
    let model_name = request.model.clone();
    let mut stream = model
        .stream(request)
        .await
        .with_context(|| format!("failed to start response stream (model={model_name})"))?;

    let mut reasoning = String::new();
    let mut answer = String::new();
    while let Some(delta) = stream.next().await {
        let delta = match delta {
            Ok(delta) => delta,
            Err(err) if answer.is_empty() => {
                return Err(err.context("response stream failed before any output"));
            }
            Err(err) => {
                tracing::warn!(model = %model_name, "Response stream ended early: {err:#}");
                break;
            }
        };

        if let Some(text) = delta.reasoning
            && include_reasoning
        {
            reasoning.push_str(&text);
            send_event(sink, ServerEvent::Reasoning { data: text });
        }
        if let Some(text) = delta.content {
            answer.push_str(&text);
            send_event(sink, ServerEvent::Answer { data: text });
        }
    }

    tracing::debug!(
        model = %model_name,
        answer_len = answer.len(),
        reasoning_len = reasoning.len(),
        "Response stream finished"
    );

    if answer.trim().is_empty() {
        answer = NO_TEXTUAL_RESPONSE.to_string();
        send_event(
            sink,
            ServerEvent::Answer {
                data: answer.clone(),
            },
        );
    }

    Ok(TurnAnswer {
        answer,
        reason: (!reasoning.is_empty()).then_some(reasoning),
    })
}

/// Sends a fixed answer as a single `answer` event.
pub fn emit_answer(sink: &EventSink, answer: &str) -> TurnAnswer {
    send_event(
        sink,
        ServerEvent::Answer {
            data: answer.to_string(),
        },
    );
    TurnAnswer::text(answer)
}
