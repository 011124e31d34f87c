/// Turn-level agents.
///
/// **Planning** (the shared core):
/// - `planning`: plan generation → validation → step execution over one registry
///
/// **Route agents** (one per routing category):
/// - `knowledge`: casual chat, direct answers, or tool-backed answers
/// - `detection`: URL/file scanning with an explained verdict
/// - `image`: vision-model answers about an attached image
///
/// `master` classifies each turn and dispatches to the route agents.
pub mod detection;
pub mod image;
pub mod knowledge;
pub mod master;
pub mod planning;
pub mod prompts;

use serde::Serialize;

use crate::llm::{ChatMessage, ChatRequest};
use crate::streaming::TurnAnswer;

pub use detection::DetectionAgent;
pub use image::ImageAgent;
pub use knowledge::KnowledgeAgent;
pub use master::{MasterAgent, build_master_agent, build_model_client, orchestrator_for};
pub use planning::{PlanningAgent, PlanningError};

/// One client turn after transport parsing and authentication.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TurnRequest {
    pub query: String,
    pub include_reasoning: bool,
    /// Wire-level chat id (`unique_id`).
    pub chat_id: Option<String>,
    pub file_url: Option<String>,
    pub image_url: Option<String>,
}

impl TurnRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Route {
    Image,
    FileScan,
    Detection,
    Knowledge,
    Casual,
}

impl Route {
    pub fn as_str(self) -> &'static str {
        match self {
            Route::Image => "image",
            Route::FileScan => "file_scan",
            Route::Detection => "detection",
            Route::Knowledge => "knowledge",
            Route::Casual => "casual",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnOutcome {
    pub route: Route,
    pub answer: TurnAnswer,
}

/// Model names and reasoning options used when streaming answers.
#[derive(Debug, Clone, PartialEq)]
pub struct AnswerSettings {
    /// Tool-backed and direct knowledge answers.
    pub chat_model: String,
    /// Small talk and scan explanations.
    pub casual_model: String,
    pub reasoning_effort: Option<String>,
}

impl AnswerSettings {
    pub(crate) fn request(
        &self,
        model: &str,
        messages: Vec<ChatMessage>,
        include_reasoning: bool,
    ) -> ChatRequest {
        ChatRequest::new(model, messages)
            .with_reasoning(self.reasoning_effort.clone(), include_reasoning)
    }
}

/// History followed by one new user message.
pub(crate) fn with_user_message(
    history: &[ChatMessage],
    message: ChatMessage,
) -> Vec<ChatMessage> {
    let mut messages = history.to_vec();
    messages.push(message);
    messages
}
