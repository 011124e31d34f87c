use std::sync::Arc;

use anyhow::Result;
use serde_json::Value;

use crate::llm::{ChatMessage, ChatModel, ChatRequest, extract_json_object};

const SYSTEM_PROMPT: &str = "Generate a concise title (at most six words) summarising the main \
topic of this chat. The chat may be in English, Burmese, or both; keep the title in the chat's \
main language. Respond with JSON: {\"title\": \"...\"}";

const MAX_TITLE_CHARS: usize = 80;

pub struct TitleGenerator {
    model: Arc<dyn ChatModel>,
    model_name: String,
}

impl TitleGenerator {
    pub fn new(model: Arc<dyn ChatModel>, model_name: String) -> Self {
        Self { model, model_name }
    }

    /// `transcript` is the `role: content` rendering of the non-system messages.
    pub async fn generate(&self, transcript: &str) -> Result<String> {
        let request = ChatRequest::new(
            self.model_name.clone(),
            vec![
                ChatMessage::system(SYSTEM_PROMPT),
                ChatMessage::user(transcript),
            ],
        )
        .with_temperature(0.0)
        .json_response();

        let output = self.model.complete(request).await?;
        Ok(parse_title(&output))
    }
}

pub fn parse_title(output: &str) -> String {
    let raw = extract_json_object(output)
        .and_then(|value| value.get("title").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| output.to_string());
    let cleaned = raw
        .lines()
        .next()
        .unwrap_or_default()
        .trim()
        .trim_matches(|ch: char| ch == '"' || ch == '\'' || ch == '#' || ch.is_whitespace());
    if cleaned.is_empty() {
        return crate::session::DEFAULT_CHAT_TITLE.to_string();
    }
    cleaned.chars().take(MAX_TITLE_CHARS).collect()
}
