use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::llm::{ChatMessage, ChatModel, ChatRequest, extract_json_object};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Intent {
    Knowledge,
    Detection,
    Casual,
}

impl Intent {
    pub fn as_str(self) -> &'static str {
        match self {
            Intent::Knowledge => "knowledge",
            Intent::Detection => "detection",
            Intent::Casual => "casual",
        }
    }

    /// Accepts the short labels plus the `*_agent` / `normal_conversation`
    /// spellings models tend to echo back.
    pub fn from_label(label: &str) -> Option<Self> {
        let normalized = label
            .trim()
            .trim_matches(|ch: char| ch == '\'' || ch == '"' || ch == '`' || ch == '.')
            .to_ascii_lowercase();
        match normalized.as_str() {
            "knowledge" | "knowledge_agent" => Some(Intent::Knowledge),
            "detection" | "detection_agent" => Some(Intent::Detection),
            "casual" | "normal_conversation" | "conversation" => Some(Intent::Casual),
            _ => None,
        }
    }
}

const SYSTEM_PROMPT: &str = "Classify the user's query into exactly one intent:\n\
- knowledge: cybersecurity information or education (best practices, concepts, CVEs, \
ATT&CK techniques, mitigations, security logs, cyber law).\n\
- detection: cybersecurity detection or analysis requests (scan this URL, is this file \
malware, investigate suspicious activity).\n\
- casual: general knowledge, small talk, or anything unrelated to cybersecurity.\n\
Queries may be in English or Burmese; classify by meaning, not language.\n\
Respond with JSON: {\"intent\": \"knowledge\" | \"detection\" | \"casual\"}";

pub struct IntentClassifier {
    model: Arc<dyn ChatModel>,
    model_name: String,
}

impl IntentClassifier {
    pub fn new(model: Arc<dyn ChatModel>, model_name: String) -> Self {
        Self { model, model_name }
    }

    /// Unknown labels fall back to [`Intent::Casual`].
    pub async fn classify(&self, query: &str) -> Result<Intent> {
        let request = ChatRequest::new(
            self.model_name.clone(),
            vec![ChatMessage::system(SYSTEM_PROMPT), ChatMessage::user(query)],
        )
        .with_temperature(0.0)
        .json_response();

        let output = self.model.complete(request).await?;
        Ok(parse_intent(&output))
    }
}

pub fn parse_intent(output: &str) -> Intent {
    let label = extract_json_object(output)
        .and_then(|value| value.get("intent").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| output.to_string());
    match Intent::from_label(&label) {
        Some(intent) => intent,
        None => {
            tracing::warn!(label = %label, "Unrecognised intent label; treating as casual");
            Intent::Casual
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intent_labels_are_parsed_leniently() {
        assert_eq!(parse_intent("{\"intent\": \"detection\"}"), Intent::Detection);
        assert_eq!(
            parse_intent("{\"intent\": \"knowledge_agent\"}"),
            Intent::Knowledge
        );
        assert_eq!(parse_intent(" 'normal_conversation' "), Intent::Casual);
        assert_eq!(parse_intent("{\"intent\": \"weather\"}"), Intent::Casual);
    }
}
