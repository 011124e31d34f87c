use std::sync::Arc;

use anyhow::Result;
use serde_json::Value;

use crate::llm::{ChatMessage, ChatModel, ChatRequest, extract_json_object};

const SYSTEM_PROMPT: &str = "Refine the user's query into a clearer, more effective version \
for a cybersecurity expert, and judge whether you can answer it accurately without external \
tools or live data.\n\
Keep the refined query in the same language as the input. Do not translate.\n\
Greetings and basic pleasantries are always answerable: intent \"yes\" with high confidence.\n\
Respond with JSON: {\"refined_query\": \"...\", \"intent\": \"yes\" | \"no\", \"confidence\": <0.0-1.0>}";

#[derive(Debug, Clone, PartialEq)]
pub struct RefinedQuery {
    pub refined_query: String,
    pub confident: bool,
    pub confidence: f64,
}

impl RefinedQuery {
    /// True when the model can answer without tools.
    pub fn answerable_directly(&self, threshold: f64) -> bool {
        self.confident && self.confidence > threshold
    }
}

pub struct QueryRefiner {
    model: Arc<dyn ChatModel>,
    model_name: String,
}

impl QueryRefiner {
    pub fn new(model: Arc<dyn ChatModel>, model_name: String) -> Self {
        Self { model, model_name }
    }

    pub async fn refine(&self, query: &str) -> Result<RefinedQuery> {
        let request = ChatRequest::new(
            self.model_name.clone(),
            vec![ChatMessage::system(SYSTEM_PROMPT), ChatMessage::user(query)],
        )
        .with_temperature(0.0)
        .json_response();

        let output = self.model.complete(request).await?;
        Ok(parse_refinement(&output, query))
    }
}

/// Unparseable output keeps the original query and counts as not confident.
pub fn parse_refinement(output: &str, original: &str) -> RefinedQuery {
    let Some(value) = extract_json_object(output) else {
        tracing::warn!("Query refinement returned no JSON; using the original query");
        return RefinedQuery {
            refined_query: original.to_string(),
            confident: false,
            confidence: 0.0,
        };
    };

    let refined_query = value
        .get("refined_query")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .unwrap_or(original)
        .to_string();
    let confident = value
        .get("intent")
        .and_then(Value::as_str)
        .is_some_and(|intent| intent.trim().eq_ignore_ascii_case("yes"));
    let confidence = match value.get("confidence") {
        Some(Value::Number(number)) => number.as_f64().unwrap_or(0.0),
        Some(Value::String(text)) => text.trim().parse::<f64>().unwrap_or(0.0),
        _ => 0.0,
    }
    .clamp(0.0, 1.0);

    RefinedQuery {
        refined_query,
        confident,
        confidence,
    }
}
