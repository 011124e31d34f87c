use std::sync::Arc;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use serde_json::Value;

use crate::llm::{ChatMessage, ChatModel, ChatRequest, extract_json_object};
use crate::tools::ToolRegistry;

const MAX_LOG_CHARS: usize = 2_000;

/// Produces a raw, untrusted plan for a query. The result always goes
/// through the plan validator before anything runs.
#[async_trait]
pub trait PlanGenerator: Send + Sync {
    async fn generate(&self, query: &str, registry: &ToolRegistry) -> Result<Value>;
}

pub struct LlmPlanGenerator {
    model: Arc<dyn ChatModel>,
    model_name: String,
    purpose: String,
}

impl LlmPlanGenerator {
    /// `purpose` is one line telling the model what kind of requests this
    /// planner serves, e.g. "detecting malicious URLs and files".
    pub fn new(model: Arc<dyn ChatModel>, model_name: String, purpose: impl Into<String>) -> Self {
        Self {
            model,
            model_name,
            purpose: purpose.into(),
        }
    }

    pub fn system_prompt(&self, registry: &ToolRegistry) -> String {
        format!(
            "You plan tool calls for a cybersecurity assistant specialised in {purpose}.\n\
             Analyse the user query and produce a step-by-step execution plan.\n\n\
             Available tools and their functions:\n{catalog}\n\n\
             Rules:\n\
             1) Respond with a single JSON object and nothing else.\n\
             2) Keys are step numbers as strings, starting from \"1\".\n\
             3) Each value is a list of calls; calls in the same step run in parallel.\n\
             4) Each call is {{\"tool\": <tool name>, \"function\": <function name>, \"params\": {{...}}}}.\n\
             5) Use only the tools and functions listed above, with exactly their parameter names.\n\
             6) Steps run in ascending order; put a call in a later step only if it needs earlier results.\n\
             7) If no tool is useful, respond with {{}}.",
            purpose = self.purpose,
            catalog = registry.catalog(),
        )
    }
}

#[async_trait]
impl PlanGenerator for LlmPlanGenerator {
    async fn generate(&self, query: &str, registry: &ToolRegistry) -> Result<Value> {
        let request = ChatRequest::new(
            self.model_name.clone(),
            vec![
                ChatMessage::system(self.system_prompt(registry)),
                ChatMessage::user(query),
            ],
        )
        .with_temperature(0.0)
        .json_response();

        tracing::info!(
            model = %self.model_name,
            tools = registry.len(),
            query_len = query.len(),
            "Plan requested"
        );
        let output = self.model.complete(request).await?;
        if tracing::enabled!(tracing::Level::DEBUG) {
            tracing::debug!(output = %truncate_for_log(&output, MAX_LOG_CHARS), "Raw plan output");
        }

        extract_json_object(&output)
            .ok_or_else(|| anyhow!("plan generator output did not contain a JSON object"))
    }
}

pub fn truncate_for_log(input: &str, max_chars: usize) -> String {
    let char_count = input.chars().count();
    if char_count <= max_chars {
        return input.to_string();
    }
    let mut preview = input.chars().take(max_chars).collect::<String>();
    preview.push_str(&format!("... [truncated, total_chars={char_count}]"));
    preview
}
