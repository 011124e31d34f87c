use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::llm::{ChatMessage, ChatModel, ChatRequest};
use crate::tools::{FunctionSpec, Tool, ToolArgs, ToolError, WEBSEARCH_TOOL_NAME, unknown_function};

const FUNCTIONS: &[FunctionSpec] = &[FunctionSpec::new(
    "websearch",
    &["query"],
    "search the web for recent or external information",
)];

/// Web search delegated to a search-capable model (Groq `compound-beta` by default).
pub struct WebSearchTool {
    model: Arc<dyn ChatModel>,
    model_name: String,
}

impl WebSearchTool {
    pub fn new(model: Arc<dyn ChatModel>, model_name: String) -> Self {
        Self { model, model_name }
    }
}

#[async_trait]
impl Tool for WebSearchTool {
    fn name(&self) -> &str {
        WEBSEARCH_TOOL_NAME
    }

    fn description(&self) -> &str {
        "Live web search"
    }

    fn functions(&self) -> &[FunctionSpec] {
        FUNCTIONS
    }

    async fn call(&self, function: &str, args: ToolArgs) -> Result<Value, ToolError> {
        if function != "websearch" {
            return Err(unknown_function(WEBSEARCH_TOOL_NAME, function));
        }
        args.ensure_only(&["query"])?;
        let query = args.required_str(&["query"])?;
        let request = ChatRequest::new(self.model_name.clone(), vec![ChatMessage::user(query)]);
        let answer = self
            .model
            .complete(request)
            .await
            .map_err(|err| ToolError::Upstream(format!("{err:#}")))?;
        Ok(Value::String(answer))
    }
}
