use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::OnceCell;

use crate::llm::{ChatMessage, ChatModel, ChatRequest};
use crate::tools::{FunctionSpec, LAW_TOOL_NAME, Tool, ToolArgs, ToolError, unknown_function};

const FUNCTIONS: &[FunctionSpec] = &[FunctionSpec::new(
    "ask",
    &["query"],
    "answer a question about Myanmar's electronic transactions and cyber law",
)];

const SYSTEM_PROMPT: &str = "Answer the user's question strictly based on the Myanmar \
cybersecurity law text provided. Always cite the relevant Article or Section when possible. \
If the text does not cover the question, respond with: \
'This law does not explicitly cover that case.'";

/// Law-text question answering. The text is read on first use.
pub struct LawTool {
    model: Arc<dyn ChatModel>,
    model_name: String,
    text_path: PathBuf,
    text: OnceCell<String>,
}

impl LawTool {
    pub fn new(model: Arc<dyn ChatModel>, model_name: String, text_path: PathBuf) -> Self {
        Self {
            model,
            model_name,
            text_path,
            text: OnceCell::new(),
        }
    }

    async fn law_text(&self) -> Result<&str, ToolError> {
        let text = self
            .text
            .get_or_try_init(|| async {
                tokio::fs::read_to_string(&self.text_path)
                    .await
                    .map_err(|err| match err.kind() {
                        std::io::ErrorKind::NotFound => ToolError::NotFound(format!(
                            "law text '{}'",
                            self.text_path.display()
                        )),
                        _ => ToolError::Io(err),
                    })
            })
            .await?;
        Ok(text.as_str())
    }

    pub async fn ask(&self, query: &str) -> Result<Value, ToolError> {
        let law_text = self.law_text().await?;
        let request = ChatRequest::new(
            self.model_name.clone(),
            vec![
                ChatMessage::system(SYSTEM_PROMPT),
                ChatMessage::user(format!("{query}\n\nLaw Text:\n{law_text}")),
            ],
        )
        .with_temperature(0.0);
        let answer = self
            .model
            .complete(request)
            .await
            .map_err(|err| ToolError::Upstream(format!("{err:#}")))?;
        Ok(Value::String(answer))
    }
}

#[async_trait]
impl Tool for LawTool {
    fn name(&self) -> &str {
        LAW_TOOL_NAME
    }

    fn description(&self) -> &str {
        "Myanmar cyber law question answering with article citations"
    }

    fn functions(&self) -> &[FunctionSpec] {
        FUNCTIONS
    }

    async fn call(&self, function: &str, args: ToolArgs) -> Result<Value, ToolError> {
        match function {
            "ask" => {
                args.ensure_only(&["query", "question"])?;
                self.ask(args.required_str(&["query", "question"])?).await
            }
            other => Err(unknown_function(LAW_TOOL_NAME, other)),
        }
    }
}
