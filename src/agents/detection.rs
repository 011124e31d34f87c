use std::sync::Arc;

use anyhow::Result;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::agents::prompts::{PLANNING_APOLOGY, scan_explanation};
use crate::agents::{AnswerSettings, PlanningAgent, with_user_message};
use crate::llm::{ChatMessage, ChatModel};
use crate::planner::{CallOutcome, ToolCall};
use crate::streaming::{EventSink, TurnAnswer, emit_answer, synthesize};
use crate::tools::DETECTION_TOOL_NAME;

/// Scans URLs and files and explains the verdict.
pub struct DetectionAgent {
    model: Arc<dyn ChatModel>,
    settings: AnswerSettings,
    planner: PlanningAgent,
}

impl DetectionAgent {
    pub fn new(model: Arc<dyn ChatModel>, settings: AnswerSettings, planner: PlanningAgent) -> Self {
        Self {
            model,
            settings,
            planner,
        }
    }

    pub fn planner(&self) -> &PlanningAgent {
        &self.planner
    }

    pub async fn respond(
        &self,
        query: &str,
        history: &[ChatMessage],
        include_reasoning: bool,
        sink: &EventSink,
        cancel: &CancellationToken,
    ) -> Result<TurnAnswer> {
        let results = match self.planner.plan_and_execute(query, cancel).await {
            Ok(results) => results,
            Err(err) => {
                tracing::warn!(agent = self.planner.name(), "Planning failed: {err}");
                return Ok(emit_answer(sink, PLANNING_APOLOGY));
            }
        };
        self.explain(&results.render(), query, history, include_reasoning, sink)
            .await
    }

    /// Skips planning: the attached file is scanned with a single
    /// `detect_file` call.
    pub async fn scan_file(
        &self,
        query: &str,
        file_url: &str,
        history: &[ChatMessage],
        include_reasoning: bool,
        sink: &EventSink,
        cancel: &CancellationToken,
    ) -> Result<TurnAnswer> {
        let mut params = Map::new();
        params.insert("file_path".to_string(), Value::String(file_url.to_string()));
        let call = ToolCall::new(DETECTION_TOOL_NAME, "detect_file", params);

        let outcome = self
            .planner
            .orchestrator()
            .executor()
            .execute_step(std::slice::from_ref(&call), cancel)
            .await
            .into_iter()
            .next();
        let rendered = match outcome {
            Some(outcome) => {
                if let CallOutcome::Failed(err) = &outcome {
                    tracing::warn!(kind = err.kind.label(), "File scan failed: {}", err.message);
                }
                serde_json::to_string_pretty(&outcome)?
            }
            None => "{}".to_string(),
        };
        self.explain(&rendered, query, history, include_reasoning, sink)
            .await
    }

    async fn explain(
        &self,
        result_json: &str,
        query: &str,
        history: &[ChatMessage],
        include_reasoning: bool,
        sink: &EventSink,
    ) -> Result<TurnAnswer> {
        let request = self.settings.request(
            &self.settings.casual_model,
            with_user_message(history, ChatMessage::user(scan_explanation(result_json, query))),
            include_reasoning,
        );
        synthesize(self.model.as_ref(), request, include_reasoning, sink).await
    }
}
