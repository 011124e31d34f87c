use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use crate::agents::prompts::{PLANNING_APOLOGY, contextual_query};
use crate::agents::{AnswerSettings, PlanningAgent, with_user_message};
use crate::llm::{ChatMessage, ChatModel, Intent, QueryRefiner};
use crate::streaming::{EventSink, TurnAnswer, emit_answer, synthesize};

pub const DEFAULT_CONFIDENCE_THRESHOLD: f64 = 0.8;

/// Answers knowledge and casual turns.
///
/// Casual turns go straight to the casual model. Knowledge turns are refined
/// first; a confident refinement is answered directly, anything else runs the
/// knowledge planner and answers with the tool results as context.
pub struct KnowledgeAgent {
    model: Arc<dyn ChatModel>,
    settings: AnswerSettings,
    refiner: QueryRefiner,
    planner: PlanningAgent,
    confidence_threshold: f64,
}

impl KnowledgeAgent {
    pub fn new(
        model: Arc<dyn ChatModel>,
        settings: AnswerSettings,
        refiner: QueryRefiner,
        planner: PlanningAgent,
    ) -> Self {
        Self {
            model,
            settings,
            refiner,
            planner,
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
        }
    }

    pub fn with_confidence_threshold(mut self, threshold: f64) -> Self {
        self.confidence_threshold = threshold;
        self
    }

    pub fn planner(&self) -> &PlanningAgent {
        &self.planner
    }

    pub async fn respond(
        &self,
        intent: Intent,
        query: &str,
        history: &[ChatMessage],
        include_reasoning: bool,
        sink: &EventSink,
        cancel: &CancellationToken,
    ) -> Result<TurnAnswer> {
        if intent == Intent::Casual {
            let request = self.settings.request(
                &self.settings.casual_model,
                with_user_message(history, ChatMessage::user(query)),
                include_reasoning,
            );
            return synthesize(self.model.as_ref(), request, include_reasoning, sink).await;
        }

        let refined = self.refiner.refine(query).await?;
        tracing::debug!(
            confident = refined.confident,
            confidence = refined.confidence,
            "Query refined"
        );
        if refined.answerable_directly(self.confidence_threshold) {
            let request = self.settings.request(
                &self.settings.chat_model,
                with_user_message(history, ChatMessage::user(refined.refined_query)),
                include_reasoning,
            );
            return synthesize(self.model.as_ref(), request, include_reasoning, sink).await;
        }

        let results = match self
            .planner
            .plan_and_execute(&refined.refined_query, cancel)
            .await
        {
            Ok(results) => results,
            Err(err) => {
                tracing::warn!(agent = self.planner.name(), "Planning failed: {err}");
                return Ok(emit_answer(sink, PLANNING_APOLOGY));
            }
        };

        let request = self.settings.request(
            &self.settings.chat_model,
            with_user_message(
                history,
                ChatMessage::user(contextual_query(&results.render(), query)),
            ),
            include_reasoning,
        );
        synthesize(self.model.as_ref(), request, include_reasoning, sink).await
    }
}
