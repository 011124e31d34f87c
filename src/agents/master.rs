use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::agents::prompts::transcript;
use crate::agents::{
    AnswerSettings, DetectionAgent, ImageAgent, KnowledgeAgent, PlanningAgent, Route, TurnOutcome,
    TurnRequest,
};
use crate::config::RuntimeConfig;
use crate::llm::{
    ChatMessage, ChatModel, Intent, IntentClassifier, LlmPlanGenerator, OpenAiCompatClient,
    OpenAiCompatConfig, QueryRefiner, TitleGenerator,
};
use crate::planner::{PlanOrchestrator, StepExecutor};
use crate::streaming::EventSink;
use crate::telemetry::TelemetrySink;
use crate::tools::{ToolRegistry, build_detection_registry, build_knowledge_registry};

const KNOWLEDGE_PURPOSE: &str = "cybersecurity knowledge: CVEs, MITRE ATT&CK techniques and \
mitigations, security logs, threat intelligence, Myanmar cyber law, and web research";
const DETECTION_PURPOSE: &str = "detecting malicious URLs and files";

/// Titles are (re)generated while a chat holds this many non-system messages,
/// counting the current user message.
const TITLE_WINDOW: std::ops::Range<usize> = 1..4;

/// Entry point for a turn: picks a route and runs the matching agent.
pub struct MasterAgent {
    classifier: IntentClassifier,
    knowledge: KnowledgeAgent,
    detection: DetectionAgent,
    image: ImageAgent,
    titles: TitleGenerator,
    telemetry: TelemetrySink,
}

impl MasterAgent {
    pub fn new(
        classifier: IntentClassifier,
        knowledge: KnowledgeAgent,
        detection: DetectionAgent,
        image: ImageAgent,
        titles: TitleGenerator,
    ) -> Self {
        Self {
            classifier,
            knowledge,
            detection,
            image,
            titles,
            telemetry: TelemetrySink::disabled(),
        }
    }

    pub fn with_telemetry(mut self, telemetry: TelemetrySink) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn knowledge(&self) -> &KnowledgeAgent {
        &self.knowledge
    }

    pub fn detection(&self) -> &DetectionAgent {
        &self.detection
    }

    /// Attachments bypass intent classification: images go to the vision
    /// model, files straight to a file scan.
    pub async fn route(&self, turn: &TurnRequest) -> Result<(Route, Intent)> {
        if turn.image_url.is_some() {
            return Ok((Route::Image, Intent::Detection));
        }
        if turn.file_url.is_some() {
            return Ok((Route::FileScan, Intent::Detection));
        }
        let intent = self.classifier.classify(&turn.query).await?;
        let route = match intent {
            Intent::Detection => Route::Detection,
            Intent::Knowledge => Route::Knowledge,
            Intent::Casual => Route::Casual,
        };
        Ok((route, intent))
    }

    /// `history` starts with the system messages and does not include the
    /// current query.
    pub async fn respond(
        &self,
        turn: &TurnRequest,
        history: &[ChatMessage],
        sink: &EventSink,
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome> {
        let (route, intent) = self.route(turn).await?;
        tracing::info!(route = route.as_str(), "Turn routed");

        let answer = match (route, turn.image_url.as_deref(), turn.file_url.as_deref()) {
            (Route::Image, Some(image_url), _) => {
                self.image
                    .respond(&turn.query, image_url, history, sink)
                    .await?
            }
            (Route::FileScan, _, Some(file_url)) => {
                self.detection
                    .scan_file(
                        &turn.query,
                        file_url,
                        history,
                        turn.include_reasoning,
                        sink,
                        cancel,
                    )
                    .await?
            }
            (Route::Detection, _, _) => {
                self.detection
                    .respond(&turn.query, history, turn.include_reasoning, sink, cancel)
                    .await?
            }
            _ => {
                self.knowledge
                    .respond(
                        intent,
                        &turn.query,
                        history,
                        turn.include_reasoning,
                        sink,
                        cancel,
                    )
                    .await?
            }
        };

        self.telemetry.emit(
            "turn.completed",
            json!({
                "route": route.as_str(),
                "answer_chars": answer.answer.chars().count(),
                "reasoning": answer.reason.is_some(),
            }),
        );
        Ok(TurnOutcome { route, answer })
    }

    /// `conversation` holds the non-system messages including the current
    /// user message. Title failures are logged and skipped.
    pub async fn title_for(&self, conversation: &[ChatMessage]) -> Option<String> {
        if !TITLE_WINDOW.contains(&conversation.len()) {
            return None;
        }
        match self.titles.generate(&transcript(conversation)).await {
            Ok(title) => Some(title),
            Err(err) => {
                tracing::warn!("Title generation failed: {err:#}");
                None
            }
        }
    }
}

pub fn orchestrator_for(
    registry: ToolRegistry,
    call_timeout: Duration,
    telemetry: &TelemetrySink,
) -> PlanOrchestrator {
    PlanOrchestrator::new(StepExecutor::new(Arc::new(registry)).with_call_timeout(call_timeout))
        .with_telemetry(telemetry.clone())
}

pub fn build_model_client(cfg: &RuntimeConfig) -> Result<Arc<dyn ChatModel>> {
    if cfg.model_api_key().is_none() {
        tracing::warn!(
            env = %cfg.model_api_key_env,
            "Model API key is not set; model calls will be rejected upstream"
        );
    }
    Ok(Arc::new(OpenAiCompatClient::new(OpenAiCompatConfig {
        base_url: cfg.model_base_url.clone(),
        api_key: cfg.model_api_key(),
        timeout_secs: cfg.model_timeout_secs,
    })?))
}

/// Wires the model client, both tool registries, and every agent from config.
pub fn build_master_agent(cfg: &RuntimeConfig, telemetry: TelemetrySink) -> Result<MasterAgent> {
    let model = build_model_client(cfg)?;
    let call_timeout = Duration::from_secs(cfg.tool_timeout_secs);

    let knowledge_planner = PlanningAgent::new(
        "knowledge",
        Arc::new(LlmPlanGenerator::new(
            model.clone(),
            cfg.util_model.clone(),
            KNOWLEDGE_PURPOSE,
        )),
        orchestrator_for(
            build_knowledge_registry(cfg, model.clone(), model.clone())?,
            call_timeout,
            &telemetry,
        ),
    );
    let detection_planner = PlanningAgent::new(
        "detection",
        Arc::new(LlmPlanGenerator::new(
            model.clone(),
            cfg.util_model.clone(),
            DETECTION_PURPOSE,
        )),
        orchestrator_for(build_detection_registry(cfg)?, call_timeout, &telemetry),
    );

    let settings = AnswerSettings {
        chat_model: cfg.chat_model.clone(),
        casual_model: cfg.casual_model.clone(),
        reasoning_effort: cfg.reasoning_effort.clone(),
    };
    let knowledge = KnowledgeAgent::new(
        model.clone(),
        settings.clone(),
        QueryRefiner::new(model.clone(), cfg.util_model.clone()),
        knowledge_planner,
    )
    .with_confidence_threshold(cfg.confidence_threshold);
    let detection = DetectionAgent::new(model.clone(), settings, detection_planner);

    Ok(MasterAgent::new(
        IntentClassifier::new(model.clone(), cfg.util_model.clone()),
        knowledge,
        detection,
        ImageAgent::new(model.clone(), cfg.vision_model.clone()),
        TitleGenerator::new(model, cfg.util_model.clone()),
    )
    .with_telemetry(telemetry))
}
