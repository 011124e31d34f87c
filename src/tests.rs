use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Result, bail};
use async_trait::async_trait;
use axum::Json;
use axum::extract::{Path, State};
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use clap::Parser;
use serde_json::{Map, Value, json};
use tempfile::tempdir;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::agents::prompts::{PLANNING_APOLOGY, system_messages};
use crate::agents::*;
use crate::auth::*;
use crate::cli::*;
use crate::config::*;
use crate::error::*;
use crate::llm::*;
use crate::planner::*;
use crate::server::*;
use crate::session::*;
use crate::streaming::*;
use crate::telemetry::*;
use crate::tools::*;

fn base_cfg() -> RuntimeConfig {
    RuntimeConfig {
        profile: "default".to_string(),
        config_path: ".threatdesk/config.toml".to_string(),
        model_base_url: "http://127.0.0.1:9/openai/v1".to_string(),
        model_api_key_env: "THREATDESK_TEST_KEY".to_string(),
        model_timeout_secs: 5,
        chat_model: "chat".to_string(),
        casual_model: "casual".to_string(),
        util_model: "util".to_string(),
        vision_model: "vision".to_string(),
        web_search_model: "search".to_string(),
        law_chat_model: "law".to_string(),
        reasoning_effort: None,
        confidence_threshold: 0.8,
        tool_timeout_secs: 5,
        mitre_data_dir: "data/mitre".to_string(),
        law_text_path: "data/myanmar_cyber_law.txt".to_string(),
        siem_logs_path: None,
        threat_intel_path: None,
        nvd_base_url: "http://127.0.0.1:9/nvd".to_string(),
        upload_dir: "uploads".to_string(),
        session_backend: SessionBackend::Memory,
        session_db_url: "sqlite://.threatdesk/test.db".to_string(),
        show_sensitive_config: false,
        telemetry_enabled: false,
        telemetry_path: ".threatdesk/test-telemetry.jsonl".to_string(),
        auth_tokens: vec!["tok-a=alice".to_string(), "tok-b=bob".to_string()],
        server_host: DEFAULT_HOST.to_string(),
        server_port: DEFAULT_PORT,
    }
}

fn test_cli(config_path: &str, profile: &str, extra: &[&str]) -> Cli {
    let mut args = vec![
        "threatdesk",
        "--config-path",
        config_path,
        "--profile",
        profile,
    ];
    args.extend_from_slice(extra);
    args.push("doctor");
    Cli::try_parse_from(args).expect("cli should parse")
}

fn params(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => panic!("params must be an object, got {other}"),
    }
}

// Probe tool: `Echo.id(v, delay_ms?) -> v`, `Echo.fail(v)` always errors.
#[derive(Default)]
struct EchoTool {
    calls: AtomicUsize,
    log: Mutex<Vec<(String, Instant, Instant)>>,
}

const ECHO_FUNCTIONS: &[FunctionSpec] = &[
    FunctionSpec::new("id", &["v", "delay_ms"], "returns v"),
    FunctionSpec::new("fail", &["v"], "always fails"),
];

impl EchoTool {
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn finished(&self) -> Vec<(String, Instant, Instant)> {
        self.log.lock().expect("echo log lock").clone()
    }
}

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "Echo"
    }

    fn description(&self) -> &str {
        "echoes its input"
    }

    fn functions(&self) -> &[FunctionSpec] {
        ECHO_FUNCTIONS
    }

    async fn call(&self, function: &str, args: ToolArgs) -> Result<Value, ToolError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let started = Instant::now();
        let value = args.required_str(&["v"])?.to_string();
        if function == "fail" {
            return Err(ToolError::Upstream(format!("boom for {value}")));
        }
        let delay = args.optional_u64("delay_ms")?.unwrap_or(0);
        tokio::time::sleep(Duration::from_millis(delay)).await;
        self.log
            .lock()
            .expect("echo log lock")
            .push((value.clone(), started, Instant::now()));
        Ok(Value::String(value))
    }
}

#[derive(Default)]
struct FakeDetectionTool {
    calls: Mutex<Vec<(String, Map<String, Value>)>>,
}

const FAKE_DETECTION_FUNCTIONS: &[FunctionSpec] = &[
    FunctionSpec::new("detect_url", &["url"], "scan a URL"),
    FunctionSpec::new("detect_file", &["file_path"], "scan an uploaded file"),
];

#[async_trait]
impl Tool for FakeDetectionTool {
    fn name(&self) -> &str {
        DETECTION_TOOL_NAME
    }

    fn description(&self) -> &str {
        "fake scanner"
    }

    fn functions(&self) -> &[FunctionSpec] {
        FAKE_DETECTION_FUNCTIONS
    }

    async fn call(&self, function: &str, args: ToolArgs) -> Result<Value, ToolError> {
        self.calls
            .lock()
            .expect("detection log lock")
            .push((function.to_string(), args.as_map().clone()));
        Ok(json!({ "verdict": "clean", "malicious": 0, "harmless": 71 }))
    }
}

fn echo_orchestrator(echo: &Arc<EchoTool>) -> PlanOrchestrator {
    orchestrator_for(
        ToolRegistry::new().with_tool(echo.clone()),
        Duration::from_secs(5),
        &TelemetrySink::disabled(),
    )
}

fn echo_call(v: &str, delay_ms: u64) -> Value {
    json!({ "tool": "Echo", "function": "id", "params": { "v": v, "delay_ms": delay_ms } })
}

/// Scripted model: completions are picked by the system prompt of the
/// request, streams always yield the configured answer.
#[derive(Default)]
struct ScriptedModel {
    intent: String,
    refinement: String,
    plan: String,
    title: String,
    answer: String,
    reasoning: Option<String>,
    tool_answer: Option<String>,
    completions: Mutex<Vec<ChatRequest>>,
    streams: Mutex<Vec<ChatRequest>>,
}

impl ScriptedModel {
    fn casual() -> Self {
        Self {
            intent: "{\"intent\": \"casual\"}".to_string(),
            title: "{\"title\": \"Greeting Chat\"}".to_string(),
            answer: "Hello there".to_string(),
            ..Self::default()
        }
    }

    fn completions(&self) -> Vec<ChatRequest> {
        self.completions.lock().expect("completions lock").clone()
    }

    fn streams(&self) -> Vec<ChatRequest> {
        self.streams.lock().expect("streams lock").clone()
    }
}

#[async_trait]
impl ChatModel for ScriptedModel {
    async fn complete(&self, request: ChatRequest) -> Result<String> {
        let system = request
            .messages
            .first()
            .map(ChatMessage::text)
            .unwrap_or_default();
        self.completions
            .lock()
            .expect("completions lock")
            .push(request);
        if system.contains("Classify the user's query") {
            Ok(self.intent.clone())
        } else if system.contains("Refine the user's query") {
            Ok(self.refinement.clone())
        } else if system.contains("You plan tool calls") {
            Ok(self.plan.clone())
        } else if system.contains("Generate a concise title") {
            Ok(self.title.clone())
        } else if let Some(answer) = &self.tool_answer {
            Ok(answer.clone())
        } else {
            bail!("unexpected completion request")
        }
    }

    async fn stream(&self, request: ChatRequest) -> Result<DeltaStream> {
        self.streams.lock().expect("streams lock").push(request);
        let mut deltas = Vec::new();
        if let Some(reasoning) = &self.reasoning {
            deltas.push(Ok(StreamDelta::reasoning(reasoning.clone())));
        }
        deltas.push(Ok(StreamDelta::content(self.answer.clone())));
        let stream: DeltaStream = Box::pin(futures_util::stream::iter(deltas));
        Ok(stream)
    }
}

struct Harness {
    model: Arc<ScriptedModel>,
    echo: Arc<EchoTool>,
    scanner: Arc<FakeDetectionTool>,
    agent: MasterAgent,
}

fn harness(model: ScriptedModel) -> Harness {
    let model = Arc::new(model);
    let echo = Arc::new(EchoTool::default());
    let scanner = Arc::new(FakeDetectionTool::default());
    let chat_model: Arc<dyn ChatModel> = model.clone();
    let telemetry = TelemetrySink::disabled();
    let timeout = Duration::from_secs(5);

    let settings = AnswerSettings {
        chat_model: "chat".to_string(),
        casual_model: "casual".to_string(),
        reasoning_effort: None,
    };
    let knowledge = KnowledgeAgent::new(
        chat_model.clone(),
        settings.clone(),
        QueryRefiner::new(chat_model.clone(), "util".to_string()),
        PlanningAgent::new(
            "knowledge",
            Arc::new(LlmPlanGenerator::new(
                chat_model.clone(),
                "util".to_string(),
                "tests",
            )),
            orchestrator_for(ToolRegistry::new().with_tool(echo.clone()), timeout, &telemetry),
        ),
    );
    let detection = DetectionAgent::new(
        chat_model.clone(),
        settings,
        PlanningAgent::new(
            "detection",
            Arc::new(LlmPlanGenerator::new(
                chat_model.clone(),
                "util".to_string(),
                "tests",
            )),
            orchestrator_for(
                ToolRegistry::new().with_tool(scanner.clone()),
                timeout,
                &telemetry,
            ),
        ),
    );
    let agent = MasterAgent::new(
        IntentClassifier::new(chat_model.clone(), "util".to_string()),
        knowledge,
        detection,
        ImageAgent::new(chat_model.clone(), "vision".to_string()),
        TitleGenerator::new(chat_model, "util".to_string()),
    );

    Harness {
        model,
        echo,
        scanner,
        agent,
    }
}

fn drain(rx: &mut mpsc::UnboundedReceiver<ServerEvent>) -> Vec<ServerEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

async fn respond(
    harness: &Harness,
    turn: TurnRequest,
) -> (TurnOutcome, Vec<ServerEvent>) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let outcome = harness
        .agent
        .respond(&turn, &system_messages(), &tx, &CancellationToken::new())
        .await
        .expect("turn should complete");
    (outcome, drain(&mut rx))
}

fn last_user_text(request: &ChatRequest) -> String {
    request
        .messages
        .last()
        .map(ChatMessage::text)
        .unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Planner properties
// ---------------------------------------------------------------------------

#[tokio::test]
async fn step_keys_with_embedded_digits_run_in_ascending_order() {
    let echo = Arc::new(EchoTool::default());
    let orchestrator = echo_orchestrator(&echo);
    let raw = json!({
        "step_12": [echo_call("c", 0)],
        "2": [echo_call("b", 0)],
        "step1": [echo_call("a", 0)],
    });

    let plan = orchestrator.validate(&raw).expect("plan should validate");
    assert_eq!(plan.step_numbers(), vec![1, 2, 12]);

    let results = orchestrator.run_plan(&plan, &CancellationToken::new()).await;
    assert_eq!(results.to_value(), json!({"1": ["a"], "2": ["b"], "12": ["c"]}));
    let order = echo
        .finished()
        .into_iter()
        .map(|(value, _, _)| value)
        .collect::<Vec<_>>();
    assert_eq!(order, vec!["a", "b", "c"]);
}

#[test]
fn single_call_objects_become_singleton_steps() {
    let echo = Arc::new(EchoTool::default());
    let plan = echo_orchestrator(&echo)
        .validate(&json!({"1": echo_call("a", 0)}))
        .expect("plan should validate");
    let step = plan.step(1).expect("step 1 present");
    assert_eq!(step.len(), 1);
    assert_eq!(step[0].tool, "Echo");
    assert_eq!(step[0].function, "id");
}

#[tokio::test]
async fn unknown_tool_rejects_the_plan_before_any_call_runs() {
    let echo = Arc::new(EchoTool::default());
    let raw = json!({
        "1": [echo_call("a", 0)],
        "2": [{"tool": "Nope", "function": "id", "params": {}}],
    });

    let err = echo_orchestrator(&echo)
        .execute_raw(&raw, &CancellationToken::new())
        .await
        .expect_err("unknown tool should reject the plan");
    assert_eq!(
        err,
        PlanStructureError::UnknownTool {
            step: 2,
            tool: "Nope".to_string()
        }
    );
    assert_eq!(echo.calls(), 0);
}

#[tokio::test]
async fn unknown_function_is_rejected_eagerly() {
    let echo = Arc::new(EchoTool::default());
    let raw = json!({"1": {"tool": "Echo", "function": "missing", "params": {}}});
    let err = echo_orchestrator(&echo)
        .execute_raw(&raw, &CancellationToken::new())
        .await
        .expect_err("unknown function should reject the plan");
    assert!(matches!(err, PlanStructureError::UnknownFunction { step: 1, .. }));
    assert_eq!(echo.calls(), 0);
}

#[tokio::test]
async fn step_outcomes_keep_input_order_when_later_calls_finish_first() {
    let echo = Arc::new(EchoTool::default());
    let executor = StepExecutor::new(Arc::new(ToolRegistry::new().with_tool(echo.clone())));
    let calls = [("a", 150), ("b", 75), ("c", 0)]
        .into_iter()
        .map(|(v, delay)| {
            ToolCall::new("Echo", "id", params(json!({"v": v, "delay_ms": delay})))
        })
        .collect::<Vec<_>>();

    let outcomes = executor
        .execute_step(&calls, &CancellationToken::new())
        .await;

    assert_eq!(
        outcomes,
        vec![
            CallOutcome::Success(json!("a")),
            CallOutcome::Success(json!("b")),
            CallOutcome::Success(json!("c")),
        ]
    );
    let finished_first = echo.finished().first().map(|(value, _, _)| value.clone());
    assert_eq!(finished_first.as_deref(), Some("c"));
}

#[tokio::test]
async fn failing_call_is_reported_next_to_successful_sibling() {
    let echo = Arc::new(EchoTool::default());
    let raw = json!({"1": [
        echo_call("a", 0),
        {"tool": "Echo", "function": "fail", "params": {"v": "x"}},
    ]});

    let results = echo_orchestrator(&echo)
        .execute_raw(&raw, &CancellationToken::new())
        .await
        .expect("plan should run");
    let step = results.step(1).expect("step 1 results");
    assert_eq!(step.len(), 2);
    assert_eq!(step[0], CallOutcome::Success(json!("a")));
    let err = step[1].error().expect("second call failed");
    assert_eq!(err.kind, CallErrorKind::CallExecution);
    assert_eq!(err.tool, "Echo");
    assert_eq!(err.function, "fail");
    assert!(err.message.contains("boom for x"));
    assert_eq!(results.failure_count(), 1);
}

#[tokio::test]
async fn later_steps_start_after_earlier_steps_return() {
    let echo = Arc::new(EchoTool::default());
    let raw = json!({
        "1": [echo_call("a", 60)],
        "2": [echo_call("b", 0)],
    });

    let results = echo_orchestrator(&echo)
        .execute_raw(&raw, &CancellationToken::new())
        .await
        .expect("plan should run");
    assert_eq!(results.to_value(), json!({"1": ["a"], "2": ["b"]}));

    let log = echo.finished();
    assert_eq!(log.len(), 2);
    let (_, _, first_returned) = &log[0];
    let (second, second_started, _) = &log[1];
    assert_eq!(second, "b");
    assert!(second_started >= first_returned);
}

#[test]
fn validating_a_normalized_plan_is_a_fixed_point() {
    let echo = Arc::new(EchoTool::default());
    let orchestrator = echo_orchestrator(&echo);
    let raw = json!({
        "step 3": {"tool": " Echo ", "function": "id: {\"v\": \"...\"}", "params": {"v": "c"}},
        "1": [echo_call("a", 0), echo_call("b", 5)],
    });

    let plan = orchestrator.validate(&raw).expect("plan should validate");
    let again = orchestrator
        .validate(&plan.to_raw())
        .expect("normalized plan should validate");
    assert_eq!(plan, again);
    assert_eq!(plan.step(3).expect("step 3")[0].tool, "Echo");
    assert_eq!(plan.step(3).expect("step 3")[0].function, "id");
}

#[tokio::test]
async fn zero_and_negative_step_keys_are_rejected() {
    let echo = Arc::new(EchoTool::default());
    let orchestrator = echo_orchestrator(&echo);
    for key in ["0", "-1", "step:-3", "step_0", "-0"] {
        let mut raw = Map::new();
        raw.insert(key.to_string(), echo_call("a", 0));
        let err = orchestrator
            .execute_raw(&Value::Object(raw), &CancellationToken::new())
            .await
            .expect_err("non-positive step should be rejected");
        assert!(
            matches!(err, PlanStructureError::NonPositiveStep(_)),
            "key {key:?} gave {err:?}"
        );
    }
    assert_eq!(echo.calls(), 0);
}

#[test]
fn malformed_calls_are_rejected_with_the_offending_field() {
    let echo = Arc::new(EchoTool::default());
    let orchestrator = echo_orchestrator(&echo);

    let missing = orchestrator
        .validate(&json!({"1": {"tool": "Echo", "function": "id"}}))
        .expect_err("missing params");
    assert_eq!(
        missing,
        PlanStructureError::MissingField {
            step: 1,
            field: "params"
        }
    );

    let mistyped = orchestrator
        .validate(&json!({"1": {"tool": "Echo", "function": "id", "params": "v=a"}}))
        .expect_err("params must be an object");
    assert!(matches!(
        mistyped,
        PlanStructureError::InvalidField { field: "params", .. }
    ));

    assert!(matches!(
        orchestrator.validate(&json!(["not", "a", "plan"])),
        Err(PlanStructureError::NotAnObject(_))
    ));
    assert!(matches!(
        orchestrator.validate(&json!({"1": echo_call("a", 0), "step1": echo_call("b", 0)})),
        Err(PlanStructureError::DuplicateStep { step: 1, .. })
    ));
    assert_eq!(
        orchestrator.validate(&json!({})).expect("empty plan").len(),
        0
    );
}

// ---------------------------------------------------------------------------
// Routing and answers
// ---------------------------------------------------------------------------

#[tokio::test]
async fn casual_turns_go_straight_to_the_casual_model() {
    let harness = harness(ScriptedModel::casual());
    let (outcome, events) = respond(&harness, TurnRequest::new("hi!")).await;

    assert_eq!(outcome.route, Route::Casual);
    assert_eq!(outcome.answer, TurnAnswer::text("Hello there"));
    assert_eq!(
        events,
        vec![ServerEvent::Answer {
            data: "Hello there".to_string()
        }]
    );
    let streams = harness.model.streams();
    assert_eq!(streams.len(), 1);
    assert_eq!(streams[0].model, "casual");
    assert_eq!(last_user_text(&streams[0]), "hi!");
    assert_eq!(harness.model.completions().len(), 1);
}

#[tokio::test]
async fn confident_refinements_are_answered_without_tools() {
    let harness = harness(ScriptedModel {
        intent: "{\"intent\": \"knowledge\"}".to_string(),
        refinement: "{\"refined_query\": \"Explain phishing\", \"intent\": \"yes\", \"confidence\": 0.95}"
            .to_string(),
        answer: "Phishing is...".to_string(),
        ..ScriptedModel::default()
    });
    let (outcome, _) = respond(&harness, TurnRequest::new("what's phishing")).await;

    assert_eq!(outcome.route, Route::Knowledge);
    let streams = harness.model.streams();
    assert_eq!(streams[0].model, "chat");
    assert_eq!(last_user_text(&streams[0]), "Explain phishing");
    assert_eq!(harness.echo.calls(), 0);
}

#[tokio::test]
async fn unsure_refinements_answer_from_tool_results() {
    let harness = harness(ScriptedModel {
        intent: "knowledge_agent".to_string(),
        refinement: "{\"refined_query\": \"CVE-2021-44228 details\", \"intent\": \"no\", \"confidence\": 0.9}"
            .to_string(),
        plan: "```json\n{\"1\": [{\"tool\": \"Echo\", \"function\": \"id\", \"params\": {\"v\": \"log4shell\"}}]}\n```"
            .to_string(),
        answer: "It is Log4Shell.".to_string(),
        ..ScriptedModel::default()
    });
    let (outcome, _) = respond(&harness, TurnRequest::new("What is CVE-2021-44228?")).await;

    assert_eq!(outcome.route, Route::Knowledge);
    assert_eq!(outcome.answer.answer, "It is Log4Shell.");
    assert_eq!(harness.echo.calls(), 1);
    let streams = harness.model.streams();
    assert_eq!(streams[0].model, "chat");
    let prompt = last_user_text(&streams[0]);
    assert!(prompt.contains("\"log4shell\""));
    assert!(prompt.ends_with("User Query: What is CVE-2021-44228?"));
}

#[tokio::test]
async fn rejected_or_missing_plans_answer_with_an_apology() {
    for plan in [
        "{\"1\": {\"tool\": \"Nope\", \"function\": \"id\", \"params\": {}}}",
        "I would search the web for this.",
    ] {
        let harness = harness(ScriptedModel {
            intent: "{\"intent\": \"knowledge\"}".to_string(),
            refinement: "{\"intent\": \"no\", \"confidence\": 0.1}".to_string(),
            plan: plan.to_string(),
            ..ScriptedModel::default()
        });
        let (outcome, events) = respond(&harness, TurnRequest::new("latest APT28 campaigns")).await;

        assert_eq!(outcome.answer, TurnAnswer::text(PLANNING_APOLOGY));
        assert_eq!(
            events,
            vec![ServerEvent::Answer {
                data: PLANNING_APOLOGY.to_string()
            }]
        );
        assert!(harness.model.streams().is_empty());
        assert_eq!(harness.echo.calls(), 0);
    }
}

#[tokio::test]
async fn detection_turns_plan_scans_and_explain_the_verdict() {
    let harness = harness(ScriptedModel {
        intent: "{\"intent\": \"detection\"}".to_string(),
        plan: "{\"1\": {\"tool\": \"DetectionTool\", \"function\": \"detect_url\", \"params\": {\"url\": \"http://evil.example\"}}}"
            .to_string(),
        answer: "✅ Looks safe".to_string(),
        ..ScriptedModel::default()
    });
    let (outcome, _) = respond(&harness, TurnRequest::new("is http://evil.example safe?")).await;

    assert_eq!(outcome.route, Route::Detection);
    let scans = harness.scanner.calls.lock().expect("detection log lock").clone();
    assert_eq!(scans.len(), 1);
    assert_eq!(scans[0].0, "detect_url");
    let streams = harness.model.streams();
    assert_eq!(streams[0].model, "casual");
    let prompt = last_user_text(&streams[0]);
    assert!(prompt.contains("RESULT :"));
    assert!(prompt.contains("\"verdict\": \"clean\""));
    assert!(prompt.ends_with("This is the query : is http://evil.example safe?"));
}

#[tokio::test]
async fn attached_files_are_scanned_without_classification() {
    let harness = harness(ScriptedModel {
        answer: "✅ Clean file".to_string(),
        ..ScriptedModel::default()
    });
    let turn = TurnRequest {
        file_url: Some("uploads/report.pdf".to_string()),
        ..TurnRequest::new("is this file safe?")
    };
    let (outcome, _) = respond(&harness, turn).await;

    assert_eq!(outcome.route, Route::FileScan);
    assert!(harness.model.completions().is_empty());
    let scans = harness.scanner.calls.lock().expect("detection log lock").clone();
    assert_eq!(scans.len(), 1);
    assert_eq!(scans[0].0, "detect_file");
    assert_eq!(scans[0].1.get("file_path"), Some(&json!("uploads/report.pdf")));
    assert!(last_user_text(&harness.model.streams()[0]).contains("\"harmless\": 71"));
}

#[tokio::test]
async fn attached_images_go_to_the_vision_model() {
    let harness = harness(ScriptedModel {
        answer: "A login page".to_string(),
        ..ScriptedModel::default()
    });
    let turn = TurnRequest {
        image_url: Some("https://img.example/shot.png".to_string()),
        include_reasoning: true,
        ..TurnRequest::new("is this phishing?")
    };
    let (outcome, _) = respond(&harness, turn).await;

    assert_eq!(outcome.route, Route::Image);
    assert!(harness.model.completions().is_empty());
    let streams = harness.model.streams();
    assert_eq!(streams[0].model, "vision");
    assert_eq!(streams[0].include_reasoning, None);
    let last = streams[0].messages.last().expect("user message");
    assert!(matches!(last.content, MessageContent::Parts(_)));
    assert_eq!(
        last.text(),
        "is this phishing?\n[image: https://img.example/shot.png]"
    );
}

#[tokio::test]
async fn reasoning_is_streamed_only_when_requested() {
    let model = || ScriptedModel {
        reasoning: Some("thinking".to_string()),
        ..ScriptedModel::casual()
    };

    let quiet = harness(model());
    let (outcome, events) = respond(&quiet, TurnRequest::new("hey")).await;
    assert_eq!(outcome.answer.reason, None);
    assert!(
        !events
            .iter()
            .any(|event| matches!(event, ServerEvent::Reasoning { .. }))
    );

    let verbose = harness(model());
    let turn = TurnRequest {
        include_reasoning: true,
        ..TurnRequest::new("hey")
    };
    let (outcome, events) = respond(&verbose, turn).await;
    assert_eq!(outcome.answer.reason.as_deref(), Some("thinking"));
    assert_eq!(
        events[0],
        ServerEvent::Reasoning {
            data: "thinking".to_string()
        }
    );
    assert_eq!(verbose.model.streams()[0].include_reasoning, Some(true));
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

#[tokio::test]
async fn authenticated_turns_persist_messages_and_titles() {
    let harness = harness(ScriptedModel::casual());
    let store: Arc<dyn ChatStore> = Arc::new(InMemoryChatStore::new());
    let mut session = ConversationSession::new(store.clone(), system_messages());
    session.set_principal(Some(Principal {
        user_id: "alice".to_string(),
    }));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();

    session
        .handle_turn(&harness.agent, &TurnRequest::new("hello"), &tx, &cancel)
        .await
        .expect("first turn");
    let events = drain(&mut rx);
    let ServerEvent::NewChat { unique_id, .. } = &events[0] else {
        panic!("first event should announce the chat, got {events:?}");
    };
    let chat_id = unique_id.clone();
    assert_eq!(
        events.last(),
        Some(&ServerEvent::Title {
            title: "Greeting Chat".to_string(),
            chat_id: chat_id.clone()
        })
    );
    let chat = store
        .find_chat(&chat_id)
        .await
        .expect("find chat")
        .expect("chat stored");
    assert_eq!(chat.title, "Greeting Chat");
    let stored = store.list_messages(chat.id).await.expect("messages");
    assert_eq!(
        stored
            .iter()
            .map(|message| (message.role, message.content.as_str()))
            .collect::<Vec<_>>(),
        vec![(Role::User, "hello"), (Role::Assistant, "Hello there")]
    );

    let follow_up = TurnRequest {
        chat_id: Some(chat_id.clone()),
        ..TurnRequest::new("and again")
    };
    session
        .handle_turn(&harness.agent, &follow_up, &tx, &cancel)
        .await
        .expect("second turn");
    assert!(
        drain(&mut rx)
            .iter()
            .any(|event| matches!(event, ServerEvent::Title { .. }))
    );
    // Second answer sees both system messages, the first exchange and the new query.
    assert_eq!(harness.model.streams()[1].messages.len(), 5);

    let third = TurnRequest {
        chat_id: Some(chat_id.clone()),
        ..TurnRequest::new("one more")
    };
    session
        .handle_turn(&harness.agent, &third, &tx, &cancel)
        .await
        .expect("third turn");
    assert!(
        !drain(&mut rx)
            .iter()
            .any(|event| matches!(event, ServerEvent::Title { .. }))
    );
    assert_eq!(store.list_messages(chat.id).await.expect("messages").len(), 6);
}

#[tokio::test]
async fn anonymous_turns_are_answered_but_not_stored() {
    let harness = harness(ScriptedModel::casual());
    let store: Arc<dyn ChatStore> = Arc::new(InMemoryChatStore::new());
    let mut session = ConversationSession::new(store.clone(), system_messages());
    let (tx, mut rx) = mpsc::unbounded_channel();

    let outcome = session
        .handle_turn(
            &harness.agent,
            &TurnRequest::new("hi"),
            &tx,
            &CancellationToken::new(),
        )
        .await
        .expect("anonymous turn");
    assert_eq!(outcome.answer.answer, "Hello there");
    assert!(
        !drain(&mut rx)
            .iter()
            .any(|event| matches!(event, ServerEvent::NewChat { .. } | ServerEvent::Title { .. }))
    );
    assert!(store.list_chats("alice").await.expect("list chats").is_empty());
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

fn server_state(harness: Harness) -> (Arc<ServerState>, Arc<dyn ChatStore>) {
    let cfg = base_cfg();
    let store: Arc<dyn ChatStore> = Arc::new(InMemoryChatStore::new());
    let verifier =
        StaticTokenVerifier::from_pairs(&cfg.auth_tokens).expect("test tokens should parse");
    let state = Arc::new(ServerState {
        cfg,
        telemetry: TelemetrySink::disabled(),
        agent: Arc::new(harness.agent),
        store: store.clone(),
        verifier: Arc::new(verifier),
    });
    (state, store)
}

fn bearer(token: &'static str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        AUTHORIZATION,
        HeaderValue::from_str(&format!("Bearer {token}")).expect("header value"),
    );
    headers
}

async fn frame_events(state: &ServerState, frame: &str, header_token: Option<&str>) -> Vec<ServerEvent> {
    let mut session = ConversationSession::new(state.store.clone(), system_messages());
    let (tx, mut rx) = mpsc::unbounded_channel();
    run_frame(
        state,
        &mut session,
        frame,
        header_token,
        &tx,
        &CancellationToken::new(),
    )
    .await;
    drain(&mut rx)
}

#[test]
fn client_frames_use_camel_case_and_drop_blank_fields() {
    let frame = ClientFrame::parse(
        r#"{"query": " scan this ", "includeReasoning": true, "currentChatId": "", "fileUrl": "uploads/a.exe", "token": " tok-a "}"#,
    )
    .expect("frame parses");
    let (turn, token) = frame.into_turn().expect("turn");
    assert_eq!(turn.query, "scan this");
    assert!(turn.include_reasoning);
    assert_eq!(turn.chat_id, None);
    assert_eq!(turn.file_url.as_deref(), Some("uploads/a.exe"));
    assert_eq!(turn.image_url, None);
    assert_eq!(token.as_deref(), Some("tok-a"));
}

#[tokio::test]
async fn bad_frames_get_an_error_then_done() {
    let (state, _) = server_state(harness(ScriptedModel::casual()));

    for (frame, expected) in [
        ("not json", "invalid message"),
        ("{\"query\": \"   \"}", "query cannot be empty"),
        ("{\"query\": \"hi\", \"token\": \"forged\"}", "invalid or expired token"),
        ("{\"query\": \"hi\", \"currentChatId\": \"abc\"}", "token is required"),
    ] {
        let events = frame_events(&state, frame, None).await;
        assert_eq!(events.len(), 2, "frame {frame:?} gave {events:?}");
        match &events[0] {
            ServerEvent::Error { message } => {
                assert!(message.contains(expected), "{message:?} for {frame:?}")
            }
            other => panic!("expected an error event, got {other:?}"),
        }
        assert_eq!(events[1], ServerEvent::Done);
    }
}

#[tokio::test]
async fn chat_history_endpoints_enforce_ownership() {
    let (state, store) = server_state(harness(ScriptedModel::casual()));

    let events = frame_events(&state, "{\"query\": \"hello\"}", Some("tok-a")).await;
    let Some(ServerEvent::NewChat { unique_id, .. }) = events.first() else {
        panic!("header token should start a stored chat, got {events:?}");
    };
    assert_eq!(events.last(), Some(&ServerEvent::Done));
    let chat_id = unique_id.clone();

    let Json(chats) = handle_list_chats(State(state.clone()), bearer("tok-a"))
        .await
        .expect("list chats");
    assert_eq!(chats.len(), 1);
    assert_eq!(chats[0].title, "Greeting Chat");
    assert_eq!(chats[0].last_message, "Hello there");
    assert_eq!(chats[0].message_count, 2);

    let Json(transcript) = handle_get_chat(
        State(state.clone()),
        Path(chat_id.clone()),
        bearer("tok-a"),
    )
    .await
    .expect("owner reads chat");
    assert_eq!(transcript.id, chat_id);
    assert_eq!(transcript.messages.len(), 2);
    assert_eq!(transcript.messages[0].role, Role::User);

    let (status, _) = handle_get_chat(State(state.clone()), Path(chat_id.clone()), bearer("tok-b"))
        .await
        .expect_err("other users cannot read the chat");
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = handle_list_chats(State(state.clone()), HeaderMap::new())
        .await
        .expect_err("missing token");
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = handle_delete_chat(State(state.clone()), Path(chat_id.clone()), bearer("tok-b"))
        .await
        .expect_err("other users cannot delete the chat");
    assert_eq!(status, StatusCode::NOT_FOUND);

    let Json(body) = handle_delete_chat(State(state.clone()), Path(chat_id.clone()), bearer("tok-a"))
        .await
        .expect("owner deletes chat");
    assert_eq!(body["success"], json!(true));
    assert!(store.find_chat(&chat_id).await.expect("find chat").is_none());
}

// ---------------------------------------------------------------------------
// Config, telemetry, errors
// ---------------------------------------------------------------------------

#[test]
fn runtime_config_uses_selected_profile_then_defaults() {
    let dir = tempdir().expect("temp directory should create");
    let path = dir.path().join("config.toml");
    std::fs::write(
        &path,
        r#"
[profiles.ops]
chat_model = "llama-3.3-70b-versatile"
session_backend = "memory"
tool_timeout_secs = 10
confidence_threshold = 0.6
mitre_data_dir = "/srv/attack"
auth_tokens = ["tok-a=alice"]
port = 9000
"#,
    )
    .expect("config should write");

    let cli = test_cli(path.to_string_lossy().as_ref(), "ops", &[]);
    let profiles = load_profiles(&cli.config_path).expect("profiles should load");
    let cfg = resolve_runtime_config(&cli, &profiles).expect("runtime config should resolve");

    assert_eq!(cfg.profile, "ops");
    assert_eq!(cfg.chat_model, "llama-3.3-70b-versatile");
    assert_eq!(cfg.casual_model, "openai/gpt-oss-20b");
    assert_eq!(cfg.session_backend, SessionBackend::Memory);
    assert_eq!(cfg.tool_timeout_secs, 10);
    assert_eq!(cfg.confidence_threshold, 0.6);
    assert_eq!(cfg.mitre_data_dir, "/srv/attack");
    assert_eq!(cfg.auth_tokens, vec!["tok-a=alice".to_string()]);
    assert_eq!(cfg.server_port, 9000);
    assert_eq!(cfg.server_host, DEFAULT_HOST);
    assert_eq!(cfg.model_api_key_env, "GROQ_API_KEY");
    assert!(cfg.telemetry_enabled);
}

#[test]
fn runtime_config_cli_overrides_profile_values() {
    let dir = tempdir().expect("temp directory should create");
    let path = dir.path().join("config.toml");
    std::fs::write(
        &path,
        r#"
[profiles.default]
tool_timeout_secs = 10
telemetry_enabled = true
auth_tokens = ["tok-a=alice"]
"#,
    )
    .expect("config should write");

    let cli = test_cli(
        path.to_string_lossy().as_ref(),
        "default",
        &[
            "--tool-timeout-secs",
            "20",
            "--telemetry-enabled",
            "false",
            "--auth-token",
            "tok-b=bob,tok-a=alice",
        ],
    );
    let profiles = load_profiles(&cli.config_path).expect("profiles should load");
    let cfg = resolve_runtime_config(&cli, &profiles).expect("runtime config should resolve");

    assert_eq!(cfg.tool_timeout_secs, 20);
    assert!(!cfg.telemetry_enabled);
    assert_eq!(
        cfg.auth_tokens,
        vec!["tok-a=alice".to_string(), "tok-b=bob".to_string()]
    );
}

#[test]
fn runtime_config_rejects_out_of_range_confidence() {
    let cli = test_cli(
        ".threatdesk/does-not-exist.toml",
        "default",
        &["--confidence-threshold", "1.5"],
    );
    let profiles = load_profiles(&cli.config_path).expect("missing config should default");
    let err = resolve_runtime_config(&cli, &profiles).expect_err("threshold out of range");
    assert!(err.to_string().contains("confidence threshold"));
    assert_eq!(categorize_error(&err), ErrorCategory::Input);
}

#[test]
fn runtime_config_reports_missing_profile() {
    let cli = test_cli(".threatdesk/does-not-exist.toml", "ops", &[]);
    let profiles = load_profiles(&cli.config_path).expect("missing config should default");
    let err = resolve_runtime_config(&cli, &profiles).expect_err("missing profile should fail");
    assert!(err.to_string().contains("profile 'ops' not found"));
}

#[test]
fn invalid_profile_config_is_actionable() {
    let dir = tempdir().expect("temp directory should create");
    let path = dir.path().join("config.toml");
    std::fs::write(
        &path,
        r#"
[profiles.default]
planner_model = "gpt-4o"
"#,
    )
    .expect("config should write");

    let err = load_profiles(path.to_string_lossy().as_ref())
        .expect_err("unknown field should fail parsing");
    assert!(format!("{err:#}").contains("invalid profile configuration"));
}

#[test]
fn telemetry_summary_counts_plan_tool_and_turn_events() {
    let lines = vec![
        json!({"ts_unix_ms": 1000, "event": "command.started", "run_id": "run-a", "command": "serve"})
            .to_string(),
        json!({"ts_unix_ms": 1100, "event": "plan.validated", "run_id": "run-a", "command": "serve", "steps": 2})
            .to_string(),
        json!({"ts_unix_ms": 1200, "event": "tool.requested", "run_id": "run-a", "command": "serve", "tool": "CVE"})
            .to_string(),
        json!({"ts_unix_ms": 1300, "event": "tool.failed", "run_id": "run-a", "command": "serve", "tool": "CVE", "kind": "Timeout"})
            .to_string(),
        json!({"ts_unix_ms": 1400, "event": "turn.completed", "run_id": "run-a", "command": "serve", "route": "knowledge"})
            .to_string(),
        json!({"ts_unix_ms": 1500, "event": "plan.rejected", "run_id": "run-b", "command": "plan.validate"})
            .to_string(),
        "invalid-json-line".to_string(),
    ];

    let summary = summarize_telemetry_lines(lines, 100);
    assert_eq!(summary.total_lines, 7);
    assert_eq!(summary.parsed_events, 6);
    assert_eq!(summary.parse_errors, 1);
    assert_eq!(summary.unique_runs.len(), 2);
    assert_eq!(summary.plan_validated, 1);
    assert_eq!(summary.plan_rejected, 1);
    assert_eq!(summary.tool_requested, 1);
    assert_eq!(summary.tool_failed, 1);
    assert_eq!(summary.tool_failure_kinds.get("Timeout"), Some(&1));
    assert_eq!(summary.turns_completed, 1);
    assert_eq!(summary.turn_routes.get("knowledge"), Some(&1));
    assert_eq!(summary.command_counts.get("serve"), Some(&5));
    assert_eq!(summary.last_event_ts_unix_ms, Some(1500));
}

#[test]
fn telemetry_sink_appends_jsonl_records() {
    let dir = tempdir().expect("temp directory should create");
    let mut cfg = base_cfg();
    cfg.telemetry_enabled = true;
    cfg.telemetry_path = dir
        .path()
        .join("nested/events.jsonl")
        .to_string_lossy()
        .to_string();

    let sink = TelemetrySink::new(&cfg, "plan.run".to_string());
    sink.emit("tool.succeeded", json!({"tool": "SIEM", "function": "get_summary"}));
    sink.emit("turn.completed", json!({"route": "casual"}));
    sink.flush();

    let content = std::fs::read_to_string(&cfg.telemetry_path).expect("telemetry file written");
    let records = content
        .lines()
        .map(|line| serde_json::from_str::<Value>(line).expect("valid json line"))
        .collect::<Vec<_>>();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0]["event"], json!("tool.succeeded"));
    assert_eq!(records[0]["command"], json!("plan.run"));
    assert_eq!(records[0]["tool"], json!("SIEM"));
    assert_eq!(records[1]["route"], json!("casual"));
}

#[test]
fn error_taxonomy_distinguishes_plan_session_and_tooling() {
    let plan_err = anyhow::Error::new(PlanStructureError::UnknownTool {
        step: 1,
        tool: "Nope".to_string(),
    });
    assert_eq!(categorize_error(&plan_err), ErrorCategory::Plan);

    let session_err = anyhow::anyhow!("failed to open chat store");
    assert_eq!(categorize_error(&session_err), ErrorCategory::Session);

    let tooling_err = anyhow::anyhow!("failed to build tool HTTP client");
    assert_eq!(categorize_error(&tooling_err), ErrorCategory::Tooling);

    let provider_err = anyhow::anyhow!("model endpoint returned 401");
    assert_eq!(categorize_error(&provider_err), ErrorCategory::Provider);
}

#[test]
fn format_cli_error_redacts_secrets_by_default() {
    let err = anyhow::anyhow!(
        "failed to connect to sqlite://secret/chats.db with Bearer tok-123"
    );
    let rendered = format_cli_error(&err, false);
    assert!(rendered.contains("sqlite://[REDACTED]"));
    assert!(rendered.contains("Bearer [REDACTED]"));
    assert!(!rendered.contains("tok-123"));
    assert!(format_cli_error(&err, true).contains("sqlite://secret/chats.db"));
}

#[test]
fn registries_advertise_the_planned_tools() {
    let cfg = base_cfg();
    let model: Arc<dyn ChatModel> = Arc::new(ScriptedModel::default());
    let knowledge =
        build_knowledge_registry(&cfg, model.clone(), model).expect("knowledge registry builds");
    for name in [
        CVE_TOOL_NAME,
        MITRE_TOOL_NAME,
        SIEM_TOOL_NAME,
        THREAT_INTEL_TOOL_NAME,
        WEBSEARCH_TOOL_NAME,
        LAW_TOOL_NAME,
    ] {
        assert!(knowledge.contains(name), "missing tool {name}");
    }
    assert!(!knowledge.contains(DETECTION_TOOL_NAME));

    let detection = build_detection_registry(&cfg).expect("detection registry builds");
    assert_eq!(detection.names(), vec![DETECTION_TOOL_NAME]);
    let catalog = detection.catalog();
    assert!(catalog.contains("detect_url"));
    assert!(catalog.contains("detect_file"));
}

fn tool_params(pairs: &[(&str, &str)]) -> ToolArgs {
    let params = pairs
        .iter()
        .map(|(key, value)| (key.to_string(), json!(value)))
        .collect::<Map<String, Value>>();
    ToolArgs::new(params)
}

fn tool_model(answer: &str) -> Arc<ScriptedModel> {
    Arc::new(ScriptedModel {
        tool_answer: Some(answer.to_string()),
        ..ScriptedModel::default()
    })
}

#[tokio::test]
async fn law_tool_reports_missing_text_at_call_time() {
    let dir = tempdir().expect("temp directory should create");
    let model = tool_model("unused");
    let tool = law::LawTool::new(
        model.clone(),
        "law".to_string(),
        dir.path().join("absent.txt"),
    );

    let err = tool
        .call("ask", tool_params(&[("query", "Is phishing illegal?")]))
        .await
        .expect_err("missing law text should fail");
    assert!(matches!(err, ToolError::NotFound(_)));
    assert!(model.completions().is_empty());
}

#[tokio::test]
async fn law_tool_accepts_question_alias_and_rejects_extra_arguments() {
    let dir = tempdir().expect("temp directory should create");
    let text_path = dir.path().join("law.txt");
    std::fs::write(&text_path, "Article 34: Unauthorized access is an offence.")
        .expect("write law text");
    let model = tool_model("Article 34 covers it.");
    let tool = law::LawTool::new(model.clone(), "law".to_string(), text_path);

    let answer = tool
        .call("ask", tool_params(&[("question", "Is hacking illegal?")]))
        .await
        .expect("alias should be accepted");
    assert_eq!(answer, json!("Article 34 covers it."));

    let requests = model.completions();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].model, "law");
    let prompt = requests[0].messages.last().map(ChatMessage::text).unwrap_or_default();
    assert!(prompt.contains("Is hacking illegal?"));
    assert!(prompt.contains("Article 34: Unauthorized access"));

    let err = tool
        .call(
            "ask",
            tool_params(&[("query", "Is hacking illegal?"), ("country", "MM")]),
        )
        .await
        .expect_err("extra argument should be rejected");
    assert!(matches!(err, ToolError::InvalidParams(ref message) if message.contains("country")));
    assert_eq!(model.completions().len(), 1);
}

#[tokio::test]
async fn web_search_sends_the_query_to_the_search_model() {
    let model = tool_model("CVE-2024-3400 is actively exploited.");
    let tool = web_search::WebSearchTool::new(model.clone(), "search".to_string());

    let answer = tool
        .call("websearch", tool_params(&[("query", "latest PAN-OS exploit")]))
        .await
        .expect("search should succeed");
    assert_eq!(answer, json!("CVE-2024-3400 is actively exploited."));

    let requests = model.completions();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].model, "search");
    assert_eq!(requests[0].messages.len(), 1);
    assert_eq!(requests[0].messages[0].text(), "latest PAN-OS exploit");

    let err = tool
        .call(
            "websearch",
            tool_params(&[("query", "x"), ("engine", "bing")]),
        )
        .await
        .expect_err("extra argument should be rejected");
    assert!(matches!(err, ToolError::InvalidParams(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn telemetry_from_concurrent_tasks_lands_after_flush() {
    let dir = tempdir().expect("temp directory should create");
    let mut cfg = base_cfg();
    cfg.telemetry_enabled = true;
    cfg.telemetry_path = dir
        .path()
        .join("events.jsonl")
        .to_string_lossy()
        .to_string();
    let sink = TelemetrySink::new(&cfg, "serve".to_string());

    let handles = (0..8)
        .map(|task| {
            let sink = sink.clone();
            tokio::spawn(async move {
                for call in 0..5 {
                    sink.emit("tool.requested", json!({"task": task, "call": call}));
                }
            })
        })
        .collect::<Vec<_>>();
    for handle in handles {
        handle.await.expect("task joins");
    }
    sink.flush();

    let content = std::fs::read_to_string(&cfg.telemetry_path).expect("telemetry file written");
    assert_eq!(content.lines().count(), 40);
    assert!(
        content
            .lines()
            .all(|line| serde_json::from_str::<Value>(line).is_ok())
    );
}
