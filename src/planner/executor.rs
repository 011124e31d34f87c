//! Concurrent execution of a single plan step.
//!
//! Every call in a step gets its own task. Outcomes are collected by awaiting
//! the join handles in input order, so completion order never shows up in the
//! returned vector. Failures of any kind become [`CallOutcome::Failed`]; this
//! module never returns an error.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::CallErrorKind;
use crate::planner::plan::{CallError, CallOutcome, ToolCall};
use crate::telemetry::TelemetrySink;
use crate::tools::{ToolArgs, ToolError, ToolRegistry};

pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(45);

#[derive(Clone)]
pub struct StepExecutor {
    registry: Arc<ToolRegistry>,
    call_timeout: Duration,
    telemetry: TelemetrySink,
}

impl StepExecutor {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self {
            registry,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            telemetry: TelemetrySink::disabled(),
        }
    }

    pub fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    pub fn with_telemetry(mut self, telemetry: TelemetrySink) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    pub async fn execute_step(
        &self,
        calls: &[ToolCall],
        cancel: &CancellationToken,
    ) -> Vec<CallOutcome> {
        let handles = calls
            .iter()
            .map(|call| self.spawn_call(call.clone(), cancel.clone()))
            .collect::<Vec<JoinHandle<CallOutcome>>>();

        let mut outcomes = Vec::with_capacity(calls.len());
        for (call, handle) in calls.iter().zip(handles) {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(join_err) => {
                    let message = if join_err.is_panic() {
                        "tool call panicked".to_string()
                    } else {
                        format!("tool call task aborted: {join_err}")
                    };
                    CallOutcome::Failed(CallError::new(CallErrorKind::CallExecution, call, message))
                }
            };
            self.report(call, &outcome);
            outcomes.push(outcome);
        }
        outcomes
    }

    fn spawn_call(&self, call: ToolCall, cancel: CancellationToken) -> JoinHandle<CallOutcome> {
        let registry = self.registry.clone();
        let call_timeout = self.call_timeout;

        tracing::debug!(tool = %call.tool, function = %call.function, "Tool call requested");
        self.telemetry.emit(
            "tool.requested",
            json!({ "tool": call.tool, "function": call.function }),
        );

        tokio::spawn(async move {
            let Some(tool) = registry.get(&call.tool) else {
                return CallOutcome::Failed(CallError::new(
                    CallErrorKind::UnknownTool,
                    &call,
                    format!("unknown tool: {}", call.tool),
                ));
            };
            if !tool.has_function(&call.function) {
                return CallOutcome::Failed(CallError::new(
                    CallErrorKind::UnknownFunction,
                    &call,
                    format!("unknown function: {}.{}", call.tool, call.function),
                ));
            }

            let started = Instant::now();
            let args = ToolArgs::new(call.params.clone());
            let result = tokio::select! {
                _ = cancel.cancelled() => {
                    return CallOutcome::Failed(CallError::new(
                        CallErrorKind::Cancelled,
                        &call,
                        "request cancelled before the call finished",
                    ));
                }
                result = tokio::time::timeout(call_timeout, tool.call(&call.function, args)) => result,
            };

            match result {
                Ok(Ok(value)) => {
                    tracing::debug!(
                        tool = %call.tool,
                        function = %call.function,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Tool call succeeded"
                    );
                    CallOutcome::Success(value)
                }
                Ok(Err(ToolError::UnknownFunction { .. })) => CallOutcome::Failed(CallError::new(
                    CallErrorKind::UnknownFunction,
                    &call,
                    format!("unknown function: {}.{}", call.tool, call.function),
                )),
                Ok(Err(err)) => CallOutcome::Failed(CallError::new(
                    CallErrorKind::CallExecution,
                    &call,
                    err.to_string(),
                )),
                Err(_) => CallOutcome::Failed(CallError::new(
                    CallErrorKind::Timeout,
                    &call,
                    format!("call exceeded {}ms", call_timeout.as_millis()),
                )),
            }
        })
    }

    fn report(&self, call: &ToolCall, outcome: &CallOutcome) {
        match outcome {
            CallOutcome::Success(_) => {
                self.telemetry.emit(
                    "tool.succeeded",
                    json!({ "tool": call.tool, "function": call.function }),
                );
            }
            CallOutcome::Failed(err) => {
                tracing::warn!(
                    tool = %err.tool,
                    function = %err.function,
                    kind = err.kind.label(),
                    error = %err.message,
                    "Tool call failed"
                );
                self.telemetry.emit(
                    "tool.failed",
                    json!({
                        "tool": err.tool,
                        "function": err.function,
                        "kind": err.kind.label(),
                        "error": err.message,
                    }),
                );
            }
        }
    }
}
