use std::sync::Arc;

use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use crate::error::PlanStructureError;
use crate::planner::executor::StepExecutor;
use crate::planner::plan::{Plan, PlanResults};
use crate::planner::validator::PlanValidator;
use crate::telemetry::TelemetrySink;
use crate::tools::ToolRegistry;

/// Validates a raw plan against one registry and runs it step by step.
///
/// Steps run strictly in ascending order; a later step starts only after every
/// call of the previous step has produced an outcome.
#[derive(Clone)]
pub struct PlanOrchestrator {
    executor: StepExecutor,
    telemetry: TelemetrySink,
}

impl PlanOrchestrator {
    pub fn new(executor: StepExecutor) -> Self {
        Self {
            executor,
            telemetry: TelemetrySink::disabled(),
        }
    }

    pub fn with_telemetry(mut self, telemetry: TelemetrySink) -> Self {
        self.executor = self.executor.with_telemetry(telemetry.clone());
        self.telemetry = telemetry;
        self
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        self.executor.registry()
    }

    pub fn executor(&self) -> &StepExecutor {
        &self.executor
    }

    pub fn validate(&self, raw: &Value) -> Result<Plan, PlanStructureError> {
        let result = PlanValidator::new(self.registry()).validate(raw);
        match &result {
            Ok(plan) => {
                tracing::info!(
                    steps = plan.len(),
                    calls = plan.call_count(),
                    "Plan validated"
                );
                self.telemetry.emit(
                    "plan.validated",
                    json!({ "steps": plan.len(), "calls": plan.call_count() }),
                );
            }
            Err(err) => {
                tracing::warn!(error = %err, "Plan rejected");
                self.telemetry
                    .emit("plan.rejected", json!({ "error": err.to_string() }));
            }
        }
        result
    }

    pub async fn run_plan(&self, plan: &Plan, cancel: &CancellationToken) -> PlanResults {
        let mut results = PlanResults::new();
        for (step, calls) in plan.steps() {
            tracing::debug!(step, calls = calls.len(), "Executing plan step");
            let outcomes = self.executor.execute_step(calls, cancel).await;
            tracing::debug!(
                step,
                failed = outcomes.iter().filter(|o| !o.is_success()).count(),
                "Plan step finished"
            );
            results.insert(step, outcomes);
        }
        results
    }

    pub async fn execute_raw(
        &self,
        raw: &Value,
        cancel: &CancellationToken,
    ) -> Result<PlanResults, PlanStructureError> {
        let plan = self.validate(raw)?;
        Ok(self.run_plan(&plan, cancel).await)
    }
}
