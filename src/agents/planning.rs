use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::error::PlanStructureError;
use crate::llm::PlanGenerator;
use crate::planner::{Plan, PlanOrchestrator, PlanResults};
use crate::tools::ToolRegistry;

#[derive(Debug, Error)]
pub enum PlanningError {
    #[error("plan generation failed: {0:#}")]
    Generation(anyhow::Error),
    #[error("plan rejected: {0}")]
    Rejected(#[from] PlanStructureError),
}

/// Plan → validate → execute over one tool registry.
///
/// The knowledge and detection routes are both instances of this agent with
/// different registries and planner prompts.
pub struct PlanningAgent {
    name: &'static str,
    generator: Arc<dyn PlanGenerator>,
    orchestrator: PlanOrchestrator,
}

impl PlanningAgent {
    pub fn new(
        name: &'static str,
        generator: Arc<dyn PlanGenerator>,
        orchestrator: PlanOrchestrator,
    ) -> Self {
        Self {
            name,
            generator,
            orchestrator,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        self.orchestrator.registry()
    }

    pub fn orchestrator(&self) -> &PlanOrchestrator {
        &self.orchestrator
    }

    pub async fn plan(&self, query: &str) -> Result<Plan, PlanningError> {
        let raw = self
            .generator
            .generate(query, self.registry())
            .await
            .map_err(PlanningError::Generation)?;
        Ok(self.orchestrator.validate(&raw)?)
    }

    pub async fn plan_and_execute(
        &self,
        query: &str,
        cancel: &CancellationToken,
    ) -> Result<PlanResults, PlanningError> {
        let plan = self.plan(query).await?;
        tracing::info!(
            agent = self.name,
            steps = plan.len(),
            calls = plan.call_count(),
            "Executing plan"
        );
        let results = self.orchestrator.run_plan(&plan, cancel).await;
        if results.failure_count() > 0 {
            tracing::warn!(
                agent = self.name,
                failed = results.failure_count(),
                "Plan finished with failed calls"
            );
        }
        Ok(results)
    }
}
