//! Plan validation and execution.
//!
//! A raw plan from the plan generator goes through [`PlanValidator`], then
//! [`PlanOrchestrator`] runs its steps in ascending order, handing each step to
//! [`StepExecutor`] which runs the step's calls concurrently.

pub mod executor;
pub mod orchestrator;
pub mod plan;
pub mod validator;

pub use executor::{DEFAULT_CALL_TIMEOUT, StepExecutor};
pub use orchestrator::PlanOrchestrator;
pub use plan::{CallError, CallOutcome, Plan, PlanResults, ToolCall};
pub use validator::{PlanValidator, callable_name, parse_step_number};
