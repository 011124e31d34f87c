use std::collections::BTreeMap;

use serde::ser::{SerializeMap, SerializeStruct};
use serde::{Serialize, Serializer};
use serde_json::{Map, Value, json};

use crate::error::CallErrorKind;

/// One planned invocation of `tool.function(**params)`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolCall {
    pub tool: String,
    pub function: String,
    pub params: Map<String, Value>,
}

impl ToolCall {
    pub fn new(
        tool: impl Into<String>,
        function: impl Into<String>,
        params: Map<String, Value>,
    ) -> Self {
        Self {
            tool: tool.into(),
            function: function.into(),
            params,
        }
    }

    pub fn label(&self) -> String {
        format!("{}.{}", self.tool, self.function)
    }
}

/// A validated plan: step number → calls that run concurrently.
///
/// Only the validator builds plans, so every step number is >= 1 and every
/// step holds at least the shape checks the validator enforces.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Plan {
    steps: BTreeMap<u32, Vec<ToolCall>>,
}

impl Plan {
    pub(crate) fn from_steps(steps: BTreeMap<u32, Vec<ToolCall>>) -> Self {
        Self { steps }
    }

    /// Steps in ascending numeric order.
    pub fn steps(&self) -> impl Iterator<Item = (u32, &[ToolCall])> {
        self.steps
            .iter()
            .map(|(step, calls)| (*step, calls.as_slice()))
    }

    pub fn step(&self, step: u32) -> Option<&[ToolCall]> {
        self.steps.get(&step).map(Vec::as_slice)
    }

    pub fn step_numbers(&self) -> Vec<u32> {
        self.steps.keys().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn call_count(&self) -> usize {
        self.steps.values().map(Vec::len).sum()
    }

    /// The raw shape a plan generator produces, suitable for re-validation.
    pub fn to_raw(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| json!({}))
    }
}

impl Serialize for Plan {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.steps.len()))?;
        for (step, calls) in &self.steps {
            map.serialize_entry(&step.to_string(), calls)?;
        }
        map.end()
    }
}

/// Failure of a single call, carried as data inside the step result.
#[derive(Debug, Clone, PartialEq)]
pub struct CallError {
    pub kind: CallErrorKind,
    pub message: String,
    pub tool: String,
    pub function: String,
}

impl CallError {
    pub fn new(kind: CallErrorKind, call: &ToolCall, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            tool: call.tool.clone(),
            function: call.function.clone(),
        }
    }
}

impl Serialize for CallError {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("CallError", 4)?;
        state.serialize_field("kind", self.kind.label())?;
        state.serialize_field("message", &self.message)?;
        state.serialize_field("tool", &self.tool)?;
        state.serialize_field("function", &self.function)?;
        state.end()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CallOutcome {
    Success(Value),
    Failed(CallError),
}

impl CallOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, CallOutcome::Success(_))
    }

    pub fn value(&self) -> Option<&Value> {
        match self {
            CallOutcome::Success(value) => Some(value),
            CallOutcome::Failed(_) => None,
        }
    }

    pub fn error(&self) -> Option<&CallError> {
        match self {
            CallOutcome::Success(_) => None,
            CallOutcome::Failed(err) => Some(err),
        }
    }
}

impl Serialize for CallOutcome {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            CallOutcome::Success(value) => value.serialize(serializer),
            CallOutcome::Failed(err) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("error", err)?;
                map.end()
            }
        }
    }
}

/// Step number → per-call outcomes in call order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct PlanResults {
    steps: BTreeMap<u32, Vec<CallOutcome>>,
}

impl PlanResults {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&mut self, step: u32, outcomes: Vec<CallOutcome>) {
        self.steps.insert(step, outcomes);
    }

    pub fn step(&self, step: u32) -> Option<&[CallOutcome]> {
        self.steps.get(&step).map(Vec::as_slice)
    }

    pub fn steps(&self) -> impl Iterator<Item = (u32, &[CallOutcome])> {
        self.steps
            .iter()
            .map(|(step, outcomes)| (*step, outcomes.as_slice()))
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn failure_count(&self) -> usize {
        self.steps
            .values()
            .flatten()
            .filter(|outcome| !outcome.is_success())
            .count()
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| json!({}))
    }

    /// Deterministic text handed to the response synthesizer.
    pub fn render(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|_| "{}".to_string())
    }
}
