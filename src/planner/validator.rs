//! Structural validation of raw plans produced by the plan generator.
//!
//! The generator is a language model, so nothing about the raw value is
//! trusted: keys may be `1`, `"1"` or `"step1"`, a step may be a bare call
//! object instead of a list, and any field may be missing or mistyped. The
//! validator either produces a normalized [`Plan`] or rejects the whole plan
//! before any tool runs.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::error::PlanStructureError;
use crate::planner::plan::{Plan, ToolCall};
use crate::tools::{ToolRegistry, json_type_name};

const REQUIRED_FIELDS: [&str; 3] = ["tool", "function", "params"];

pub struct PlanValidator<'a> {
    registry: &'a ToolRegistry,
}

impl<'a> PlanValidator<'a> {
    pub fn new(registry: &'a ToolRegistry) -> Self {
        Self { registry }
    }

    pub fn validate(&self, raw: &Value) -> Result<Plan, PlanStructureError> {
        let Value::Object(entries) = raw else {
            return Err(PlanStructureError::NotAnObject(json_type_name(raw)));
        };

        let mut steps = BTreeMap::<u32, Vec<ToolCall>>::new();
        for (key, value) in entries {
            let step = parse_step_number(key)?;
            let calls = match value {
                Value::Object(call) => vec![self.validate_call(step, call)?],
                Value::Array(items) => items
                    .iter()
                    .map(|item| match item {
                        Value::Object(call) => self.validate_call(step, call),
                        _ => Err(PlanStructureError::InvalidStepValue(step)),
                    })
                    .collect::<Result<Vec<ToolCall>, PlanStructureError>>()?,
                _ => return Err(PlanStructureError::InvalidStepValue(step)),
            };

            if steps.insert(step, calls).is_some() {
                return Err(PlanStructureError::DuplicateStep {
                    step,
                    key: key.clone(),
                });
            }
        }

        Ok(Plan::from_steps(steps))
    }

    fn validate_call(
        &self,
        step: u32,
        call: &Map<String, Value>,
    ) -> Result<ToolCall, PlanStructureError> {
        for field in REQUIRED_FIELDS {
            if !call.contains_key(field) {
                return Err(PlanStructureError::MissingField { step, field });
            }
        }

        let tool = string_field(step, call, "tool")?.trim().to_string();
        let function = callable_name(string_field(step, call, "function")?).to_string();
        let params = match call.get("params") {
            Some(Value::Object(params)) => params.clone(),
            _ => {
                return Err(PlanStructureError::InvalidField {
                    step,
                    field: "params",
                    expected: "an object",
                });
            }
        };

        let Some(tool_impl) = self.registry.get(&tool) else {
            return Err(PlanStructureError::UnknownTool { step, tool });
        };
        if !tool_impl.has_function(&function) {
            return Err(PlanStructureError::UnknownFunction {
                step,
                tool,
                function,
            });
        }

        Ok(ToolCall {
            tool,
            function,
            params,
        })
    }
}

fn string_field<'v>(
    step: u32,
    call: &'v Map<String, Value>,
    field: &'static str,
) -> Result<&'v str, PlanStructureError> {
    call.get(field)
        .and_then(Value::as_str)
        .ok_or(PlanStructureError::InvalidField {
            step,
            field,
            expected: "a string",
        })
}

/// `"detect_url: {\"url\": ...}"` → `"detect_url"`.
pub fn callable_name(function: &str) -> &str {
    function
        .split_once(':')
        .map(|(name, _)| name)
        .unwrap_or(function)
        .trim()
}

/// Extracts the step number embedded in a plan key.
///
/// The first run of ASCII digits is the number. A `-` directly before it is
/// a minus sign when it opens the key or follows a non-alphanumeric
/// character, so `"-2"` and `"step:-2"` are negative while `"step-3"` is 3.
pub fn parse_step_number(key: &str) -> Result<u32, PlanStructureError> {
    let trimmed = key.trim();
    let bytes = trimmed.as_bytes();
    let Some(start) = bytes.iter().position(u8::is_ascii_digit) else {
        return Err(PlanStructureError::UnparseableStep(key.to_string()));
    };
    let end = bytes[start..]
        .iter()
        .position(|byte| !byte.is_ascii_digit())
        .map(|offset| start + offset)
        .unwrap_or(bytes.len());

    let negative = start > 0
        && bytes[start - 1] == b'-'
        && (start == 1 || !bytes[start - 2].is_ascii_alphanumeric());

    let magnitude = trimmed[start..end]
        .parse::<u32>()
        .map_err(|_| PlanStructureError::UnparseableStep(key.to_string()))?;

    if negative && magnitude > 0 {
        return Err(PlanStructureError::NonPositiveStep(-i64::from(magnitude)));
    }
    if magnitude == 0 {
        return Err(PlanStructureError::NonPositiveStep(0));
    }
    Ok(magnitude)
}
