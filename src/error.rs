use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Structural rejection of a raw plan. Raised before any tool call runs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanStructureError {
    #[error("plan must be an object keyed by step number, got {0}")]
    NotAnObject(&'static str),

    #[error("cannot parse step number from '{0}'")]
    UnparseableStep(String),

    #[error("step number must be >= 1, got {0}")]
    NonPositiveStep(i64),

    #[error("duplicate step number {step} (key '{key}')")]
    DuplicateStep { step: u32, key: String },

    #[error("tool calls for step {0} must be a list or a single call object")]
    InvalidStepValue(u32),

    #[error("invalid tool call format in step {step}: missing '{field}'")]
    MissingField { step: u32, field: &'static str },

    #[error("invalid tool call format in step {step}: '{field}' must be {expected}")]
    InvalidField {
        step: u32,
        field: &'static str,
        expected: &'static str,
    },

    #[error("unknown tool in step {step}: {tool}")]
    UnknownTool { step: u32, tool: String },

    #[error("unknown function in step {step}: {tool}.{function}")]
    UnknownFunction {
        step: u32,
        tool: String,
        function: String,
    },
}

/// Kind of a per-call failure embedded in a step result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallErrorKind {
    UnknownTool,
    UnknownFunction,
    CallExecution,
    Timeout,
    Cancelled,
}

impl CallErrorKind {
    pub fn label(self) -> &'static str {
        match self {
            CallErrorKind::UnknownTool => "UnknownTool",
            CallErrorKind::UnknownFunction => "UnknownFunction",
            CallErrorKind::CallExecution => "CallExecution",
            CallErrorKind::Timeout => "Timeout",
            CallErrorKind::Cancelled => "Cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Provider,
    Session,
    Tooling,
    Plan,
    Input,
    Internal,
}

impl ErrorCategory {
    pub fn code(self) -> &'static str {
        match self {
            ErrorCategory::Provider => "PROVIDER",
            ErrorCategory::Session => "SESSION",
            ErrorCategory::Tooling => "TOOLING",
            ErrorCategory::Plan => "PLAN",
            ErrorCategory::Input => "INPUT",
            ErrorCategory::Internal => "INTERNAL",
        }
    }

    pub fn hint(self) -> &'static str {
        match self {
            ErrorCategory::Provider => {
                "Set the model API key (for example GROQ_API_KEY) or point --model-base-url at a reachable endpoint."
            }
            ErrorCategory::Session => {
                "Check --session-backend/--session-db-url and run `threatdesk migrate` for sqlite storage."
            }
            ErrorCategory::Tooling => {
                "Review tool data paths and API keys, then retry with RUST_LOG=info for tool logs."
            }
            ErrorCategory::Plan => {
                "The plan was rejected before execution. Check step keys, call fields, and tool names."
            }
            ErrorCategory::Input => "Run threatdesk --help and correct command arguments.",
            ErrorCategory::Internal => {
                "Retry with RUST_LOG=debug. If it persists, capture logs and open an issue."
            }
        }
    }
}

pub fn categorize_error(err: &anyhow::Error) -> ErrorCategory {
    if err.downcast_ref::<PlanStructureError>().is_some() {
        return ErrorCategory::Plan;
    }

    let msg = format!("{err:#}").to_ascii_lowercase();

    if msg.contains("api_key")
        || msg.contains("model endpoint")
        || msg.contains("provider")
    {
        return ErrorCategory::Provider;
    }

    if msg.contains("invalid value")
        || msg.contains("unknown argument")
        || msg.contains("failed to read input")
        || msg.contains("profile")
    {
        return ErrorCategory::Input;
    }

    if msg.contains("chat store") || msg.contains("sqlite") || msg.contains("migrate") {
        return ErrorCategory::Session;
    }

    if msg.contains("plan") {
        return ErrorCategory::Plan;
    }

    if msg.contains("tool") || msg.contains("virustotal") || msg.contains("mitre") {
        return ErrorCategory::Tooling;
    }

    ErrorCategory::Internal
}

pub fn format_cli_error(err: &anyhow::Error, show_sensitive_config: bool) -> String {
    let category = categorize_error(err);
    let rendered_error = render_error_message(err, show_sensitive_config);
    format!(
        "[{}] {}\nHint: {}",
        category.code(),
        rendered_error,
        category.hint()
    )
}

pub fn render_error_message(err: &anyhow::Error, show_sensitive_config: bool) -> String {
    let text = format!("{err:#}");
    if show_sensitive_config {
        text
    } else {
        redact_sensitive_text(&text)
    }
}

pub fn redact_sensitive_text(text: &str) -> String {
    redact_bearer_tokens(&redact_sqlite_urls(text))
}

pub fn redact_sqlite_urls(text: &str) -> String {
    const SQLITE_PREFIX: &str = "sqlite:";
    let mut out = String::with_capacity(text.len());
    let mut cursor = 0usize;

    while let Some(offset) = text[cursor..].find(SQLITE_PREFIX) {
        let start = cursor + offset;
        out.push_str(&text[cursor..start]);

        let remainder = &text[start..];
        let end = token_end(remainder);
        out.push_str(&redact_sqlite_url_value(&remainder[..end]));
        cursor = start + end;
    }

    out.push_str(&text[cursor..]);
    out
}

pub fn redact_sqlite_url_value(value: &str) -> String {
    if value.starts_with("sqlite://") {
        "sqlite://[REDACTED]".to_string()
    } else if value.starts_with("sqlite:") {
        "sqlite:[REDACTED]".to_string()
    } else {
        value.to_string()
    }
}

pub fn redact_bearer_tokens(text: &str) -> String {
    const BEARER_PREFIX: &str = "Bearer ";
    let mut out = String::with_capacity(text.len());
    let mut cursor = 0usize;

    while let Some(offset) = text[cursor..].find(BEARER_PREFIX) {
        let start = cursor + offset + BEARER_PREFIX.len();
        out.push_str(&text[cursor..start]);
        let end = token_end(&text[start..]);
        if end > 0 {
            out.push_str("[REDACTED]");
        }
        cursor = start + end;
    }

    out.push_str(&text[cursor..]);
    out
}

fn token_end(remainder: &str) -> usize {
    remainder
        .find(|ch: char| {
            ch.is_whitespace()
                || matches!(
                    ch,
                    '"' | '\'' | '(' | ')' | '[' | ']' | '{' | '}' | ',' | ';'
                )
        })
        .unwrap_or(remainder.len())
}
