pub mod cve;
pub mod detection;
pub mod law;
pub mod mitre;
pub mod siem;
pub mod threat_intel;
pub mod web_search;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::config::RuntimeConfig;
use crate::llm::ChatModel;

pub const CVE_TOOL_NAME: &str = "CVE";
pub const MITRE_TOOL_NAME: &str = "MITRE";
pub const SIEM_TOOL_NAME: &str = "SIEM";
pub const THREAT_INTEL_TOOL_NAME: &str = "ThreatIntel";
pub const DETECTION_TOOL_NAME: &str = "DetectionTool";
pub const LAW_TOOL_NAME: &str = "MyanmarLaw";
pub const WEBSEARCH_TOOL_NAME: &str = "Websearch";

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("unknown function '{function}' for tool '{tool}'")]
    UnknownFunction { tool: String, function: String },

    #[error("invalid parameters: {0}")]
    InvalidParams(String),

    #[error("{0}")]
    Unavailable(String),

    #[error("upstream request failed: {0}")]
    Upstream(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for ToolError {
    fn from(err: reqwest::Error) -> Self {
        ToolError::Upstream(err.to_string())
    }
}

/// A callable exposed by a tool, as advertised to the plan generator.
#[derive(Debug, Clone, Copy)]
pub struct FunctionSpec {
    pub name: &'static str,
    pub params: &'static [&'static str],
    pub description: &'static str,
}

impl FunctionSpec {
    pub const fn new(
        name: &'static str,
        params: &'static [&'static str],
        description: &'static str,
    ) -> Self {
        Self {
            name,
            params,
            description,
        }
    }

    pub fn signature(&self) -> String {
        if self.params.is_empty() {
            return format!("{}: {{}} (no params)", self.name);
        }
        let params = self
            .params
            .iter()
            .map(|param| format!("\"{param}\": \"...\""))
            .collect::<Vec<String>>()
            .join(", ");
        format!("{}: {{{}}}", self.name, params)
    }
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    fn functions(&self) -> &[FunctionSpec];

    fn has_function(&self, function: &str) -> bool {
        self.functions().iter().any(|spec| spec.name == function)
    }

    async fn call(&self, function: &str, args: ToolArgs) -> Result<Value, ToolError>;
}

pub fn unknown_function(tool: &str, function: &str) -> ToolError {
    ToolError::UnknownFunction {
        tool: tool.to_string(),
        function: function.to_string(),
    }
}

/// Keyword arguments of a single call. Mismatches surface as `InvalidParams`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolArgs(Map<String, Value>);

impl ToolArgs {
    pub fn new(params: Map<String, Value>) -> Self {
        Self(params)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn ensure_only(&self, allowed: &[&str]) -> Result<(), ToolError> {
        let mut unexpected = self
            .0
            .keys()
            .filter(|key| !allowed.contains(&key.as_str()))
            .cloned()
            .collect::<Vec<String>>();
        if unexpected.is_empty() {
            return Ok(());
        }
        unexpected.sort();
        Err(ToolError::InvalidParams(format!(
            "unexpected keyword argument(s): {}",
            unexpected.join(", ")
        )))
    }

    /// First present name wins; later names are accepted aliases.
    pub fn optional_str(&self, names: &[&str]) -> Result<Option<&str>, ToolError> {
        for name in names {
            match self.0.get(*name) {
                None | Some(Value::Null) => continue,
                Some(Value::String(value)) => return Ok(Some(value.as_str())),
                Some(other) => {
                    return Err(ToolError::InvalidParams(format!(
                        "argument '{name}' must be a string, got {}",
                        json_type_name(other)
                    )));
                }
            }
        }
        Ok(None)
    }

    pub fn required_str(&self, names: &[&str]) -> Result<&str, ToolError> {
        self.optional_str(names)?.ok_or_else(|| {
            ToolError::InvalidParams(format!(
                "missing required argument '{}'",
                names.first().copied().unwrap_or("<unnamed>")
            ))
        })
    }

    pub fn optional_u64(&self, name: &str) -> Result<Option<u64>, ToolError> {
        match self.0.get(name) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Number(number)) => number.as_u64().map(Some).ok_or_else(|| {
                ToolError::InvalidParams(format!(
                    "argument '{name}' must be a non-negative integer"
                ))
            }),
            Some(Value::String(text)) => text.trim().parse::<u64>().map(Some).map_err(|_| {
                ToolError::InvalidParams(format!(
                    "argument '{name}' must be a non-negative integer, got '{text}'"
                ))
            }),
            Some(other) => Err(ToolError::InvalidParams(format!(
                "argument '{name}' must be an integer, got {}",
                json_type_name(other)
            ))),
        }
    }
}

pub fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a list",
        Value::Object(_) => "an object",
    }
}

/// Name → tool mapping shared read-only by every call of a request.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.register(tool);
        self
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        if self.tools.insert(name.clone(), tool).is_some() {
            tracing::warn!(tool = %name, "Tool registered twice; keeping the latest");
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(String::as_str).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Tool/function listing embedded in planner prompts.
    pub fn catalog(&self) -> String {
        let mut lines = Vec::new();
        for (name, tool) in &self.tools {
            lines.push(format!("- {name}: {}", tool.description()));
            for spec in tool.functions() {
                lines.push(format!("  - {} ({})", spec.signature(), spec.description));
            }
        }
        lines.join("\n")
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.names())
            .finish()
    }
}

/// Registry behind the knowledge agent: intel lookups, log search, law and web Q&A.
pub fn build_knowledge_registry(
    cfg: &RuntimeConfig,
    chat_model: Arc<dyn ChatModel>,
    search_model: Arc<dyn ChatModel>,
) -> Result<ToolRegistry> {
    let http = build_http_client(cfg)?;

    let mitre = mitre::MitreTool::load(Path::new(&cfg.mitre_data_dir));
    let siem = match cfg.siem_logs_path.as_deref() {
        Some(path) => siem::SiemTool::from_file(Path::new(path))?,
        None => siem::SiemTool::with_sample_logs(),
    };
    let threat_intel = match cfg.threat_intel_path.as_deref() {
        Some(path) => threat_intel::ThreatIntelTool::from_file(Path::new(path))?,
        None => threat_intel::ThreatIntelTool::new(Vec::new()),
    };
    let law = law::LawTool::new(
        chat_model,
        cfg.law_chat_model.clone(),
        cfg.law_text_path.clone().into(),
    );

    Ok(ToolRegistry::new()
        .with_tool(Arc::new(mitre))
        .with_tool(Arc::new(cve::CveTool::new(http, cfg.nvd_base_url.clone())))
        .with_tool(Arc::new(siem))
        .with_tool(Arc::new(threat_intel))
        .with_tool(Arc::new(web_search::WebSearchTool::new(
            search_model,
            cfg.web_search_model.clone(),
        )))
        .with_tool(Arc::new(law)))
}

/// Registry behind the detection agent.
pub fn build_detection_registry(cfg: &RuntimeConfig) -> Result<ToolRegistry> {
    let http = build_http_client(cfg)?;
    Ok(ToolRegistry::new().with_tool(Arc::new(detection::DetectionTool::new(
        http,
        std::env::var("VIRUSTOTAL_API_KEY")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty()),
        cfg.upload_dir.clone().into(),
    ))))
}

pub fn build_http_client(cfg: &RuntimeConfig) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(concat!("threatdesk/", env!("CARGO_PKG_VERSION")))
        .timeout(std::time::Duration::from_secs(cfg.tool_timeout_secs))
        .build()
        .context("failed to build tool HTTP client")
}
