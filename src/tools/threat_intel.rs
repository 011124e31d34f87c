use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::tools::{
    FunctionSpec, THREAT_INTEL_TOOL_NAME, Tool, ToolArgs, ToolError, unknown_function,
};

const FUNCTIONS: &[FunctionSpec] = &[
    FunctionSpec::new("get_ip_reputation", &["ip"], "reputation of an IP address"),
    FunctionSpec::new("get_domain_reputation", &["domain"], "reputation of a domain"),
    FunctionSpec::new(
        "get_file_hash_reputation",
        &["sha256"],
        "reputation of a SHA-256 file hash",
    ),
    FunctionSpec::new(
        "get_active_threats",
        &[],
        "indicators that are malicious or rated HIGH",
    ),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IocType {
    #[serde(rename = "IP")]
    Ip,
    Domain,
    File,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntelEntry {
    pub ioc: String,
    #[serde(rename = "type")]
    pub ioc_type: IocType,
    pub reputation: String,
    #[serde(default)]
    pub last_seen: Option<String>,
    #[serde(default)]
    pub threat_level: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

pub struct ThreatIntelTool {
    entries: Vec<IntelEntry>,
}

impl ThreatIntelTool {
    pub fn new(entries: Vec<IntelEntry>) -> Self {
        Self { entries }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read threat intel DB '{}'", path.display()))?;
        let entries = serde_json::from_str::<Vec<IntelEntry>>(&text)
            .with_context(|| format!("failed to parse threat intel DB '{}'", path.display()))?;
        Ok(Self::new(entries))
    }

    /// IPs match exactly; domains and hashes ignore case.
    pub fn lookup(&self, ioc_type: IocType, ioc: &str) -> Value {
        let found = self.entries.iter().find(|entry| {
            entry.ioc_type == ioc_type
                && match ioc_type {
                    IocType::Ip => entry.ioc == ioc,
                    IocType::Domain | IocType::File => entry.ioc.eq_ignore_ascii_case(ioc),
                }
        });
        match found.map(serde_json::to_value) {
            Some(Ok(value)) => value,
            _ => json!({
                "ioc": ioc,
                "reputation": "unknown",
                "threat_level": "unknown",
                "description": "No data",
            }),
        }
    }

    pub fn active_threats(&self) -> Vec<&IntelEntry> {
        self.entries
            .iter()
            .filter(|entry| {
                entry.reputation == "malicious"
                    || entry
                        .threat_level
                        .as_deref()
                        .is_some_and(|level| level.eq_ignore_ascii_case("HIGH"))
            })
            .collect()
    }
}

#[async_trait]
impl Tool for ThreatIntelTool {
    fn name(&self) -> &str {
        THREAT_INTEL_TOOL_NAME
    }

    fn description(&self) -> &str {
        "Local IOC reputation database"
    }

    fn functions(&self) -> &[FunctionSpec] {
        FUNCTIONS
    }

    async fn call(&self, function: &str, args: ToolArgs) -> Result<Value, ToolError> {
        match function {
            "get_ip_reputation" => {
                args.ensure_only(&["ip"])?;
                Ok(self.lookup(IocType::Ip, args.required_str(&["ip"])?))
            }
            "get_domain_reputation" => {
                args.ensure_only(&["domain"])?;
                Ok(self.lookup(IocType::Domain, args.required_str(&["domain"])?))
            }
            "get_file_hash_reputation" => {
                args.ensure_only(&["sha256", "hash"])?;
                Ok(self.lookup(IocType::File, args.required_str(&["sha256", "hash"])?))
            }
            "get_active_threats" => {
                args.ensure_only(&[])?;
                serde_json::to_value(self.active_threats())
                    .map_err(|err| ToolError::Upstream(err.to_string()))
            }
            other => Err(unknown_function(THREAT_INTEL_TOOL_NAME, other)),
        }
    }
}
