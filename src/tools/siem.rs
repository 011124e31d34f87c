use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::tools::{FunctionSpec, SIEM_TOOL_NAME, Tool, ToolArgs, ToolError, unknown_function};

const DEFAULT_SEARCH_LIMIT: u64 = 10;
const DEFAULT_TOP_SOURCES: u64 = 5;
const MAX_TIMEFRAME_MINUTES: u64 = 60 * 24 * 365 * 100;

const FUNCTIONS: &[FunctionSpec] = &[
    FunctionSpec::new(
        "search_logs",
        &["keyword", "limit"],
        "log entries whose message contains the keyword",
    ),
    FunctionSpec::new(
        "get_alerts",
        &["severity", "timeframe"],
        "alerts filtered by severity (LOW/MEDIUM/HIGH) and/or the last N minutes",
    ),
    FunctionSpec::new("get_event_details", &["event_id"], "one event by id, e.g. E001"),
    FunctionSpec::new("get_top_sources", &["n"], "source IPs with the most events"),
    FunctionSpec::new("get_summary", &[], "event counts per severity"),
    FunctionSpec::new(
        "correlate_with_ioc",
        &["ioc"],
        "events mentioning an IOC (IP, domain, hash, username) in any common field",
    ),
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiemLog {
    pub event_id: String,
    pub timestamp: String,
    #[serde(default)]
    pub source_ip: Option<String>,
    #[serde(default)]
    pub destination_ip: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub severity: Option<String>,
    #[serde(default)]
    pub message: String,
}

impl SiemLog {
    fn timestamp_utc(&self) -> Option<DateTime<Utc>> {
        if let Ok(parsed) = DateTime::parse_from_rfc3339(&self.timestamp) {
            return Some(parsed.with_timezone(&Utc));
        }
        NaiveDateTime::parse_from_str(&self.timestamp, "%Y-%m-%dT%H:%M:%S%.f")
            .ok()
            .map(|naive| naive.and_utc())
    }

    fn severity_label(&self) -> String {
        self.severity
            .as_deref()
            .unwrap_or("UNKNOWN")
            .to_ascii_uppercase()
    }
}

/// Simulated SIEM over an in-memory log set. Read-only after construction.
pub struct SiemTool {
    logs: Vec<SiemLog>,
}

impl SiemTool {
    pub fn new(logs: Vec<SiemLog>) -> Self {
        Self { logs }
    }

    pub fn with_sample_logs() -> Self {
        Self::new(sample_logs())
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read SIEM logs '{}'", path.display()))?;
        let logs = serde_json::from_str::<Vec<SiemLog>>(&text)
            .with_context(|| format!("failed to parse SIEM logs '{}'", path.display()))?;
        Ok(Self::new(logs))
    }

    pub fn search_logs(&self, keyword: &str, limit: usize) -> Vec<&SiemLog> {
        let needle = keyword.to_lowercase();
        self.logs
            .iter()
            .filter(|log| log.message.to_lowercase().contains(&needle))
            .take(limit)
            .collect()
    }

    pub fn get_alerts(
        &self,
        severity: Option<&str>,
        timeframe_minutes: Option<u64>,
        now: DateTime<Utc>,
    ) -> Vec<&SiemLog> {
        let cutoff = timeframe_minutes
            .filter(|minutes| *minutes > 0)
            .map(|minutes| now - Duration::minutes(minutes.min(MAX_TIMEFRAME_MINUTES) as i64));
        self.logs
            .iter()
            .filter(|log| match severity.filter(|value| !value.is_empty()) {
                Some(wanted) => log.severity_label() == wanted.to_ascii_uppercase(),
                None => true,
            })
            .filter(|log| match cutoff {
                Some(cutoff) => log.timestamp_utc().is_some_and(|ts| ts >= cutoff),
                None => true,
            })
            .collect()
    }

    pub fn get_event_details(&self, event_id: &str) -> Option<&SiemLog> {
        self.logs.iter().find(|log| log.event_id == event_id)
    }

    /// Busiest source IPs first; ties broken by IP for a stable order.
    pub fn get_top_sources(&self, n: usize) -> Vec<(String, usize)> {
        let mut counts = HashMap::<&str, usize>::new();
        for source in self.logs.iter().filter_map(|log| log.source_ip.as_deref()) {
            *counts.entry(source).or_insert(0) += 1;
        }
        let mut ranked = counts
            .into_iter()
            .map(|(source, count)| (source.to_string(), count))
            .collect::<Vec<(String, usize)>>();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ranked.truncate(n);
        ranked
    }

    pub fn get_summary(&self) -> BTreeMap<String, usize> {
        let mut summary = BTreeMap::new();
        for log in &self.logs {
            *summary.entry(log.severity_label()).or_insert(0) += 1;
        }
        summary
    }

    pub fn correlate_with_ioc(&self, ioc: &str) -> Vec<&SiemLog> {
        let needle = ioc.to_lowercase();
        self.logs
            .iter()
            .filter(|log| {
                [
                    log.source_ip.as_deref(),
                    log.destination_ip.as_deref(),
                    log.user.as_deref(),
                    Some(log.message.as_str()),
                ]
                .into_iter()
                .flatten()
                .any(|field| field.to_lowercase().contains(&needle))
            })
            .collect()
    }
}

fn to_json<T: Serialize>(value: T) -> Result<Value, ToolError> {
    serde_json::to_value(value).map_err(|err| ToolError::Upstream(err.to_string()))
}

#[async_trait]
impl Tool for SiemTool {
    fn name(&self) -> &str {
        SIEM_TOOL_NAME
    }

    fn description(&self) -> &str {
        "Simulated SIEM log search, alerts and IOC correlation"
    }

    fn functions(&self) -> &[FunctionSpec] {
        FUNCTIONS
    }

    async fn call(&self, function: &str, args: ToolArgs) -> Result<Value, ToolError> {
        match function {
            "search_logs" => {
                args.ensure_only(&["keyword", "query", "limit"])?;
                let keyword = args.required_str(&["keyword", "query"])?;
                let limit = args.optional_u64("limit")?.unwrap_or(DEFAULT_SEARCH_LIMIT);
                to_json(self.search_logs(keyword, limit as usize))
            }
            "get_alerts" => {
                args.ensure_only(&["severity", "timeframe"])?;
                let severity = args.optional_str(&["severity"])?;
                let timeframe = args.optional_u64("timeframe")?;
                to_json(self.get_alerts(severity, timeframe, Utc::now()))
            }
            "get_event_details" => {
                args.ensure_only(&["event_id"])?;
                to_json(self.get_event_details(args.required_str(&["event_id"])?))
            }
            "get_top_sources" => {
                args.ensure_only(&["n"])?;
                let n = args.optional_u64("n")?.unwrap_or(DEFAULT_TOP_SOURCES);
                let ranked = self
                    .get_top_sources(n as usize)
                    .into_iter()
                    .map(|(source_ip, count)| json!({ "source_ip": source_ip, "count": count }))
                    .collect::<Vec<Value>>();
                Ok(Value::Array(ranked))
            }
            "get_summary" => {
                args.ensure_only(&[])?;
                to_json(self.get_summary())
            }
            "correlate_with_ioc" => {
                args.ensure_only(&["ioc"])?;
                let matches = self.correlate_with_ioc(args.required_str(&["ioc"])?);
                Ok(json!({ "count": matches.len(), "matches": to_json(matches)? }))
            }
            other => Err(unknown_function(SIEM_TOOL_NAME, other)),
        }
    }
}

pub fn sample_logs() -> Vec<SiemLog> {
    let entry = |event_id: &str, timestamp: &str, route: (&str, &str), user: &str, severity: &str, message: &str| {
        SiemLog {
            event_id: event_id.to_string(),
            timestamp: timestamp.to_string(),
            source_ip: Some(route.0.to_string()),
            destination_ip: Some(route.1.to_string()),
            user: Some(user.to_string()),
            severity: Some(severity.to_string()),
            message: message.to_string(),
        }
    };
    vec![
        entry(
            "E001",
            "2025-08-24T08:00:00",
            ("192.168.1.10", "10.0.0.5"),
            "admin",
            "HIGH",
            "Failed login attempt",
        ),
        entry(
            "E002",
            "2025-08-24T08:05:00",
            ("10.1.1.50", "10.0.0.5"),
            "guest",
            "HIGH",
            "SSL session reuse detected",
        ),
        entry(
            "E003",
            "2025-08-24T08:10:00",
            ("192.168.1.20", "10.0.0.6"),
            "admin",
            "LOW",
            "File download completed",
        ),
    ]
}
