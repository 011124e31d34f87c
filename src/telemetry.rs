use std::collections::{BTreeSet, HashMap};
use std::fs::OpenOptions;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use serde_json::{Value, json};

use crate::config::RuntimeConfig;

pub fn unix_ms_now() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
}

enum WriterMessage {
    Event(Value),
    Flush(mpsc::Sender<()>),
}

/// Append-only JSONL event stream. Cloned into every component that reports.
///
/// Records are handed to a dedicated writer thread so `emit` never touches the
/// filesystem from an async worker. Records from one sink keep their order.
#[derive(Debug, Clone)]
pub struct TelemetrySink {
    pub enabled: bool,
    pub path: PathBuf,
    pub run_id: String,
    pub command: String,
    writer: Option<mpsc::Sender<WriterMessage>>,
}

impl TelemetrySink {
    pub fn new(cfg: &RuntimeConfig, command: String) -> Self {
        let run_id = format!("run-{}-{}", unix_ms_now(), std::process::id());
        let path = PathBuf::from(&cfg.telemetry_path);
        let writer = if cfg.telemetry_enabled {
            spawn_writer(path.clone(), command.clone())
        } else {
            None
        };
        Self {
            enabled: cfg.telemetry_enabled && writer.is_some(),
            path,
            run_id,
            command,
            writer,
        }
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            path: PathBuf::new(),
            run_id: String::new(),
            command: String::new(),
            writer: None,
        }
    }

    pub fn emit(&self, event: &str, payload: Value) {
        let Some(writer) = self.writer.as_ref().filter(|_| self.enabled) else {
            return;
        };

        let mut record = serde_json::Map::new();
        record.insert("ts_unix_ms".to_string(), json!(unix_ms_now()));
        record.insert("event".to_string(), json!(event));
        record.insert("run_id".to_string(), json!(self.run_id));
        record.insert("command".to_string(), json!(self.command));

        if let Some(map) = payload.as_object() {
            for (key, value) in map {
                record.insert(key.clone(), value.clone());
            }
        }

        if writer
            .send(WriterMessage::Event(Value::Object(record)))
            .is_err()
        {
            tracing::warn!(event = event, "telemetry writer stopped; event dropped");
        }
    }

    /// Blocks until every event emitted before this call is on disk.
    pub fn flush(&self) {
        let Some(writer) = self.writer.as_ref() else {
            return;
        };
        let (ack, done) = mpsc::channel();
        if writer.send(WriterMessage::Flush(ack)).is_ok() {
            let _ = done.recv();
        }
    }
}

fn spawn_writer(path: PathBuf, command: String) -> Option<mpsc::Sender<WriterMessage>> {
    let (sender, receiver) = mpsc::channel::<WriterMessage>();
    let spawned = std::thread::Builder::new()
        .name("telemetry-writer".to_string())
        .spawn(move || {
            for message in receiver {
                match message {
                    WriterMessage::Event(value) => {
                        if let Err(err) = append_event_line(&path, &command, &value) {
                            tracing::warn!(
                                path = %path.display(),
                                error = %err,
                                "telemetry write failed"
                            );
                        }
                    }
                    WriterMessage::Flush(ack) => {
                        let _ = ack.send(());
                    }
                }
            }
        });
    match spawned {
        Ok(_) => Some(sender),
        Err(err) => {
            tracing::warn!(error = %err, "failed to start telemetry writer; telemetry disabled");
            None
        }
    }
}

fn append_event_line(path: &Path, command: &str, value: &Value) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).with_context(|| {
            format!(
                "failed to create telemetry directory '{}'",
                parent.display()
            )
        })?;
    }

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open telemetry path '{}'", path.display()))?;

    serde_json::to_writer(&mut file, value)
        .with_context(|| format!("failed to serialize telemetry event for '{command}'"))?;
    writeln!(file).context("failed to write telemetry newline")
}

#[derive(Debug, Default)]
pub struct TelemetrySummary {
    pub total_lines: usize,
    pub parsed_events: usize,
    pub parse_errors: usize,
    pub unique_runs: BTreeSet<String>,
    pub command_counts: HashMap<String, usize>,
    pub plan_validated: usize,
    pub plan_rejected: usize,
    pub tool_requested: usize,
    pub tool_succeeded: usize,
    pub tool_failed: usize,
    pub tool_failure_kinds: HashMap<String, usize>,
    pub turns_completed: usize,
    pub turn_routes: HashMap<String, usize>,
    pub last_event_ts_unix_ms: Option<u128>,
}

pub fn summarize_telemetry_lines(lines: Vec<String>, limit: usize) -> TelemetrySummary {
    let mut summary = TelemetrySummary::default();
    let max_events = limit.max(1);
    summary.total_lines = lines.len();

    for line in lines.into_iter().rev().take(max_events) {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let parsed = match serde_json::from_str::<Value>(line) {
            Ok(value) => value,
            Err(_) => {
                summary.parse_errors += 1;
                continue;
            }
        };

        summary.parsed_events += 1;

        if let Some(run_id) = parsed.get("run_id").and_then(Value::as_str)
            && !run_id.is_empty()
        {
            summary.unique_runs.insert(run_id.to_string());
        }

        if let Some(command) = parsed.get("command").and_then(Value::as_str)
            && !command.is_empty()
        {
            *summary
                .command_counts
                .entry(command.to_string())
                .or_insert(0) += 1;
        }

        if let Some(ts) = parsed.get("ts_unix_ms").and_then(Value::as_u64) {
            let ts_u128 = ts as u128;
            summary.last_event_ts_unix_ms = Some(
                summary
                    .last_event_ts_unix_ms
                    .map(|existing| existing.max(ts_u128))
                    .unwrap_or(ts_u128),
            );
        }

        match parsed
            .get("event")
            .and_then(Value::as_str)
            .unwrap_or_default()
        {
            "plan.validated" => summary.plan_validated += 1,
            "plan.rejected" => summary.plan_rejected += 1,
            "tool.requested" => summary.tool_requested += 1,
            "tool.succeeded" => summary.tool_succeeded += 1,
            "tool.failed" => {
                summary.tool_failed += 1;
                if let Some(kind) = parsed.get("kind").and_then(Value::as_str) {
                    *summary
                        .tool_failure_kinds
                        .entry(kind.to_string())
                        .or_insert(0) += 1;
                }
            }
            "turn.completed" => {
                summary.turns_completed += 1;
                if let Some(route) = parsed.get("route").and_then(Value::as_str) {
                    *summary.turn_routes.entry(route.to_string()).or_insert(0) += 1;
                }
            }
            _ => {}
        }
    }

    summary
}

fn ranked(counts: &HashMap<String, usize>) -> Vec<(&String, &usize)> {
    let mut entries = counts.iter().collect::<Vec<_>>();
    entries.sort_by_key(|(name, count)| (std::cmp::Reverse(**count), (*name).clone()));
    entries
}

pub fn run_telemetry_report(
    cfg: &RuntimeConfig,
    path_override: Option<String>,
    limit: usize,
) -> Result<()> {
    let path = PathBuf::from(path_override.unwrap_or_else(|| cfg.telemetry_path.clone()));
    if !path.exists() {
        println!("No telemetry file found at '{}'.", path.display());
        return Ok(());
    }

    let file = std::fs::File::open(&path)
        .with_context(|| format!("failed to open telemetry file '{}'", path.display()))?;
    let reader = io::BufReader::new(file);
    let lines = reader
        .lines()
        .collect::<std::result::Result<Vec<String>, std::io::Error>>()
        .with_context(|| format!("failed to read telemetry file '{}'", path.display()))?;

    let summary = summarize_telemetry_lines(lines, limit);

    println!("Telemetry report");
    println!("Path: {}", path.display());
    println!("Lines in file: {}", summary.total_lines);
    println!(
        "Events analyzed: {} (parse_errors={})",
        summary.parsed_events, summary.parse_errors
    );
    println!("Unique runs: {}", summary.unique_runs.len());
    println!(
        "Plans: validated={} rejected={}",
        summary.plan_validated, summary.plan_rejected
    );
    println!(
        "Tool lifecycle: requested={} succeeded={} failed={}",
        summary.tool_requested, summary.tool_succeeded, summary.tool_failed
    );
    for (kind, count) in ranked(&summary.tool_failure_kinds) {
        println!("- failed ({kind}): {count}");
    }
    println!("Turns completed: {}", summary.turns_completed);
    for (route, count) in ranked(&summary.turn_routes) {
        println!("- {route}: {count}");
    }

    let commands = ranked(&summary.command_counts);
    if !commands.is_empty() {
        println!("Top commands:");
        for (name, count) in commands.into_iter().take(5) {
            println!("- {}: {}", name, count);
        }
    }

    if let Some(last_ts) = summary.last_event_ts_unix_ms {
        println!("Last event ts_unix_ms: {last_ts}");
    }

    Ok(())
}
