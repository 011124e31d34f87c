use std::io::Read;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::agents::{build_model_client, orchestrator_for};
use crate::cli::RegistryKind;
use crate::config::RuntimeConfig;
use crate::planner::PlanOrchestrator;
use crate::telemetry::TelemetrySink;
use crate::tools::{ToolRegistry, build_detection_registry, build_knowledge_registry};

pub fn build_registry(cfg: &RuntimeConfig, kind: RegistryKind) -> Result<ToolRegistry> {
    match kind {
        RegistryKind::Knowledge => {
            let model = build_model_client(cfg)?;
            build_knowledge_registry(cfg, model.clone(), model)
        }
        RegistryKind::Detection => build_detection_registry(cfg),
    }
}

/// Reads a raw plan from a file, or stdin when `source` is `-`.
pub fn read_plan_source(source: &str) -> Result<Value> {
    let text = if source == "-" {
        let mut buffer = String::new();
        std::io::stdin()
            .read_to_string(&mut buffer)
            .context("failed to read plan from stdin")?;
        buffer
    } else {
        std::fs::read_to_string(source)
            .with_context(|| format!("failed to read plan file '{source}'"))?
    };
    parse_plan_text(&text).with_context(|| format!("invalid plan JSON in '{source}'"))
}

pub fn parse_plan_text(text: &str) -> Result<Value> {
    Ok(serde_json::from_str::<Value>(text.trim())?)
}

fn plan_orchestrator(
    cfg: &RuntimeConfig,
    kind: RegistryKind,
    telemetry: &TelemetrySink,
) -> Result<PlanOrchestrator> {
    Ok(orchestrator_for(
        build_registry(cfg, kind)?,
        Duration::from_secs(cfg.tool_timeout_secs),
        telemetry,
    ))
}

pub fn run_plan_validate(
    cfg: &RuntimeConfig,
    source: &str,
    kind: RegistryKind,
    telemetry: &TelemetrySink,
) -> Result<()> {
    let raw = read_plan_source(source)?;
    let orchestrator = plan_orchestrator(cfg, kind, telemetry)?;
    let plan = orchestrator.validate(&raw).with_context(|| {
        format!("plan rejected by the {} registry", kind.label())
    })?;
    println!(
        "Plan OK ({} steps, {} calls, registry={})",
        plan.len(),
        plan.call_count(),
        kind.label()
    );
    println!("{}", serde_json::to_string_pretty(&plan)?);
    Ok(())
}

pub async fn run_plan_execute(
    cfg: &RuntimeConfig,
    source: &str,
    kind: RegistryKind,
    telemetry: &TelemetrySink,
) -> Result<()> {
    let raw = read_plan_source(source)?;
    let orchestrator = plan_orchestrator(cfg, kind, telemetry)?;
    let cancel = CancellationToken::new();
    let results = orchestrator
        .execute_raw(&raw, &cancel)
        .await
        .with_context(|| format!("plan rejected by the {} registry", kind.label()))?;
    println!("{}", results.render());
    let failures = results.failure_count();
    if failures > 0 {
        eprintln!("{failures} call(s) failed; see the error entries above.");
    }
    Ok(())
}

pub fn run_tools_list(cfg: &RuntimeConfig, kind: RegistryKind) -> Result<()> {
    let registry = build_registry(cfg, kind)?;
    println!(
        "Registry '{}' ({} tools):",
        kind.label(),
        registry.len()
    );
    println!("{}", registry.catalog());
    Ok(())
}
