use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::agents::image::DEFAULT_VISION_MODEL;
use crate::agents::knowledge::DEFAULT_CONFIDENCE_THRESHOLD;
use crate::cli::*;
use crate::llm::openai::DEFAULT_BASE_URL;
use crate::tools::cve::DEFAULT_NVD_BASE_URL;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 8787;

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub profile: String,
    pub config_path: String,
    pub model_base_url: String,
    pub model_api_key_env: String,
    pub model_timeout_secs: u64,
    pub chat_model: String,
    pub casual_model: String,
    pub util_model: String,
    pub vision_model: String,
    pub web_search_model: String,
    pub law_chat_model: String,
    pub reasoning_effort: Option<String>,
    pub confidence_threshold: f64,
    pub tool_timeout_secs: u64,
    pub mitre_data_dir: String,
    pub law_text_path: String,
    pub siem_logs_path: Option<String>,
    pub threat_intel_path: Option<String>,
    pub nvd_base_url: String,
    pub upload_dir: String,
    pub session_backend: SessionBackend,
    pub session_db_url: String,
    pub show_sensitive_config: bool,
    pub telemetry_enabled: bool,
    pub telemetry_path: String,
    pub auth_tokens: Vec<String>,
    pub server_host: String,
    pub server_port: u16,
}

impl RuntimeConfig {
    /// Reads the key from the configured env var; blank values count as unset.
    pub fn model_api_key(&self) -> Option<String> {
        std::env::var(&self.model_api_key_env)
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProfilesFile {
    #[serde(default)]
    pub profiles: HashMap<String, ProfileConfig>,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProfileConfig {
    pub model_base_url: Option<String>,
    pub model_api_key_env: Option<String>,
    pub model_timeout_secs: Option<u64>,
    pub chat_model: Option<String>,
    pub casual_model: Option<String>,
    pub util_model: Option<String>,
    pub vision_model: Option<String>,
    pub web_search_model: Option<String>,
    pub law_chat_model: Option<String>,
    pub reasoning_effort: Option<String>,
    pub confidence_threshold: Option<f64>,
    pub tool_timeout_secs: Option<u64>,
    pub mitre_data_dir: Option<String>,
    pub law_text_path: Option<String>,
    pub siem_logs_path: Option<String>,
    pub threat_intel_path: Option<String>,
    pub nvd_base_url: Option<String>,
    pub upload_dir: Option<String>,
    pub session_backend: Option<SessionBackend>,
    pub session_db_url: Option<String>,
    pub telemetry_enabled: Option<bool>,
    pub telemetry_path: Option<String>,
    #[serde(default)]
    pub auth_tokens: Vec<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
}

pub fn load_profiles(config_path: &str) -> Result<ProfilesFile> {
    let path = Path::new(config_path);
    if !path.exists() {
        return Ok(ProfilesFile::default());
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read profile config file at '{}'", path.display()))?;
    toml::from_str::<ProfilesFile>(&content).with_context(|| {
        format!(
            "invalid profile configuration in '{}'. Check session/model values and field names.",
            path.display()
        )
    })
}

fn merge_unique_names(first: &[String], second: &[String]) -> Vec<String> {
    let mut seen = BTreeSet::<String>::new();
    let mut merged = Vec::<String>::new();

    for name in first.iter().chain(second.iter()) {
        let trimmed = name.trim();
        if trimmed.is_empty() {
            continue;
        }
        if seen.insert(trimmed.to_string()) {
            merged.push(trimmed.to_string());
        }
    }

    merged
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub fn resolve_runtime_config(cli: &Cli, profiles: &ProfilesFile) -> Result<RuntimeConfig> {
    let selected = cli.profile.trim();
    if selected.is_empty() {
        return Err(anyhow::anyhow!(
            "profile name cannot be empty. Set --profile <name>."
        ));
    }

    let profile = if selected == "default" && !profiles.profiles.contains_key("default") {
        ProfileConfig::default()
    } else {
        profiles.profiles.get(selected).cloned().ok_or_else(|| {
            let mut names = profiles.profiles.keys().cloned().collect::<Vec<String>>();
            names.sort();
            if names.is_empty() {
                anyhow::anyhow!(
                    "profile '{}' not found in '{}'. No profiles are defined yet.",
                    selected,
                    cli.config_path
                )
            } else {
                anyhow::anyhow!(
                    "profile '{}' not found in '{}'. Available profiles: {}",
                    selected,
                    cli.config_path,
                    names.join(", ")
                )
            }
        })?
    };

    let confidence_threshold = cli
        .confidence_threshold
        .or(profile.confidence_threshold)
        .unwrap_or(DEFAULT_CONFIDENCE_THRESHOLD);
    if !(0.0..=1.0).contains(&confidence_threshold) {
        return Err(anyhow::anyhow!(
            "invalid value for confidence threshold: {confidence_threshold} (expected 0.0-1.0)"
        ));
    }

    Ok(RuntimeConfig {
        profile: selected.to_string(),
        config_path: cli.config_path.clone(),
        model_base_url: cli
            .model_base_url
            .clone()
            .or(profile.model_base_url)
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
        model_api_key_env: cli
            .model_api_key_env
            .clone()
            .or(profile.model_api_key_env)
            .unwrap_or_else(|| "GROQ_API_KEY".to_string()),
        model_timeout_secs: cli
            .model_timeout_secs
            .or(profile.model_timeout_secs)
            .unwrap_or(120)
            .max(1),
        chat_model: cli
            .chat_model
            .clone()
            .or(profile.chat_model)
            .unwrap_or_else(|| "openai/gpt-oss-120b".to_string()),
        casual_model: cli
            .casual_model
            .clone()
            .or(profile.casual_model)
            .unwrap_or_else(|| "openai/gpt-oss-20b".to_string()),
        util_model: cli
            .util_model
            .clone()
            .or(profile.util_model)
            .unwrap_or_else(|| "openai/gpt-oss-20b".to_string()),
        vision_model: cli
            .vision_model
            .clone()
            .or(profile.vision_model)
            .unwrap_or_else(|| DEFAULT_VISION_MODEL.to_string()),
        web_search_model: cli
            .web_search_model
            .clone()
            .or(profile.web_search_model)
            .unwrap_or_else(|| "compound-beta".to_string()),
        law_chat_model: cli
            .law_chat_model
            .clone()
            .or(profile.law_chat_model)
            .unwrap_or_else(|| "openai/gpt-oss-120b".to_string()),
        reasoning_effort: non_empty(cli.reasoning_effort.clone().or(profile.reasoning_effort)),
        confidence_threshold,
        tool_timeout_secs: cli
            .tool_timeout_secs
            .or(profile.tool_timeout_secs)
            .unwrap_or(45)
            .max(1),
        mitre_data_dir: cli
            .mitre_data_dir
            .clone()
            .or(profile.mitre_data_dir)
            .unwrap_or_else(|| "data/mitre".to_string()),
        law_text_path: cli
            .law_text_path
            .clone()
            .or(profile.law_text_path)
            .unwrap_or_else(|| "data/myanmar_cyber_law.txt".to_string()),
        siem_logs_path: non_empty(cli.siem_logs_path.clone().or(profile.siem_logs_path)),
        threat_intel_path: non_empty(cli.threat_intel_path.clone().or(profile.threat_intel_path)),
        nvd_base_url: cli
            .nvd_base_url
            .clone()
            .or(profile.nvd_base_url)
            .unwrap_or_else(|| DEFAULT_NVD_BASE_URL.to_string()),
        upload_dir: cli
            .upload_dir
            .clone()
            .or(profile.upload_dir)
            .unwrap_or_else(|| "uploads".to_string()),
        session_backend: cli
            .session_backend
            .or(profile.session_backend)
            .unwrap_or(SessionBackend::Sqlite),
        session_db_url: cli
            .session_db_url
            .clone()
            .or(profile.session_db_url)
            .unwrap_or_else(|| "sqlite://.threatdesk/chats.db".to_string()),
        show_sensitive_config: cli.show_sensitive_config,
        telemetry_enabled: cli
            .telemetry_enabled
            .or(profile.telemetry_enabled)
            .unwrap_or(true),
        telemetry_path: cli
            .telemetry_path
            .clone()
            .or(profile.telemetry_path)
            .unwrap_or_else(|| ".threatdesk/telemetry/events.jsonl".to_string()),
        auth_tokens: merge_unique_names(&profile.auth_tokens, &cli.auth_token),
        server_host: profile.host.unwrap_or_else(|| DEFAULT_HOST.to_string()),
        server_port: profile.port.unwrap_or(DEFAULT_PORT),
    })
}

pub fn display_session_db_url(cfg: &RuntimeConfig) -> String {
    if cfg.show_sensitive_config {
        cfg.session_db_url.clone()
    } else {
        format!(
            "{} (set --show-sensitive-config to reveal)",
            crate::error::redact_sqlite_url_value(&cfg.session_db_url)
        )
    }
}
