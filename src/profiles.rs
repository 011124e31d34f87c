use anyhow::Result;

use crate::config::{ProfilesFile, RuntimeConfig, display_session_db_url};

pub fn run_profiles_list(profiles: &ProfilesFile, cfg: &RuntimeConfig) -> Result<()> {
    let mut names = profiles.profiles.keys().cloned().collect::<Vec<String>>();
    if !names.iter().any(|name| name == "default") {
        names.push("default".to_string());
    }
    names.sort();

    println!("Configured profiles (active='{}'):", cfg.profile);
    for name in names {
        let marker = if name == cfg.profile { "*" } else { " " };
        let source = if profiles.profiles.contains_key(&name) {
            "configured"
        } else {
            "implicit"
        };
        println!("{marker} {name} ({source})");
    }

    Ok(())
}

fn or_placeholder(value: Option<&str>, placeholder: &'static str) -> String {
    value.unwrap_or(placeholder).to_string()
}

pub fn run_profiles_show(cfg: &RuntimeConfig) -> Result<()> {
    println!("Active profile: {}", cfg.profile);
    println!("Config path: {}", cfg.config_path);
    println!("Model endpoint: {}", cfg.model_base_url);
    println!("Model API key env: {}", cfg.model_api_key_env);
    println!("Model timeout (secs): {}", cfg.model_timeout_secs);
    println!("Chat model: {}", cfg.chat_model);
    println!("Casual model: {}", cfg.casual_model);
    println!("Utility model: {}", cfg.util_model);
    println!("Vision model: {}", cfg.vision_model);
    println!("Web search model: {}", cfg.web_search_model);
    println!("Law model: {}", cfg.law_chat_model);
    println!(
        "Reasoning effort: {}",
        or_placeholder(cfg.reasoning_effort.as_deref(), "<model-default>")
    );
    println!("Confidence threshold: {}", cfg.confidence_threshold);
    println!("Tool timeout (secs): {}", cfg.tool_timeout_secs);
    println!("MITRE data dir: {}", cfg.mitre_data_dir);
    println!("Law text path: {}", cfg.law_text_path);
    println!(
        "SIEM logs path: {}",
        or_placeholder(cfg.siem_logs_path.as_deref(), "<built-in sample>")
    );
    println!(
        "Threat intel path: {}",
        or_placeholder(cfg.threat_intel_path.as_deref(), "<not configured>")
    );
    println!("NVD base URL: {}", cfg.nvd_base_url);
    println!("Upload dir: {}", cfg.upload_dir);
    println!("Session backend: {:?}", cfg.session_backend);
    println!("Session DB URL: {}", display_session_db_url(cfg));
    println!("Auth tokens configured: {}", cfg.auth_tokens.len());
    println!("Server bind: {}:{}", cfg.server_host, cfg.server_port);
    println!("Telemetry enabled: {}", cfg.telemetry_enabled);
    println!("Telemetry path: {}", cfg.telemetry_path);
    Ok(())
}
